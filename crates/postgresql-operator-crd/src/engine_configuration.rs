use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ConnectionType;

/// Connection information for one PostgreSQL engine. Owned by the engine
/// controller; the user-role reconciler reads the admin access data and the
/// consumer-facing endpoints.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "postgresql.dev",
    version = "v1alpha1",
    kind = "EngineConfiguration",
    plural = "engineconfigurations",
    shortname = "pgengine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfigurationSpec {
    /// Host the operator connects to for administrative statements.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Administrative login of the operator.
    pub user: String,

    /// Secret holding the `PASSWORD` of the administrative login.
    pub secret_name: String,

    /// Maintenance database administrative connections are opened against.
    #[serde(default = "default_database")]
    pub default_database: String,

    /// Whether roles granted to the operator login carry `WITH ADMIN OPTION`.
    #[serde(default)]
    pub allow_grant_admin_option: bool,

    /// Endpoints handed out to consumers through output secrets.
    pub user_connections: UserConnections,
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_owned()
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnections {
    pub primary_connection: ConnectionInfo,

    /// Connection pooler front-end, if one is deployed for this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bouncer_connection: Option<ConnectionInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_connections: Vec<ConnectionInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_bouncer_connections: Vec<ConnectionInfo>,
}

impl UserConnections {
    /// The primary endpoint for the given connection type. `None` when a
    /// bouncer is requested but the engine has none configured.
    pub fn connection(&self, connection_type: ConnectionType) -> Option<&ConnectionInfo> {
        match connection_type {
            ConnectionType::Primary => Some(&self.primary_connection),
            ConnectionType::Bouncer => self.bouncer_connection.as_ref(),
        }
    }

    /// The replica endpoints of the same kind as the primary selection.
    pub fn replicas(&self, connection_type: ConnectionType) -> &[ConnectionInfo] {
        match connection_type {
            ConnectionType::Primary => &self.replica_connections,
            ConnectionType::Bouncer => &self.replica_bouncer_connections,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Pre-assembled URI arguments, e.g. `sslmode=require`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri_args: String,
}
