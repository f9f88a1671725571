use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::PrivilegeLevel;

/// A provisioned database on one of the configured engines. Owned by the
/// database controller; the user-role reconciler only reads its status.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "postgresql.dev",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "pgdb",
    status = "DatabaseStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// The engine this database lives on.
    pub engine_configuration: EngineConfigurationRef,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfigurationRef {
    pub name: String,

    /// Defaults to the namespace of the Database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl EngineConfigurationRef {
    pub fn effective_namespace<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => fallback,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default)]
    pub ready: bool,

    /// Name of the created database on the engine.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,

    /// The per-database group roles login roles get granted into.
    #[serde(default)]
    pub roles: DatabaseRoles,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoles {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub writer: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reader: String,
}

impl DatabaseRoles {
    /// The group role backing the given privilege level.
    pub fn for_privilege(&self, privilege: PrivilegeLevel) -> &str {
        match privilege {
            PrivilegeLevel::Owner => &self.owner,
            PrivilegeLevel::Writer => &self.writer,
            PrivilegeLevel::Reader => &self.reader,
        }
    }
}
