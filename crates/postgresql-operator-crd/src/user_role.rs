use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// A declared PostgreSQL login role together with the database privileges it
/// holds and the connection secrets issued to its consumers.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "postgresql.dev",
    version = "v1alpha1",
    kind = "UserRole",
    plural = "userroles",
    shortname = "pgur",
    status = "UserRoleStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleSpec {
    /// Whether the operator manages the credentials (`Managed`) or imports
    /// them from a user-supplied secret (`Provided`).
    pub mode: UserRoleMode,

    /// Prefix of the generated login name. The active login is the prefix
    /// plus a `-0`/`-1` rotation slot. Required in `Managed` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_prefix: Option<String>,

    /// Name of the secret to import `USERNAME`/`PASSWORD` from. Required in
    /// `Provided` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_secret_ref: Option<String>,

    /// Name of the work secret recording the current identity. Assigned by
    /// the operator on the first pass and stable afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_generated_secret_name: Option<String>,

    /// Databases this role has access to, one output secret each.
    #[serde(default)]
    pub privileges: Vec<PrivilegeSpec>,

    /// Optional role attributes. Absent fields are kept at the engine
    /// defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_attributes: Option<RoleAttributes>,

    /// How often the generated password is rotated, e.g. `12h` or `30d`.
    /// Rotation flips the `-0`/`-1` slot of the login name. `Managed` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_password_rotation_duration: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum UserRoleMode {
    Managed,
    Provided,
}

/// Access to a single [`super::Database`], projected into one output secret.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegeSpec {
    /// The database the privilege applies to.
    pub database_ref: DatabaseRef,

    /// Which of the per-database group roles is granted.
    pub privilege: PrivilegeLevel,

    /// Whether consumers connect directly or through the connection pooler.
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Name of the connection secret created for this privilege.
    pub generated_secret_name: String,

    /// Extra `key=value` pairs appended to the connection URI arguments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_uri_params: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRef {
    pub name: String,

    /// Defaults to the namespace of the UserRole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl DatabaseRef {
    pub fn effective_namespace<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => fallback,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum PrivilegeLevel {
    Owner,
    Writer,
    Reader,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConnectionType {
    #[default]
    Primary,
    Bouncer,
}

/// Sparse set of PostgreSQL role attributes. `None` means "engine default".
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_limit: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<bool>,

    #[serde(default, rename = "bypassRLS", skip_serializing_if = "Option::is_none")]
    pub bypass_rls: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleStatus {
    #[serde(default)]
    pub phase: UserRolePhase,

    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// The currently active login name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postgres_role: String,

    /// The last reconciled role prefix. A spec prefix differing from this
    /// one triggers a username change.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_password_changed_time: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,

    /// Superseded login names still waiting to be dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_postgres_roles: Vec<String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum UserRolePhase {
    #[default]
    None,
    Created,
    Failed,
}

impl UserRole {
    pub fn status_or_default(&self) -> UserRoleStatus {
        self.status.clone().unwrap_or_default()
    }

    /// The work secret name from the spec, if it has been assigned yet.
    pub fn work_secret_name(&self) -> Option<&str> {
        self.spec
            .work_generated_secret_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Name the work secret gets on the first pass. Once written to the spec
    /// it is never changed again.
    pub fn default_work_secret_name(&self) -> String {
        format!("{name}-work", name = self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_managed_spec() {
        let spec: UserRoleSpec = serde_yaml::from_str(
            r#"
            mode: Managed
            rolePrefix: svc-x
            userPasswordRotationDuration: 1h
            privileges:
              - databaseRef:
                  name: orders
                privilege: Reader
                generatedSecretName: orders-svc-x
            "#,
        )
        .unwrap();

        assert_eq!(spec.mode, UserRoleMode::Managed);
        assert_eq!(spec.role_prefix.as_deref(), Some("svc-x"));
        let privilege = &spec.privileges[0];
        assert_eq!(privilege.privilege, PrivilegeLevel::Reader);
        // connectionType defaults to the direct engine connection
        assert_eq!(privilege.connection_type, ConnectionType::Primary);
        assert!(privilege.extra_uri_params.is_empty());
    }

    #[test]
    fn effective_namespace_falls_back_to_object_namespace() {
        let mut db_ref = DatabaseRef {
            name: "orders".to_owned(),
            namespace: None,
        };
        assert_eq!(db_ref.effective_namespace("default"), "default");

        db_ref.namespace = Some(String::new());
        assert_eq!(db_ref.effective_namespace("default"), "default");

        db_ref.namespace = Some("prod".to_owned());
        assert_eq!(db_ref.effective_namespace("default"), "prod");
    }

    #[test]
    fn status_defaults_to_none_phase() {
        let status = UserRoleStatus::default();
        assert_eq!(status.phase, UserRolePhase::None);
        assert!(!status.ready);
        assert!(status.old_postgres_roles.is_empty());
    }

    #[test]
    fn role_attributes_serialize_sparse() {
        let attrs = RoleAttributes {
            connection_limit: Some(10),
            ..RoleAttributes::default()
        };
        let yaml = serde_yaml::to_string(&attrs).unwrap();
        assert_eq!(yaml, "connectionLimit: 10\n");
    }
}
