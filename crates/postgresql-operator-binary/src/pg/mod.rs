//! The capability port towards a PostgreSQL engine.
//!
//! Everything the reconciler does against an engine goes through
//! [`PgEngine`]; [`postgres::PostgresEngine`] is the production
//! implementation. Handles are opened per engine and pass through an
//! [`EngineFactory`] so the reconcile logic never deals with connection
//! setup itself.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use postgresql_operator_crd::EngineConfiguration;
use snafu::Snafu;

pub mod postgres;

/// Engines report `-1` as "no connection limit".
pub const DEFAULT_CONNECTION_LIMIT: i32 = -1;
pub const DEFAULT_REPLICATION: bool = false;
pub const DEFAULT_BYPASS_RLS: bool = false;

/// PostgreSQL truncates identifiers beyond `NAMEDATALEN - 1` bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to connect to engine {engine}"))]
    Connect { source: sqlx::Error, engine: String },

    #[snafu(display("failed to execute {statement} statement"))]
    Execute {
        source: sqlx::Error,
        statement: &'static str,
    },

    #[snafu(display("failed to query {what}"))]
    Query {
        source: sqlx::Error,
        what: &'static str,
    },

    #[snafu(display("role {role} does not exist"))]
    UnknownRole { role: String },

    #[snafu(display("engine configuration {engine} has no namespace"))]
    MissingNamespace { engine: String },

    #[snafu(display("failed to get admin secret {secret}"))]
    AdminSecret { source: kube::Error, secret: String },

    #[snafu(display("admin secret {secret} is missing the {key} key"))]
    AdminPassword { secret: String, key: &'static str },
}

/// Live attribute values of an existing role, as the engine reports them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveRoleAttributes {
    pub connection_limit: i32,
    pub replication: bool,
    pub bypass_rls: bool,
}

/// A sparse attribute change set. `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoleAttributeUpdate {
    pub connection_limit: Option<i32>,
    pub replication: Option<bool>,
    pub bypass_rls: Option<bool>,
}

impl RoleAttributeUpdate {
    pub fn is_empty(&self) -> bool {
        self.connection_limit.is_none() && self.replication.is_none() && self.bypass_rls.is_none()
    }
}

/// A per-database `SET role` session default of a login role.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct DatabaseDefaultRole {
    pub database: String,
    pub role: String,
}

/// Operations the reconciler needs from a PostgreSQL engine.
///
/// All mutations are idempotent at this surface: re-issuing a grant or a
/// session default that is already in place must not fail.
#[async_trait]
pub trait PgEngine: Send + Sync {
    async fn role_exists(&self, name: &str) -> Result<bool, Error>;

    /// Creates a login role and returns its canonical name. Engines that
    /// decorate login names (e.g. managed clouds appending a suffix) report
    /// the decorated name here; it is what all later calls must use.
    async fn create_login_role(
        &self,
        name: &str,
        password: &str,
        attributes: &RoleAttributeUpdate,
    ) -> Result<String, Error>;

    async fn role_attributes(&self, name: &str) -> Result<LiveRoleAttributes, Error>;

    async fn alter_role_attributes(
        &self,
        name: &str,
        update: &RoleAttributeUpdate,
    ) -> Result<(), Error>;

    async fn set_password(&self, name: &str, password: &str) -> Result<(), Error>;

    async fn drop_role(&self, name: &str) -> Result<(), Error>;

    async fn grant_role(&self, role: &str, member: &str, with_admin_option: bool)
    -> Result<(), Error>;

    async fn revoke_role(&self, role: &str, member: &str) -> Result<(), Error>;

    /// The group roles `name` is a member of.
    async fn role_memberships(&self, name: &str) -> Result<BTreeSet<String>, Error>;

    async fn database_default_roles(&self, name: &str) -> Result<Vec<DatabaseDefaultRole>, Error>;

    async fn set_database_default_role(
        &self,
        name: &str,
        role: &str,
        database: &str,
    ) -> Result<(), Error>;

    async fn reset_database_default_role(&self, name: &str, database: &str) -> Result<(), Error>;

    async fn has_active_session(&self, name: &str) -> Result<bool, Error>;

    /// Transfers everything `old_owner` owns within `database` to
    /// `new_owner`, then drops the remaining dependents. The role itself is
    /// left in place for [`PgEngine::drop_role`].
    async fn reassign_owned_and_drop(
        &self,
        old_owner: &str,
        new_owner: &str,
        database: &str,
    ) -> Result<(), Error>;

    /// Login of the operator's own connection.
    fn current_user(&self) -> &str;

    fn max_identifier_length(&self) -> usize {
        MAX_IDENTIFIER_LENGTH
    }
}

/// Opens [`PgEngine`] handles from an [`EngineConfiguration`].
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn open(&self, config: &EngineConfiguration) -> Result<Arc<dyn PgEngine>, Error>;
}
