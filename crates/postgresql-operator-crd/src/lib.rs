//! Custom resource definitions for the postgresql-operator.
//!
//! [`UserRole`] is the resource reconciled by this operator. [`Database`] and
//! [`EngineConfiguration`] are owned by their respective controllers; only the
//! parts of their surface the user-role reconciler consumes are modelled here.

mod database;
mod engine_configuration;
mod user_role;

pub use database::*;
pub use engine_configuration::*;
pub use user_role::*;

pub const APP_NAME: &str = "postgresql-operator";
pub const API_GROUP: &str = "postgresql.dev";

/// Finalizer attached to every [`UserRole`] so roles are reaped before the
/// object disappears.
pub const USER_ROLE_FINALIZER: &str = "userroles.postgresql.dev";

/// Keys of the work secret, the record of the currently intended identity.
pub const USERNAME_KEY: &str = "USERNAME";
pub const PASSWORD_KEY: &str = "PASSWORD";

/// Keys of the per-privilege output secrets. Replica endpoints repeat the
/// same set prefixed with `REPLICA_<i>_`.
pub const URL_KEY: &str = "POSTGRES_URL";
pub const URL_ARGS_KEY: &str = "POSTGRES_URL_ARGS";
pub const LOGIN_KEY: &str = "LOGIN";
pub const DATABASE_KEY: &str = "DATABASE";
pub const HOST_KEY: &str = "HOST";
pub const PORT_KEY: &str = "PORT";
pub const ARGS_KEY: &str = "ARGS";

/// Key under which an [`EngineConfiguration`]s admin secret stores the
/// password of the administrative login.
pub const ADMIN_PASSWORD_KEY: &str = "PASSWORD";
