//! [`PgEngine`] implementation over sqlx.
//!
//! Role DDL cannot use bind parameters, so statements are assembled with
//! [`quote_ident`]/[`quote_literal`]. Statements containing credentials are
//! never attached to errors.

use std::{fmt::Write, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use postgresql_operator_crd::{ADMIN_PASSWORD_KEY, EngineConfiguration};
use snafu::{OptionExt, ResultExt};
use sqlx::{
    ConnectOptions, Connection, PgPool,
    postgres::{PgConnectOptions, PgConnection, PgPoolOptions},
};
use std::collections::BTreeSet;

use super::{
    AdminPasswordSnafu, AdminSecretSnafu, ConnectSnafu, DatabaseDefaultRole, EngineFactory, Error,
    ExecuteSnafu, LiveRoleAttributes, MissingNamespaceSnafu, PgEngine, QuerySnafu,
    RoleAttributeUpdate, UnknownRoleSnafu,
};

pub struct PostgresEngine {
    pool: PgPool,
    connect_options: PgConnectOptions,
    current_user: String,
    engine: String,
}

impl PostgresEngine {
    /// Opens a small admin pool against the engine's maintenance database
    /// and resolves the operator's own login.
    pub async fn connect(connect_options: PgConnectOptions, engine: String) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options.clone())
            .await
            .context(ConnectSnafu { engine: &engine })?;

        let (current_user,): (String,) = sqlx::query_as("SELECT current_user::text")
            .fetch_one(&pool)
            .await
            .context(QuerySnafu {
                what: "current user",
            })?;

        Ok(Self {
            pool,
            connect_options,
            current_user,
            engine,
        })
    }

    async fn execute(&self, sql: &str, statement: &'static str) -> Result<(), Error> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .context(ExecuteSnafu { statement })?;
        Ok(())
    }
}

#[async_trait]
impl PgEngine for PostgresEngine {
    async fn role_exists(&self, name: &str) -> Result<bool, Error> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .context(QuerySnafu {
                    what: "role existence",
                })?;
        Ok(exists)
    }

    async fn create_login_role(
        &self,
        name: &str,
        password: &str,
        attributes: &RoleAttributeUpdate,
    ) -> Result<String, Error> {
        let mut sql = format!(
            "CREATE ROLE {} LOGIN ENCRYPTED PASSWORD {}",
            quote_ident(name),
            quote_literal(password),
        );
        push_attribute_clauses(&mut sql, attributes);
        self.execute(&sql, "CREATE ROLE").await?;
        // Plain PostgreSQL keeps the requested name. Suffix-decorating
        // engines would report their canonical form here.
        Ok(name.to_owned())
    }

    async fn role_attributes(&self, name: &str) -> Result<LiveRoleAttributes, Error> {
        let row: Option<(i32, bool, bool)> = sqlx::query_as(
            "SELECT rolconnlimit, rolreplication, rolbypassrls FROM pg_catalog.pg_roles WHERE rolname = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context(QuerySnafu {
            what: "role attributes",
        })?;

        let (connection_limit, replication, bypass_rls) =
            row.context(UnknownRoleSnafu { role: name })?;
        Ok(LiveRoleAttributes {
            connection_limit,
            replication,
            bypass_rls,
        })
    }

    async fn alter_role_attributes(
        &self,
        name: &str,
        update: &RoleAttributeUpdate,
    ) -> Result<(), Error> {
        if update.is_empty() {
            return Ok(());
        }
        let mut sql = format!("ALTER ROLE {}", quote_ident(name));
        push_attribute_clauses(&mut sql, update);
        self.execute(&sql, "ALTER ROLE").await
    }

    async fn set_password(&self, name: &str, password: &str) -> Result<(), Error> {
        let sql = format!(
            "ALTER ROLE {} WITH ENCRYPTED PASSWORD {}",
            quote_ident(name),
            quote_literal(password),
        );
        self.execute(&sql, "ALTER ROLE PASSWORD").await
    }

    async fn drop_role(&self, name: &str) -> Result<(), Error> {
        self.execute(&format!("DROP ROLE {}", quote_ident(name)), "DROP ROLE")
            .await
    }

    async fn grant_role(
        &self,
        role: &str,
        member: &str,
        with_admin_option: bool,
    ) -> Result<(), Error> {
        let mut sql = format!("GRANT {} TO {}", quote_ident(role), quote_ident(member));
        if with_admin_option {
            sql.push_str(" WITH ADMIN OPTION");
        }
        self.execute(&sql, "GRANT ROLE").await
    }

    async fn revoke_role(&self, role: &str, member: &str) -> Result<(), Error> {
        let sql = format!("REVOKE {} FROM {}", quote_ident(role), quote_ident(member));
        self.execute(&sql, "REVOKE ROLE").await
    }

    async fn role_memberships(&self, name: &str) -> Result<BTreeSet<String>, Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT g.rolname::text \
             FROM pg_catalog.pg_auth_members m \
             JOIN pg_catalog.pg_roles g ON g.oid = m.roleid \
             JOIN pg_catalog.pg_roles r ON r.oid = m.member \
             WHERE r.rolname = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu {
            what: "role memberships",
        })?;
        Ok(rows.into_iter().map(|(role,)| role).collect())
    }

    async fn database_default_roles(&self, name: &str) -> Result<Vec<DatabaseDefaultRole>, Error> {
        let rows: Vec<(String, Vec<String>)> = sqlx::query_as(
            "SELECT d.datname::text, s.setconfig \
             FROM pg_catalog.pg_db_role_setting s \
             JOIN pg_catalog.pg_roles r ON r.oid = s.setrole \
             JOIN pg_catalog.pg_database d ON d.oid = s.setdatabase \
             WHERE r.rolname = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu {
            what: "database session defaults",
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(database, setconfig)| {
                default_role_setting(&setconfig).map(|role| DatabaseDefaultRole { database, role })
            })
            .collect())
    }

    async fn set_database_default_role(
        &self,
        name: &str,
        role: &str,
        database: &str,
    ) -> Result<(), Error> {
        let sql = format!(
            "ALTER ROLE {} IN DATABASE {} SET role = {}",
            quote_ident(name),
            quote_ident(database),
            quote_literal(role),
        );
        self.execute(&sql, "ALTER ROLE SET role").await
    }

    async fn reset_database_default_role(&self, name: &str, database: &str) -> Result<(), Error> {
        let sql = format!(
            "ALTER ROLE {} IN DATABASE {} RESET role",
            quote_ident(name),
            quote_ident(database),
        );
        self.execute(&sql, "ALTER ROLE RESET role").await
    }

    async fn has_active_session(&self, name: &str) -> Result<bool, Error> {
        let (active,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_stat_activity WHERE usename = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .context(QuerySnafu {
                    what: "active sessions",
                })?;
        Ok(active)
    }

    async fn reassign_owned_and_drop(
        &self,
        old_owner: &str,
        new_owner: &str,
        database: &str,
    ) -> Result<(), Error> {
        // REASSIGN/DROP OWNED only act within the connected database, so a
        // short-lived connection is opened against the target one.
        let options = self.connect_options.clone().database(database);
        let mut conn: PgConnection = options.connect().await.context(ConnectSnafu {
            engine: format!("{engine} (database {database})", engine = self.engine),
        })?;

        let reassign = format!(
            "REASSIGN OWNED BY {} TO {}",
            quote_ident(old_owner),
            quote_ident(new_owner),
        );
        sqlx::query(&reassign)
            .execute(&mut conn)
            .await
            .context(ExecuteSnafu {
                statement: "REASSIGN OWNED",
            })?;

        let drop_owned = format!("DROP OWNED BY {}", quote_ident(old_owner));
        sqlx::query(&drop_owned)
            .execute(&mut conn)
            .await
            .context(ExecuteSnafu {
                statement: "DROP OWNED",
            })?;

        let _ = conn.close().await;
        Ok(())
    }

    fn current_user(&self) -> &str {
        &self.current_user
    }
}

/// Opens live engine handles, reading the admin password from the engine
/// configuration's secret.
pub struct PgEngineFactory {
    client: kube::Client,
}

impl PgEngineFactory {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EngineFactory for PgEngineFactory {
    async fn open(&self, config: &EngineConfiguration) -> Result<Arc<dyn PgEngine>, Error> {
        let name = config.name_any();
        let namespace = config.namespace().context(MissingNamespaceSnafu {
            engine: name.clone(),
        })?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get(&config.spec.secret_name)
            .await
            .context(AdminSecretSnafu {
                secret: &config.spec.secret_name,
            })?;
        let password = secret
            .data
            .as_ref()
            .and_then(|data| data.get(ADMIN_PASSWORD_KEY))
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
            .context(AdminPasswordSnafu {
                secret: &config.spec.secret_name,
                key: ADMIN_PASSWORD_KEY,
            })?;

        let options = PgConnectOptions::new()
            .host(&config.spec.host)
            .port(config.spec.port)
            .username(&config.spec.user)
            .password(&password)
            .database(&config.spec.default_database);

        let engine = PostgresEngine::connect(options, format!("{namespace}/{name}")).await?;
        Ok(Arc::new(engine))
    }
}

/// Quotes an SQL identifier, doubling any embedded quote.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes an SQL string literal, doubling any embedded quote.
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

fn push_attribute_clauses(sql: &mut String, update: &RoleAttributeUpdate) {
    if let Some(limit) = update.connection_limit {
        // Infallible for String
        let _ = write!(sql, " CONNECTION LIMIT {limit}");
    }
    if let Some(replication) = update.replication {
        sql.push_str(if replication {
            " REPLICATION"
        } else {
            " NOREPLICATION"
        });
    }
    if let Some(bypass_rls) = update.bypass_rls {
        sql.push_str(if bypass_rls { " BYPASSRLS" } else { " NOBYPASSRLS" });
    }
}

/// Extracts the target of a `role=...` entry from a `setconfig` array.
fn default_role_setting(setconfig: &[String]) -> Option<String> {
    setconfig.iter().find_map(|entry| {
        let value = entry.strip_prefix("role=")?;
        Some(value.trim_matches('"').trim_matches('\'').to_owned())
    })
}
