//! Resolves the collaborators of a [`UserRole`]: linked databases, their
//! engine configurations, and live engine handles.
//!
//! Handles and privilege groups share one deterministic engine key, so every
//! later stage sees the same partitioning of the declared privileges.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use kube::{Api, Client, ResourceExt};
use postgresql_operator_crd::{Database, EngineConfiguration, PrivilegeSpec, UserRole, UserRolePhase};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::pg::{self, EngineFactory, PgEngine};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    MissingNamespace,

    #[snafu(display("failed to get database {namespace}/{name}"))]
    GetDatabase {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("database {namespace}/{name} not found"))]
    DatabaseNotFound { namespace: String, name: String },

    #[snafu(display("failed to get engine configuration {namespace}/{name}"))]
    GetEngineConfiguration {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("engine configuration {namespace}/{name} not found"))]
    EngineConfigurationNotFound { namespace: String, name: String },

    #[snafu(display("failed to list user roles"))]
    ListUserRoles { source: kube::Error },

    #[snafu(display("failed to open engine {engine}"))]
    OpenEngine { source: pg::Error, engine: String },
}

/// Read access to the collaborator resources.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn database(&self, namespace: &str, name: &str)
    -> Result<Option<Database>, kube::Error>;

    async fn engine_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EngineConfiguration>, kube::Error>;

    /// All UserRole objects in the cluster, for the prefix-uniqueness check.
    async fn user_roles(&self) -> Result<Vec<UserRole>, kube::Error>;
}

pub struct KubeResourceFetcher {
    client: Client,
}

impl KubeResourceFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceFetcher for KubeResourceFetcher {
    async fn database(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Database>, kube::Error> {
        Api::<Database>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn engine_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EngineConfiguration>, kube::Error> {
        Api::<EngineConfiguration>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn user_roles(&self) -> Result<Vec<UserRole>, kube::Error> {
        let list = Api::<UserRole>::all(self.client.clone())
            .list(&Default::default())
            .await?;
        Ok(list.items)
    }
}

/// One privilege entry together with the database it resolved to.
#[derive(Clone)]
pub struct PrivilegeBinding {
    pub database: Database,
    pub privilege: PrivilegeSpec,
}

#[derive(Default)]
pub struct ResolvedDependencies {
    pub engine_configs: BTreeMap<String, EngineConfiguration>,
    pub engines: BTreeMap<String, Arc<dyn PgEngine>>,
    pub privilege_groups: BTreeMap<String, Vec<PrivilegeBinding>>,
}

pub enum Resolution {
    Resolved(ResolvedDependencies),

    /// A referenced database is not ready yet and this object has never been
    /// reconciled. Requeue without flagging an error.
    AwaitDatabase { namespace: String, name: String },
}

/// The deterministic `(name, effective namespace)` pair partitioning
/// databases and handles across engines.
pub fn engine_key(name: &str, namespace: &str) -> String {
    format!("{namespace}/{name}")
}

/// Resolves every privilege of the spec. With `ignore_not_found` (the
/// deletion and post-teardown paths) missing collaborators are skipped
/// instead of failing the pass.
pub async fn resolve_dependencies(
    fetcher: &dyn ResourceFetcher,
    factory: &dyn EngineFactory,
    user_role: &UserRole,
    ignore_not_found: bool,
) -> Result<Resolution, Error> {
    let fallback_namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let first_pass = user_role.status_or_default().phase == UserRolePhase::None;

    let mut resolved = ResolvedDependencies::default();

    for privilege in &user_role.spec.privileges {
        let database_namespace = privilege
            .database_ref
            .effective_namespace(&fallback_namespace);
        let database_name = &privilege.database_ref.name;

        let database = fetcher
            .database(database_namespace, database_name)
            .await
            .context(GetDatabaseSnafu {
                namespace: database_namespace,
                name: database_name,
            })?;
        let Some(database) = database else {
            if ignore_not_found {
                continue;
            }
            return DatabaseNotFoundSnafu {
                namespace: database_namespace,
                name: database_name,
            }
            .fail();
        };

        // Only the very first pass waits for database readiness; later ones
        // proceed, the engine is usually usable while the database object's
        // bookkeeping is still settling.
        let ready = database
            .status
            .as_ref()
            .is_some_and(|status| status.ready);
        if !ready && first_pass && !ignore_not_found {
            return Ok(Resolution::AwaitDatabase {
                namespace: database_namespace.to_owned(),
                name: database_name.clone(),
            });
        }

        let engine_ref = &database.spec.engine_configuration;
        let engine_namespace = engine_ref.effective_namespace(database_namespace);
        let key = engine_key(&engine_ref.name, engine_namespace);

        if !resolved.engine_configs.contains_key(&key) {
            let config = fetcher
                .engine_configuration(engine_namespace, &engine_ref.name)
                .await
                .context(GetEngineConfigurationSnafu {
                    namespace: engine_namespace,
                    name: &engine_ref.name,
                })?;
            let Some(config) = config else {
                if ignore_not_found {
                    continue;
                }
                return EngineConfigurationNotFoundSnafu {
                    namespace: engine_namespace,
                    name: &engine_ref.name,
                }
                .fail();
            };

            let engine = factory
                .open(&config)
                .await
                .context(OpenEngineSnafu { engine: &key })?;
            resolved.engine_configs.insert(key.clone(), config);
            resolved.engines.insert(key.clone(), engine);
        }

        resolved
            .privilege_groups
            .entry(key)
            .or_default()
            .push(PrivilegeBinding {
                database,
                privilege: privilege.clone(),
            });
    }

    Ok(Resolution::Resolved(resolved))
}
