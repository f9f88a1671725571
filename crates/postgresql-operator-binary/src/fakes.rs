//! In-memory doubles for the trait seams, plus object builders used across
//! the test modules.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use postgresql_operator_crd::{
    ConnectionInfo, ConnectionType, Database, DatabaseRef, DatabaseRoles, DatabaseSpec,
    DatabaseStatus, EngineConfiguration, EngineConfigurationRef, EngineConfigurationSpec,
    PASSWORD_KEY, PrivilegeLevel, PrivilegeSpec, USERNAME_KEY, UserConnections, UserRole,
    UserRoleMode, UserRoleSpec,
};

use crate::{
    pg::{
        self, DatabaseDefaultRole, EngineFactory, LiveRoleAttributes, PgEngine,
        RoleAttributeUpdate, DEFAULT_BYPASS_RLS, DEFAULT_CONNECTION_LIMIT, DEFAULT_REPLICATION,
    },
    resolve::{ResourceFetcher, engine_key},
    secret_store::{Error as SecretError, SecretStore, is_controlled_by},
};

pub const OPERATOR_LOGIN: &str = "postgres-operator";

// ---------------------------------------------------------------------------
// Object builders

pub fn privilege(database: &str, secret: &str) -> PrivilegeSpec {
    PrivilegeSpec {
        database_ref: DatabaseRef {
            name: database.to_owned(),
            namespace: None,
        },
        privilege: PrivilegeLevel::Reader,
        connection_type: ConnectionType::Primary,
        generated_secret_name: secret.to_owned(),
        extra_uri_params: BTreeMap::new(),
    }
}

pub fn managed_user_role(prefix: &str) -> UserRole {
    let mut user_role = UserRole::new(
        "svc",
        UserRoleSpec {
            mode: UserRoleMode::Managed,
            role_prefix: Some(prefix.to_owned()),
            import_secret_ref: None,
            work_generated_secret_name: Some("svc-work".to_owned()),
            privileges: vec![privilege("orders", "orders-svc")],
            role_attributes: None,
            user_password_rotation_duration: None,
        },
    );
    user_role.metadata.namespace = Some("default".to_owned());
    user_role.metadata.uid = Some("uid-svc".to_owned());
    user_role
}

pub fn provided_user_role(import_secret: &str) -> UserRole {
    let mut user_role = UserRole::new(
        "svc",
        UserRoleSpec {
            mode: UserRoleMode::Provided,
            role_prefix: None,
            import_secret_ref: Some(import_secret.to_owned()),
            work_generated_secret_name: Some("svc-work".to_owned()),
            privileges: vec![privilege("orders", "orders-svc")],
            role_attributes: None,
            user_password_rotation_duration: None,
        },
    );
    user_role.metadata.namespace = Some("default".to_owned());
    user_role.metadata.uid = Some("uid-svc".to_owned());
    user_role
}

pub fn plain_secret(namespace: &str, name: &str, username: &str, password: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.namespace = Some(namespace.to_owned());
    secret.metadata.name = Some(name.to_owned());
    secret.data = Some(BTreeMap::from([
        (
            USERNAME_KEY.to_owned(),
            k8s_openapi::ByteString(username.as_bytes().to_vec()),
        ),
        (
            PASSWORD_KEY.to_owned(),
            k8s_openapi::ByteString(password.as_bytes().to_vec()),
        ),
    ]));
    secret
}

// ---------------------------------------------------------------------------
// Secret store

#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    inner: Arc<Mutex<BTreeMap<(String, String), Secret>>>,
    writes: Arc<Mutex<usize>>,
}

impl InMemorySecretStore {
    pub fn insert(&self, secret: Secret) {
        let key = (
            secret.namespace().unwrap_or_default(),
            secret.name_any(),
        );
        self.inner.lock().expect("poisoned").insert(key, secret);
    }

    pub fn get_sync(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.inner
            .lock()
            .expect("poisoned")
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .expect("poisoned")
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    /// Writes performed through the [`SecretStore`] surface.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().expect("poisoned")
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self.get_sync(namespace, name))
    }

    async fn apply(&self, secret: &Secret) -> Result<(), SecretError> {
        *self.writes.lock().expect("poisoned") += 1;
        self.insert(secret.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretError> {
        *self.writes.lock().expect("poisoned") += 1;
        self.remove(namespace, name);
        Ok(())
    }

    async fn list_owned(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Secret>, SecretError> {
        Ok(self
            .inner
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|((ns, _), secret)| ns == namespace && is_controlled_by(secret, owner_uid))
            .map(|(_, secret)| secret.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Resource fetcher

#[derive(Clone, Default)]
pub struct FakeFetcher {
    inner: Arc<Mutex<FetcherState>>,
}

#[derive(Default)]
struct FetcherState {
    databases: BTreeMap<(String, String), Database>,
    engine_configs: BTreeMap<(String, String), EngineConfiguration>,
    user_roles: Vec<UserRole>,
}

#[async_trait]
impl ResourceFetcher for FakeFetcher {
    async fn database(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Database>, kube::Error> {
        Ok(self
            .inner
            .lock()
            .expect("poisoned")
            .databases
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn engine_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EngineConfiguration>, kube::Error> {
        Ok(self
            .inner
            .lock()
            .expect("poisoned")
            .engine_configs
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn user_roles(&self) -> Result<Vec<UserRole>, kube::Error> {
        Ok(self.inner.lock().expect("poisoned").user_roles.clone())
    }
}

// ---------------------------------------------------------------------------
// Engine

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FakeRole {
    pub password: String,
    pub connection_limit: i32,
    pub replication: bool,
    pub bypass_rls: bool,
}

#[derive(Debug, Default)]
pub struct EngineState {
    pub roles: BTreeMap<String, FakeRole>,
    /// member -> group roles
    pub memberships: BTreeMap<String, BTreeSet<String>>,
    /// member -> database -> default role
    pub defaults: BTreeMap<String, BTreeMap<String, String>>,
    pub active_sessions: BTreeSet<String>,
    /// `(old_owner, new_owner, database)` reassignment calls
    pub reassigned: Vec<(String, String, String)>,
    /// Operations that actually changed engine state.
    pub mutations: usize,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("poisoned")
    }

    pub fn add_session(&self, role: &str) {
        self.state().active_sessions.insert(role.to_owned());
    }

    pub fn clear_session(&self, role: &str) {
        self.state().active_sessions.remove(role);
    }

    pub fn mutation_count(&self) -> usize {
        self.state().mutations
    }
}

#[async_trait]
impl PgEngine for FakeEngine {
    async fn role_exists(&self, name: &str) -> Result<bool, pg::Error> {
        Ok(self.state().roles.contains_key(name))
    }

    async fn create_login_role(
        &self,
        name: &str,
        password: &str,
        attributes: &RoleAttributeUpdate,
    ) -> Result<String, pg::Error> {
        let mut state = self.state();
        state.roles.insert(
            name.to_owned(),
            FakeRole {
                password: password.to_owned(),
                connection_limit: attributes
                    .connection_limit
                    .unwrap_or(DEFAULT_CONNECTION_LIMIT),
                replication: attributes.replication.unwrap_or(DEFAULT_REPLICATION),
                bypass_rls: attributes.bypass_rls.unwrap_or(DEFAULT_BYPASS_RLS),
            },
        );
        state.mutations += 1;
        Ok(name.to_owned())
    }

    async fn role_attributes(&self, name: &str) -> Result<LiveRoleAttributes, pg::Error> {
        let state = self.state();
        let role = state
            .roles
            .get(name)
            .ok_or_else(|| pg::Error::UnknownRole {
                role: name.to_owned(),
            })?;
        Ok(LiveRoleAttributes {
            connection_limit: role.connection_limit,
            replication: role.replication,
            bypass_rls: role.bypass_rls,
        })
    }

    async fn alter_role_attributes(
        &self,
        name: &str,
        update: &RoleAttributeUpdate,
    ) -> Result<(), pg::Error> {
        let mut state = self.state();
        let Some(role) = state.roles.get_mut(name) else {
            return Err(pg::Error::UnknownRole {
                role: name.to_owned(),
            });
        };
        let before = role.clone();
        if let Some(limit) = update.connection_limit {
            role.connection_limit = limit;
        }
        if let Some(replication) = update.replication {
            role.replication = replication;
        }
        if let Some(bypass) = update.bypass_rls {
            role.bypass_rls = bypass;
        }
        if *role != before {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn set_password(&self, name: &str, password: &str) -> Result<(), pg::Error> {
        let mut state = self.state();
        let Some(role) = state.roles.get_mut(name) else {
            return Err(pg::Error::UnknownRole {
                role: name.to_owned(),
            });
        };
        if role.password != password {
            role.password = password.to_owned();
            state.mutations += 1;
        }
        Ok(())
    }

    async fn drop_role(&self, name: &str) -> Result<(), pg::Error> {
        let mut state = self.state();
        state.roles.remove(name);
        state.memberships.remove(name);
        for groups in state.memberships.values_mut() {
            groups.remove(name);
        }
        state.defaults.remove(name);
        state.mutations += 1;
        Ok(())
    }

    async fn grant_role(
        &self,
        role: &str,
        member: &str,
        _with_admin_option: bool,
    ) -> Result<(), pg::Error> {
        let mut state = self.state();
        if state
            .memberships
            .entry(member.to_owned())
            .or_default()
            .insert(role.to_owned())
        {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn revoke_role(&self, role: &str, member: &str) -> Result<(), pg::Error> {
        let mut state = self.state();
        if state
            .memberships
            .entry(member.to_owned())
            .or_default()
            .remove(role)
        {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn role_memberships(&self, name: &str) -> Result<BTreeSet<String>, pg::Error> {
        Ok(self
            .state()
            .memberships
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn database_default_roles(
        &self,
        name: &str,
    ) -> Result<Vec<DatabaseDefaultRole>, pg::Error> {
        Ok(self
            .state()
            .defaults
            .get(name)
            .map(|defaults| {
                defaults
                    .iter()
                    .map(|(database, role)| DatabaseDefaultRole {
                        database: database.clone(),
                        role: role.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_database_default_role(
        &self,
        name: &str,
        role: &str,
        database: &str,
    ) -> Result<(), pg::Error> {
        let mut state = self.state();
        let previous = state
            .defaults
            .entry(name.to_owned())
            .or_default()
            .insert(database.to_owned(), role.to_owned());
        if previous.as_deref() != Some(role) {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn reset_database_default_role(
        &self,
        name: &str,
        database: &str,
    ) -> Result<(), pg::Error> {
        let mut state = self.state();
        if state
            .defaults
            .entry(name.to_owned())
            .or_default()
            .remove(database)
            .is_some()
        {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn has_active_session(&self, name: &str) -> Result<bool, pg::Error> {
        Ok(self.state().active_sessions.contains(name))
    }

    async fn reassign_owned_and_drop(
        &self,
        old_owner: &str,
        new_owner: &str,
        database: &str,
    ) -> Result<(), pg::Error> {
        let mut state = self.state();
        state.reassigned.push((
            old_owner.to_owned(),
            new_owner.to_owned(),
            database.to_owned(),
        ));
        state.mutations += 1;
        Ok(())
    }

    fn current_user(&self) -> &str {
        OPERATOR_LOGIN
    }
}

#[derive(Clone, Default)]
pub struct FakeEngineFactory {
    engines: Arc<Mutex<BTreeMap<String, FakeEngine>>>,
}

impl FakeEngineFactory {
    pub fn engine(&self, key: &str) -> FakeEngine {
        self.engines
            .lock()
            .expect("poisoned")
            .entry(key.to_owned())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn open(&self, config: &EngineConfiguration) -> Result<Arc<dyn PgEngine>, pg::Error> {
        let key = engine_key(
            &config.name_any(),
            &config.namespace().unwrap_or_default(),
        );
        Ok(Arc::new(self.engine(&key)))
    }
}

// ---------------------------------------------------------------------------
// World

/// One in-memory cluster: resources, secrets and engines.
#[derive(Clone, Default)]
pub struct World {
    fetcher: FakeFetcher,
    secrets: InMemorySecretStore,
    factory: FakeEngineFactory,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetcher(&self) -> FakeFetcher {
        self.fetcher.clone()
    }

    pub fn secrets(&self) -> InMemorySecretStore {
        self.secrets.clone()
    }

    pub fn engine_factory(&self) -> FakeEngineFactory {
        self.factory.clone()
    }

    /// The engine every database added via [`World::add_database`] lives on.
    pub fn engine(&self) -> FakeEngine {
        self.factory.engine("default/engine")
    }

    pub fn add_database(&self, namespace: &str, name: &str) {
        self.add_database_with_readiness(namespace, name, true);
    }

    pub fn add_unready_database(&self, namespace: &str, name: &str) {
        self.add_database_with_readiness(namespace, name, false);
    }

    fn add_database_with_readiness(&self, namespace: &str, name: &str, ready: bool) {
        let mut database = Database::new(
            name,
            DatabaseSpec {
                engine_configuration: EngineConfigurationRef {
                    name: "engine".to_owned(),
                    namespace: None,
                },
            },
        );
        database.metadata.namespace = Some(namespace.to_owned());
        database.status = Some(DatabaseStatus {
            ready,
            database: name.to_owned(),
            roles: DatabaseRoles {
                owner: format!("{name}-owner"),
                writer: format!("{name}-writer"),
                reader: format!("{name}-reader"),
            },
        });

        let mut state = self.fetcher.inner.lock().expect("poisoned");
        state
            .databases
            .insert((namespace.to_owned(), name.to_owned()), database);
        state
            .engine_configs
            .entry((namespace.to_owned(), "engine".to_owned()))
            .or_insert_with(|| engine_configuration(namespace));
    }

    pub fn add_peer(&self, peer: UserRole) {
        self.fetcher
            .inner
            .lock()
            .expect("poisoned")
            .user_roles
            .push(peer);
    }
}

fn engine_configuration(namespace: &str) -> EngineConfiguration {
    let mut config = EngineConfiguration::new(
        "engine",
        EngineConfigurationSpec {
            host: "pg.example".to_owned(),
            port: 5432,
            user: OPERATOR_LOGIN.to_owned(),
            secret_name: "pg-admin".to_owned(),
            default_database: "postgres".to_owned(),
            allow_grant_admin_option: false,
            user_connections: UserConnections {
                primary_connection: ConnectionInfo {
                    host: "pg.example".to_owned(),
                    port: 5432,
                    uri_args: "sslmode=require".to_owned(),
                },
                bouncer_connection: None,
                replica_connections: vec![],
                replica_bouncer_connections: vec![],
            },
        },
    );
    config.metadata.namespace = Some(namespace.to_owned());
    config
}
