//! Synchronizes group-role memberships and per-database session defaults
//! with the declared privileges.
//!
//! The desired sets are computed up front, so iteration order never changes
//! the final state; grants and revokes are idempotent at the engine.

use std::collections::{BTreeMap, BTreeSet};

use snafu::Snafu;

use crate::{
    pg::{self, DatabaseDefaultRole},
    resolve::{PrivilegeBinding, ResolvedDependencies},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to synchronize privileges of {role} on engine {engine}"))]
    Engine {
        source: pg::Error,
        role: String,
        engine: String,
    },

    #[snafu(display(
        "database {database} reports no {privilege} group role; is it fully provisioned?"
    ))]
    MissingGroupRole {
        database: String,
        privilege: String,
    },
}

/// Grants, revokes and session defaults for one engine, derived from the
/// diff between the declared privileges and the live state.
#[derive(Debug, Default, Eq, PartialEq)]
struct PrivilegeChanges {
    grants: Vec<String>,
    revokes: Vec<String>,
    set_defaults: BTreeMap<String, String>,
    reset_defaults: Vec<String>,
}

/// Brings memberships and `SET role` login defaults of `username` in line
/// with the declared privileges on every engine.
pub async fn converge_privileges(
    resolved: &ResolvedDependencies,
    username: &str,
) -> Result<(), Error> {
    for (engine_key, bindings) in &resolved.privilege_groups {
        let Some(engine) = resolved.engines.get(engine_key) else {
            continue;
        };
        let context = |source| Error::Engine {
            source,
            role: username.to_owned(),
            engine: engine_key.clone(),
        };

        let (desired_memberships, desired_defaults) = desired_state(bindings)?;

        let current_memberships = engine.role_memberships(username).await.map_err(context)?;
        let current_defaults = engine
            .database_default_roles(username)
            .await
            .map_err(context)?;

        let changes = privilege_changes(
            &desired_memberships,
            &desired_defaults,
            &current_memberships,
            &current_defaults,
        );

        for group in &changes.grants {
            engine
                .grant_role(group, username, false)
                .await
                .map_err(context)?;
        }
        for (database, group) in &changes.set_defaults {
            engine
                .set_database_default_role(username, group, database)
                .await
                .map_err(context)?;
        }
        for group in &changes.revokes {
            engine
                .revoke_role(group, username)
                .await
                .map_err(context)?;
        }
        for database in &changes.reset_defaults {
            engine
                .reset_database_default_role(username, database)
                .await
                .map_err(context)?;
        }
    }

    Ok(())
}

/// The memberships and per-database defaults this engine's privileges ask
/// for.
fn desired_state(
    bindings: &[PrivilegeBinding],
) -> Result<(BTreeSet<String>, BTreeMap<String, String>), Error> {
    let mut memberships = BTreeSet::new();
    let mut defaults = BTreeMap::new();

    for binding in bindings {
        let status = binding.database.status.clone().unwrap_or_default();
        let group = status.roles.for_privilege(binding.privilege.privilege);
        if group.is_empty() || status.database.is_empty() {
            return MissingGroupRoleSnafu {
                database: &binding.privilege.database_ref.name,
                privilege: binding.privilege.privilege.to_string(),
            }
            .fail();
        }
        memberships.insert(group.to_owned());
        defaults.insert(status.database.clone(), group.to_owned());
    }

    Ok((memberships, defaults))
}

fn privilege_changes(
    desired_memberships: &BTreeSet<String>,
    desired_defaults: &BTreeMap<String, String>,
    current_memberships: &BTreeSet<String>,
    current_defaults: &[DatabaseDefaultRole],
) -> PrivilegeChanges {
    let current_defaults: BTreeMap<&str, &str> = current_defaults
        .iter()
        .map(|entry| (entry.database.as_str(), entry.role.as_str()))
        .collect();

    PrivilegeChanges {
        grants: desired_memberships
            .difference(current_memberships)
            .cloned()
            .collect(),
        revokes: current_memberships
            .difference(desired_memberships)
            .cloned()
            .collect(),
        set_defaults: desired_defaults
            .iter()
            .filter(|(database, group)| {
                current_defaults.get(database.as_str()) != Some(&group.as_str())
            })
            .map(|(database, group)| (database.clone(), group.clone()))
            .collect(),
        reset_defaults: current_defaults
            .keys()
            .filter(|database| !desired_defaults.contains_key(**database))
            .map(|database| (*database).to_owned())
            .collect(),
    }
}
