//! Converges the login role itself on every engine: existence, attributes,
//! password, and the grant that keeps the operator in control of it.

use postgresql_operator_crd::{RoleAttributes, UserRole, UserRolePhase};
use snafu::Snafu;

use crate::{
    pg::{
        self, DEFAULT_BYPASS_RLS, DEFAULT_CONNECTION_LIMIT, DEFAULT_REPLICATION,
        LiveRoleAttributes, RoleAttributeUpdate,
    },
    resolve::ResolvedDependencies,
    work_secret::WorkIdentity,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to converge role {role} on engine {engine}"))]
    Engine {
        source: pg::Error,
        role: String,
        engine: String,
    },
}

pub struct RoleConvergence {
    /// The canonical login name reported by the engines. Differs from the
    /// requested one only on engines that decorate login names.
    pub canonical_username: String,

    /// Engine keys the role was freshly created on.
    pub created_on: Vec<String>,
}

/// Creates or aligns the login role on every resolved engine.
pub async fn converge_role(
    resolved: &ResolvedDependencies,
    user_role: &UserRole,
    identity: &WorkIdentity,
    password_changed: bool,
) -> Result<RoleConvergence, Error> {
    let wanted = wanted_attributes(user_role.spec.role_attributes.as_ref());
    let first_pass = user_role.status_or_default().phase == UserRolePhase::None;

    let mut canonical_username = identity.username.clone();
    let mut created_on = Vec::new();

    for (engine_key, engine) in &resolved.engines {
        let context = |source| Error::Engine {
            source,
            role: identity.username.clone(),
            engine: engine_key.clone(),
        };

        if !engine
            .role_exists(&identity.username)
            .await
            .map_err(context)?
        {
            let canonical = engine
                .create_login_role(&identity.username, &identity.password, &wanted)
                .await
                .map_err(context)?;
            if canonical != identity.username {
                canonical_username = canonical;
            }
            created_on.push(engine_key.clone());
            // Attributes and password are part of the create; the operator
            // grant follows on the next pass.
            continue;
        }

        let current = engine
            .role_attributes(&identity.username)
            .await
            .map_err(context)?;
        let diff = attribute_diff(&wanted, &current);
        if !diff.is_empty() {
            engine
                .alter_role_attributes(&identity.username, &diff)
                .await
                .map_err(context)?;
        }

        if password_changed || first_pass {
            engine
                .set_password(&identity.username, &identity.password)
                .await
                .map_err(context)?;
        }

        // Keeps the operator able to reassign and drop the role later.
        let admin_option = resolved
            .engine_configs
            .get(engine_key)
            .is_some_and(|config| config.spec.allow_grant_admin_option);
        engine
            .grant_role(&identity.username, engine.current_user(), admin_option)
            .await
            .map_err(context)?;
    }

    Ok(RoleConvergence {
        canonical_username,
        created_on,
    })
}

/// The sparse update applied on creation: exactly the attributes the spec
/// pins down.
fn wanted_attributes(attributes: Option<&RoleAttributes>) -> RoleAttributeUpdate {
    let Some(attributes) = attributes else {
        return RoleAttributeUpdate::default();
    };
    RoleAttributeUpdate {
        connection_limit: attributes.connection_limit,
        replication: attributes.replication,
        bypass_rls: attributes.bypass_rls,
    }
}

/// Minimal change set bringing `current` in line with `wanted`. Unpinned
/// attributes drift back to the engine defaults.
fn attribute_diff(wanted: &RoleAttributeUpdate, current: &LiveRoleAttributes) -> RoleAttributeUpdate {
    let mut diff = RoleAttributeUpdate::default();

    diff.connection_limit = match wanted.connection_limit {
        Some(limit) if limit != current.connection_limit => Some(limit),
        Some(_) => None,
        None if current.connection_limit != DEFAULT_CONNECTION_LIMIT => {
            Some(DEFAULT_CONNECTION_LIMIT)
        }
        None => None,
    };

    diff.replication = match wanted.replication {
        Some(replication) if replication != current.replication => Some(replication),
        Some(_) => None,
        None if current.replication != DEFAULT_REPLICATION => Some(DEFAULT_REPLICATION),
        None => None,
    };

    diff.bypass_rls = match wanted.bypass_rls {
        Some(bypass) if bypass != current.bypass_rls => Some(bypass),
        Some(_) => None,
        None if current.bypass_rls != DEFAULT_BYPASS_RLS => Some(DEFAULT_BYPASS_RLS),
        None => None,
    };

    diff
}
