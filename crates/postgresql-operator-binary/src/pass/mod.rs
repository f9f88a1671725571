//! One reconcile pass over a [`UserRole`].
//!
//! The declared step order is normative: validate, resolve, work secret,
//! reap, role, privileges, output secrets. Earlier mutations become visible
//! before later steps run; re-running a partially completed pass converges
//! onto the same final state. Everything here runs against the trait seams,
//! the controller supplies the live implementations.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use postgresql_operator_crd::{UserRole, UserRolePhase, UserRoleStatus};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    events::{EventReason, EventSeverity, PassEvent},
    output_secret::{self, project_output_secrets},
    pg::EngineFactory,
    privileges::{self, converge_privileges},
    reaper::{self, reap_roles},
    resolve::{self, Resolution, ResourceFetcher, resolve_dependencies},
    role_sync::{self, converge_role},
    secret_store::{self, SecretStore, secret_string},
    validation,
    work_secret::{self, WorkIdentity, persist_identity, reconcile_work_secret},
};

#[cfg(test)]
mod tests;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    MissingNamespace,

    #[snafu(display("failed to list user roles for the uniqueness check"))]
    ListUserRoles { source: kube::Error },

    #[snafu(display("failed to read import secret {name}"))]
    ReadImportSecret {
        source: secret_store::Error,
        name: String,
    },

    #[snafu(display("user role validation failed"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to resolve linked databases and engines"))]
    Resolve { source: resolve::Error },

    #[snafu(display("failed to reconcile the work secret"))]
    WorkSecret { source: work_secret::Error },

    #[snafu(display("failed to reap obsolete roles"))]
    Reap { source: reaper::Error },

    #[snafu(display("failed to converge the login role"))]
    RoleSync { source: role_sync::Error },

    #[snafu(display("failed to converge privileges"))]
    Privileges { source: privileges::Error },

    #[snafu(display("failed to project output secrets"))]
    OutputSecrets { source: output_secret::Error },

    #[snafu(display("failed to record the canonical login name"))]
    CanonicalName { source: work_secret::Error },
}

pub struct PassDeps<'a> {
    pub fetcher: &'a dyn ResourceFetcher,
    pub secrets: &'a dyn SecretStore,
    pub engines: &'a dyn EngineFactory,
}

pub enum PassOutcome {
    /// A referenced database is not ready and the object was never
    /// reconciled before: requeue without error and without status changes.
    AwaitDatabase { namespace: String, name: String },

    Converged(Box<PassReport>),
}

pub struct PassReport {
    /// The complete status to patch onto the object.
    pub status: UserRoleStatus,

    pub events: Vec<PassEvent>,

    /// A due rotation was skipped because its target name is still queued
    /// for reaping. Already reflected in `status`; the controller surfaces
    /// it as an error after patching.
    pub blocked_rotation: Option<String>,

    /// Time until the next password rotation is due, if one is configured.
    pub requeue_after: Option<std::time::Duration>,
}

pub struct DeletionReport {
    /// Roles that could not be dropped yet. Non-empty keeps the finalizer.
    pub remaining: Vec<String>,

    pub events: Vec<PassEvent>,
}

pub async fn run_pass(
    deps: &PassDeps<'_>,
    user_role: &UserRole,
    now: DateTime<Utc>,
) -> Result<PassOutcome, Error> {
    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let status = user_role.status_or_default();
    let mut events = Vec::new();

    // Validation first. The import secret and the peer listing feed the
    // provided-mode and uniqueness checks.
    let import_secret = match user_role.spec.import_secret_ref.as_deref() {
        Some(name) if !name.is_empty() => deps
            .secrets
            .get(&namespace, name)
            .await
            .context(ReadImportSecretSnafu { name })?,
        _ => None,
    };
    let peers = deps
        .fetcher
        .user_roles()
        .await
        .context(ListUserRolesSnafu)?;
    let import = validation::validate(user_role, import_secret.as_ref(), &peers)
        .context(ValidationSnafu)?;

    // Resolve the linked databases and engine handles.
    let resolution = resolve_dependencies(deps.fetcher, deps.engines, user_role, false)
        .await
        .context(ResolveSnafu)?;
    let resolved = match resolution {
        Resolution::AwaitDatabase { namespace, name } => {
            return Ok(PassOutcome::AwaitDatabase { namespace, name });
        }
        Resolution::Resolved(resolved) => resolved,
    };
    validation::validate_connections(&resolved).context(ValidationSnafu)?;

    // Derive the effective identity for this pass from the work secret.
    let outcome = reconcile_work_secret(deps.secrets, user_role, import.as_ref(), now)
        .await
        .context(WorkSecretSnafu)?;
    if outcome.username_changed || outcome.password_changed {
        events.push(PassEvent::updated(
            "RotateCredentials",
            format!(
                "credentials updated, active login is {username}",
                username = outcome.identity.username
            ),
        ));
    }

    // Reap: prior identities queue up behind the current one.
    let mut queue = status.old_postgres_roles.clone();
    if let Some(old) = &outcome.old_username {
        queue.push(old.clone());
    }
    queue.retain(|role| role != &outcome.identity.username);

    let reap = reap_roles(&resolved, &queue).await.context(ReapSnafu)?;
    for role in &reap.dropped {
        events.push(PassEvent::updated(
            "ReapRole",
            format!("dropped obsolete role {role}"),
        ));
    }
    for (role, engine) in &reap.deferred {
        events.push(PassEvent::warning(
            "ReapRole",
            format!("role {role} still has active sessions on engine {engine}, keeping it"),
        ));
    }

    // Converge the login role itself.
    let convergence = converge_role(&resolved, user_role, &outcome.identity, outcome.password_changed)
        .await
        .context(RoleSyncSnafu)?;
    for engine in &convergence.created_on {
        events.push(PassEvent::updated(
            "CreateRole",
            format!(
                "created role {username} on engine {engine}",
                username = outcome.identity.username
            ),
        ));
    }

    let mut identity = outcome.identity.clone();
    if convergence.canonical_username != identity.username {
        identity.username = convergence.canonical_username.clone();
        persist_identity(deps.secrets, user_role, &identity)
            .await
            .context(CanonicalNameSnafu)?;
    }

    // Memberships and session defaults.
    converge_privileges(&resolved, &identity.username)
        .await
        .context(PrivilegesSnafu)?;

    // Connection secrets for consumers.
    let outputs = project_output_secrets(deps.secrets, user_role, &resolved, &identity)
        .await
        .context(OutputSecretsSnafu)?;
    for name in &outputs.written {
        events.push(PassEvent::updated(
            "WriteConnectionSecret",
            format!("wrote connection secret {name}"),
        ));
    }
    for name in &outputs.deleted {
        events.push(PassEvent::updated(
            "SweepSecrets",
            format!("deleted stale secret {name}"),
        ));
    }

    // Status. The password timestamp advances on any credential change and
    // on the very first pass.
    let last_password_changed_time = if outcome.password_changed
        || outcome.username_changed
        || status.last_password_changed_time.is_none()
    {
        Some(Time(now))
    } else {
        status.last_password_changed_time.clone()
    };

    let mut new_status = UserRoleStatus {
        phase: UserRolePhase::Created,
        ready: true,
        message: String::new(),
        postgres_role: identity.username.clone(),
        role_prefix: user_role.spec.role_prefix.clone().unwrap_or_default(),
        last_password_changed_time,
        old_postgres_roles: reap.remaining,
    };

    if let Some(blocked) = &outcome.blocked_rotation {
        new_status.phase = UserRolePhase::Failed;
        new_status.ready = false;
        new_status.message = format!(
            "rotation is blocked: previous role {blocked} has not been reaped yet"
        );
        events.push(PassEvent {
            severity: EventSeverity::Warning,
            reason: EventReason::ProcessingError,
            action: "RotateCredentials",
            message: new_status.message.clone(),
        });
    }

    let requeue_after = rotation_requeue(
        user_role,
        new_status.last_password_changed_time.as_ref(),
        now,
    );

    Ok(PassOutcome::Converged(Box::new(PassReport {
        status: new_status,
        events,
        blocked_rotation: outcome.blocked_rotation,
        requeue_after,
    })))
}

/// The teardown pass run under the finalizer: every identity this object
/// ever held is reaped; missing collaborators are skipped.
pub async fn run_deletion(
    deps: &PassDeps<'_>,
    user_role: &UserRole,
) -> Result<DeletionReport, Error> {
    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let status = user_role.status_or_default();
    let mut events = Vec::new();

    let resolution = resolve_dependencies(deps.fetcher, deps.engines, user_role, true)
        .await
        .context(ResolveSnafu)?;
    let resolved = match resolution {
        Resolution::Resolved(resolved) => resolved,
        // ignore_not_found skips readiness gates, but keep the teardown
        // conservative if one ever surfaces.
        Resolution::AwaitDatabase { .. } => {
            return Ok(DeletionReport {
                remaining: status.old_postgres_roles,
                events,
            });
        }
    };

    let mut queue = status.old_postgres_roles.clone();
    if !status.postgres_role.is_empty() {
        queue.push(status.postgres_role.clone());
    }
    // The work secret may be ahead of the status if the previous pass died
    // between the secret write and the status patch.
    if let Some(work_name) = user_role.work_secret_name() {
        let work_secret = deps
            .secrets
            .get(&namespace, work_name)
            .await
            .context(ReadImportSecretSnafu { name: work_name })?;
        if let Some(username) =
            work_secret.as_ref().and_then(|secret| secret_string(secret, postgresql_operator_crd::USERNAME_KEY))
            && !username.is_empty()
        {
            queue.push(username);
        }
    }

    let reap = reap_roles(&resolved, &queue).await.context(ReapSnafu)?;
    for role in &reap.dropped {
        events.push(PassEvent::updated(
            "ReapRole",
            format!("dropped role {role}"),
        ));
    }
    for (role, engine) in &reap.deferred {
        events.push(PassEvent::warning(
            "ReapRole",
            format!(
                "deletion is waiting for role {role}: active sessions on engine {engine}"
            ),
        ));
    }

    Ok(DeletionReport {
        remaining: reap.remaining,
        events,
    })
}

/// Time until the next rotation is due, at least one second.
fn rotation_requeue(
    user_role: &UserRole,
    last_changed: Option<&Time>,
    now: DateTime<Utc>,
) -> Option<std::time::Duration> {
    let duration = user_role.spec.user_password_rotation_duration.as_deref()?;
    let interval = humantime::parse_duration(duration).ok()?;
    let changed_at = last_changed?;

    let elapsed = now
        .signed_duration_since(changed_at.0)
        .to_std()
        .unwrap_or_default();
    Some(
        interval
            .saturating_sub(elapsed)
            .max(std::time::Duration::from_secs(1)),
    )
}

/// Reads the `USERNAME`/`PASSWORD` pair of a work secret.
pub fn identity_from_secret(secret: &k8s_openapi::api::core::v1::Secret) -> Option<WorkIdentity> {
    Some(WorkIdentity {
        username: secret_string(secret, postgresql_operator_crd::USERNAME_KEY)?,
        password: secret_string(secret, postgresql_operator_crd::PASSWORD_KEY)?,
    })
}
