//! The work secret: the authoritative record of the intended identity.
//!
//! In `Managed` mode the operator owns the credentials and rotates them by
//! flipping a `-0`/`-1` slot on the login name. In `Provided` mode the work
//! secret mirrors a user-supplied import secret. The PostgreSQL role is
//! converged towards whatever this module decides.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use postgresql_operator_crd::{
    PASSWORD_KEY, USERNAME_KEY, UserRole, UserRoleMode, UserRolePhase,
};
use rand::{Rng, distr::Alphanumeric};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::secret_store::{self, SecretStore, build_owned_secret, secret_string, to_secret_data};

pub const GENERATED_PASSWORD_LENGTH: usize = 15;

/// Rotation slot appended to the role prefix of a fresh managed identity.
const FIRST_SLOT: &str = "-0";
const SECOND_SLOT: &str = "-1";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to access the work secret"))]
    Store { source: secret_store::Error },

    #[snafu(display("failed to build the work secret"))]
    BuildSecret { source: secret_store::Error },

    #[snafu(display("object has no namespace"))]
    MissingNamespace,

    #[snafu(display("no work secret name has been assigned"))]
    MissingWorkSecretName,

    #[snafu(display("role prefix is not set"))]
    MissingRolePrefix,

    #[snafu(display("no imported credentials available"))]
    MissingImport,

    #[snafu(display("failed to parse rotation duration {duration:?}"))]
    ParseRotationDuration {
        source: humantime::DurationError,
        duration: String,
    },
}

/// The `(username, password)` pair the engines are converged towards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkIdentity {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
pub struct IdentityOutcome {
    pub identity: WorkIdentity,

    /// A superseded login name to queue for reaping.
    pub old_username: Option<String>,

    /// The password of an already existing role must be reset.
    pub password_changed: bool,

    pub username_changed: bool,

    /// A due rotation was skipped because the flipped login name is still
    /// queued for deletion. Rotating onto it would resurrect a role the
    /// reaper has not finished with.
    pub blocked_rotation: Option<String>,
}

impl IdentityOutcome {
    fn unchanged(identity: WorkIdentity) -> Self {
        Self {
            identity,
            old_username: None,
            password_changed: false,
            username_changed: false,
            blocked_rotation: None,
        }
    }
}

/// Derives the effective identity for this pass, creating or rewriting the
/// work secret as needed.
///
/// `import` carries the validated credentials of the import secret in
/// `Provided` mode.
pub async fn reconcile_work_secret(
    store: &dyn SecretStore,
    user_role: &UserRole,
    import: Option<&WorkIdentity>,
    now: DateTime<Utc>,
) -> Result<IdentityOutcome, Error> {
    let namespace = user_role.namespace().context(MissingNamespaceSnafu)?;
    let work_name = user_role
        .work_secret_name()
        .context(MissingWorkSecretNameSnafu)?;
    let status = user_role.status_or_default();

    let intended = match user_role.spec.mode {
        UserRoleMode::Managed => WorkIdentity {
            username: format!("{prefix}{FIRST_SLOT}", prefix = role_prefix(user_role)?),
            password: generate_password(),
        },
        UserRoleMode::Provided => import.context(MissingImportSnafu)?.clone(),
    };

    let existing = store
        .get(&namespace, work_name)
        .await
        .context(StoreSnafu)?;

    let Some(secret) = existing else {
        // The secret is gone (or was never created). Recreate it at the
        // intended identity; when the object was already reconciled once the
        // live role must be reconverged onto the fresh password.
        let mut old_username = None;
        let mut password_changed = false;
        if status.phase != UserRolePhase::None {
            password_changed = true;
            if !status.postgres_role.is_empty() && status.postgres_role != intended.username {
                old_username = Some(status.postgres_role.clone());
                password_changed = false;
            }
        }
        write_work_secret(store, user_role, work_name, &intended).await?;
        return Ok(IdentityOutcome {
            username_changed: old_username.is_some(),
            identity: intended,
            old_username,
            password_changed,
            blocked_rotation: None,
        });
    };

    let current = WorkIdentity {
        username: secret_string(&secret, USERNAME_KEY).unwrap_or_default(),
        password: secret_string(&secret, PASSWORD_KEY).unwrap_or_default(),
    };

    match user_role.spec.mode {
        UserRoleMode::Managed => {
            reconcile_managed(store, user_role, &status, intended, current, now).await
        }
        UserRoleMode::Provided => reconcile_provided(store, user_role, intended, current).await,
    }
}

async fn reconcile_managed(
    store: &dyn SecretStore,
    user_role: &UserRole,
    status: &postgresql_operator_crd::UserRoleStatus,
    intended: WorkIdentity,
    current: WorkIdentity,
    now: DateTime<Utc>,
) -> Result<IdentityOutcome, Error> {
    let prefix = role_prefix(user_role)?;
    let work_name = user_role
        .work_secret_name()
        .context(MissingWorkSecretNameSnafu)?;

    let prefix_changed = !status.role_prefix.is_empty() && status.role_prefix != prefix;
    if prefix_changed || current.username.is_empty() || current.password.is_empty() {
        // Reset onto the first slot of the (possibly new) prefix.
        let old_username = (!current.username.is_empty()
            && current.username != intended.username)
            .then(|| current.username.clone());
        write_work_secret(store, user_role, work_name, &intended).await?;
        return Ok(IdentityOutcome {
            username_changed: old_username.is_some(),
            identity: intended,
            old_username,
            password_changed: true,
            blocked_rotation: None,
        });
    }

    if rotation_due(user_role, status, now)? {
        let flipped = flip_username(prefix, &current.username);
        if status.old_postgres_roles.contains(&flipped) {
            // The previous rotation's leftovers have not been reaped yet.
            return Ok(IdentityOutcome {
                blocked_rotation: Some(flipped),
                ..IdentityOutcome::unchanged(current)
            });
        }

        let rotated = WorkIdentity {
            username: flipped,
            password: generate_password(),
        };
        write_work_secret(store, user_role, work_name, &rotated).await?;
        return Ok(IdentityOutcome {
            old_username: Some(current.username),
            password_changed: true,
            username_changed: true,
            identity: rotated,
            blocked_rotation: None,
        });
    }

    Ok(IdentityOutcome::unchanged(current))
}

async fn reconcile_provided(
    store: &dyn SecretStore,
    user_role: &UserRole,
    imported: WorkIdentity,
    current: WorkIdentity,
) -> Result<IdentityOutcome, Error> {
    let work_name = user_role
        .work_secret_name()
        .context(MissingWorkSecretNameSnafu)?;

    let username_changed = current.username != imported.username;
    let password_changed = current.password != imported.password;
    if !username_changed && !password_changed {
        return Ok(IdentityOutcome::unchanged(current));
    }

    let old_username = (username_changed && !current.username.is_empty())
        .then(|| current.username.clone());
    write_work_secret(store, user_role, work_name, &imported).await?;
    Ok(IdentityOutcome {
        identity: imported,
        old_username,
        password_changed,
        username_changed,
        blocked_rotation: None,
    })
}

fn role_prefix(user_role: &UserRole) -> Result<&str, Error> {
    user_role
        .spec
        .role_prefix
        .as_deref()
        .filter(|prefix| !prefix.is_empty())
        .context(MissingRolePrefixSnafu)
}

fn rotation_due(
    user_role: &UserRole,
    status: &postgresql_operator_crd::UserRoleStatus,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    let Some(duration) = user_role.spec.user_password_rotation_duration.as_deref() else {
        return Ok(false);
    };
    let rotation_interval =
        humantime::parse_duration(duration).context(ParseRotationDurationSnafu { duration })?;
    let Some(changed_at) = &status.last_password_changed_time else {
        return Ok(false);
    };

    let age = now.signed_duration_since(changed_at.0);
    Ok(age.to_std().is_ok_and(|age| age >= rotation_interval))
}

/// The login name of the opposite rotation slot.
fn flip_username(prefix: &str, current: &str) -> String {
    if current.ends_with(FIRST_SLOT) {
        format!("{prefix}{SECOND_SLOT}")
    } else {
        format!("{prefix}{FIRST_SLOT}")
    }
}

/// Rewrites the work secret to the given identity. Used when an engine
/// reports a canonical login name differing from the requested one.
pub async fn persist_identity(
    store: &dyn SecretStore,
    user_role: &UserRole,
    identity: &WorkIdentity,
) -> Result<(), Error> {
    let work_name = user_role
        .work_secret_name()
        .context(MissingWorkSecretNameSnafu)?;
    write_work_secret(store, user_role, work_name, identity).await
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

async fn write_work_secret(
    store: &dyn SecretStore,
    user_role: &UserRole,
    name: &str,
    identity: &WorkIdentity,
) -> Result<(), Error> {
    let data = to_secret_data(BTreeMap::from([
        (USERNAME_KEY.to_owned(), identity.username.clone()),
        (PASSWORD_KEY.to_owned(), identity.password.clone()),
    ]));
    let secret = build_owned_secret(user_role, name, data).context(BuildSecretSnafu)?;
    store.apply(&secret).await.context(StoreSnafu)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("svc-x", "svc-x-0", "svc-x-1")]
    #[case("svc-x", "svc-x-1", "svc-x-0")]
    #[case("svc-x", "something-else", "svc-x-0")]
    fn usernames_flip_between_slots(
        #[case] prefix: &str,
        #[case] current: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(flip_username(prefix, current), expected);
    }

    #[test]
    fn generated_passwords_are_printable_and_sized() {
        let password = generate_password();
        assert_eq!(password.len(), GENERATED_PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        // Two draws colliding would point at a broken RNG setup.
        assert_ne!(password, generate_password());
    }
}
