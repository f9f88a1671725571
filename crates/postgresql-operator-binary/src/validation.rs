//! Static and cross-resource validation of a [`UserRole`].
//!
//! Everything in here is a permanent failure: retrying does not help until
//! the spec (or a referenced secret) changes.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use postgresql_operator_crd::{
    ConnectionType, PASSWORD_KEY, USERNAME_KEY, UserRole, UserRoleMode,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    pg::MAX_IDENTIFIER_LENGTH,
    resolve::ResolvedDependencies,
    secret_store::secret_string,
    work_secret::WorkIdentity,
};

/// The rotation slot takes two characters; one more is reserved as headroom
/// for engines that decorate login names.
const ROLE_NAME_RESERVED: usize = 3;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("managed mode requires a non-empty role prefix"))]
    EmptyRolePrefix,

    #[snafu(display(
        "role prefix {prefix:?} leaves no room for the rotation slot within {max} characters"
    ))]
    RolePrefixTooLong { prefix: String, max: usize },

    #[snafu(display("failed to parse rotation duration {duration:?}"))]
    InvalidRotationDuration {
        source: humantime::DurationError,
        duration: String,
    },

    #[snafu(display("provided mode requires an import secret reference"))]
    MissingImportSecretRef,

    #[snafu(display("import secret {name} not found"))]
    ImportSecretNotFound { name: String },

    #[snafu(display("import secret {name} is missing a non-empty {key} key"))]
    IncompleteImportSecret { name: String, key: &'static str },

    #[snafu(display("imported username exceeds {max} characters"))]
    ImportedUsernameTooLong { max: usize },

    #[snafu(display("database {namespace}/{database} is referenced by more than one privilege"))]
    DuplicateDatabase {
        database: String,
        namespace: String,
    },

    #[snafu(display("role prefix {prefix:?} is already used by user role {other}"))]
    RolePrefixTaken { prefix: String, other: String },

    #[snafu(display(
        "privilege for database {database} requests a bouncer but engine {engine} has none configured"
    ))]
    BouncerNotConfigured { database: String, engine: String },
}

/// Runs the static checks in order. In `Provided` mode the validated import
/// credentials are returned for the work-secret stage.
pub fn validate(
    user_role: &UserRole,
    import_secret: Option<&Secret>,
    peers: &[UserRole],
) -> Result<Option<WorkIdentity>, Error> {
    let import = match user_role.spec.mode {
        UserRoleMode::Managed => {
            validate_managed(user_role)?;
            None
        }
        UserRoleMode::Provided => Some(validate_provided(user_role, import_secret)?),
    };

    validate_unique_databases(user_role)?;
    validate_unique_prefix(user_role, peers)?;

    Ok(import)
}

fn validate_managed(user_role: &UserRole) -> Result<(), Error> {
    let prefix = user_role
        .spec
        .role_prefix
        .as_deref()
        .filter(|prefix| !prefix.is_empty())
        .context(EmptyRolePrefixSnafu)?;

    ensure!(
        prefix.len() + ROLE_NAME_RESERVED <= MAX_IDENTIFIER_LENGTH,
        RolePrefixTooLongSnafu {
            prefix,
            max: MAX_IDENTIFIER_LENGTH,
        }
    );

    if let Some(duration) = user_role.spec.user_password_rotation_duration.as_deref() {
        humantime::parse_duration(duration)
            .context(InvalidRotationDurationSnafu { duration })?;
    }

    Ok(())
}

fn validate_provided(
    user_role: &UserRole,
    import_secret: Option<&Secret>,
) -> Result<WorkIdentity, Error> {
    let name = user_role
        .spec
        .import_secret_ref
        .as_deref()
        .filter(|name| !name.is_empty())
        .context(MissingImportSecretRefSnafu)?;

    let secret = import_secret.context(ImportSecretNotFoundSnafu { name })?;

    let username = secret_string(secret, USERNAME_KEY)
        .filter(|username| !username.is_empty())
        .context(IncompleteImportSecretSnafu {
            name,
            key: USERNAME_KEY,
        })?;
    let password = secret_string(secret, PASSWORD_KEY)
        .filter(|password| !password.is_empty())
        .context(IncompleteImportSecretSnafu {
            name,
            key: PASSWORD_KEY,
        })?;

    ensure!(
        username.len() <= MAX_IDENTIFIER_LENGTH,
        ImportedUsernameTooLongSnafu {
            max: MAX_IDENTIFIER_LENGTH,
        }
    );

    Ok(WorkIdentity { username, password })
}

fn validate_unique_databases(user_role: &UserRole) -> Result<(), Error> {
    let fallback = user_role.namespace().unwrap_or_default();
    let mut seen = BTreeSet::new();
    for privilege in &user_role.spec.privileges {
        let namespace = privilege.database_ref.effective_namespace(&fallback);
        if !seen.insert((privilege.database_ref.name.as_str(), namespace)) {
            return DuplicateDatabaseSnafu {
                database: &privilege.database_ref.name,
                namespace,
            }
            .fail();
        }
    }
    Ok(())
}

/// A managed role prefix must be unique across all UserRole objects in the
/// cluster; two objects rotating the same login names would fight over them.
fn validate_unique_prefix(user_role: &UserRole, peers: &[UserRole]) -> Result<(), Error> {
    let Some(prefix) = user_role.spec.role_prefix.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    let identity = (user_role.name_any(), user_role.namespace());
    for peer in peers {
        if (peer.name_any(), peer.namespace()) == identity {
            continue;
        }
        if peer.spec.role_prefix.as_deref() == Some(prefix) {
            return RolePrefixTakenSnafu {
                prefix,
                other: format!(
                    "{namespace}/{name}",
                    namespace = peer.namespace().unwrap_or_default(),
                    name = peer.name_any(),
                ),
            }
            .fail();
        }
    }
    Ok(())
}

/// Engine-aware check: every privilege asking for the bouncer needs an
/// engine that actually has one. Runs after dependency resolution.
pub fn validate_connections(resolved: &ResolvedDependencies) -> Result<(), Error> {
    for (engine_key, bindings) in &resolved.privilege_groups {
        let Some(config) = resolved.engine_configs.get(engine_key) else {
            continue;
        };
        for binding in bindings {
            if binding.privilege.connection_type == ConnectionType::Bouncer
                && config.spec.user_connections.bouncer_connection.is_none()
            {
                return BouncerNotConfiguredSnafu {
                    database: &binding.privilege.database_ref.name,
                    engine: engine_key,
                }
                .fail();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;

    use super::*;
    use crate::fakes;

    fn import_secret(username: &str, password: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([
                (
                    USERNAME_KEY.to_owned(),
                    ByteString(username.as_bytes().to_vec()),
                ),
                (
                    PASSWORD_KEY.to_owned(),
                    ByteString(password.as_bytes().to_vec()),
                ),
            ])),
            ..Secret::default()
        }
    }

    #[test]
    fn managed_requires_a_prefix() {
        let mut user_role = fakes::managed_user_role("svc-x");
        user_role.spec.role_prefix = None;
        let err = validate(&user_role, None, &[]).unwrap_err();
        assert!(matches!(err, Error::EmptyRolePrefix));
    }

    #[test]
    fn prefix_must_leave_room_for_the_rotation_slot() {
        let user_role = fakes::managed_user_role(&"p".repeat(MAX_IDENTIFIER_LENGTH - 2));
        let err = validate(&user_role, None, &[]).unwrap_err();
        assert!(matches!(err, Error::RolePrefixTooLong { .. }));

        let user_role = fakes::managed_user_role(&"p".repeat(MAX_IDENTIFIER_LENGTH - 3));
        assert!(validate(&user_role, None, &[]).is_ok());
    }

    #[test]
    fn rotation_duration_must_parse() {
        let mut user_role = fakes::managed_user_role("svc-x");
        user_role.spec.user_password_rotation_duration = Some("soon".to_owned());
        let err = validate(&user_role, None, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidRotationDuration { .. }));

        user_role.spec.user_password_rotation_duration = Some("12h".to_owned());
        assert!(validate(&user_role, None, &[]).is_ok());
    }

    #[test]
    fn provided_requires_complete_import_credentials() {
        let user_role = fakes::provided_user_role("creds");

        let err = validate(&user_role, None, &[]).unwrap_err();
        assert!(matches!(err, Error::ImportSecretNotFound { .. }));

        let err = validate(&user_role, Some(&import_secret("alice", "")), &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteImportSecret {
                key: PASSWORD_KEY,
                ..
            }
        ));

        let identity = validate(&user_role, Some(&import_secret("alice", "p1")), &[])
            .unwrap()
            .unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.password, "p1");
    }

    #[test]
    fn duplicate_databases_are_rejected() {
        let mut user_role = fakes::managed_user_role("svc-x");
        let privilege = user_role.spec.privileges[0].clone();
        user_role.spec.privileges.push(privilege);

        let err = validate(&user_role, None, &[]).unwrap_err();
        assert!(matches!(err, Error::DuplicateDatabase { .. }));
    }

    #[test]
    fn same_database_name_in_another_namespace_is_fine() {
        let mut user_role = fakes::managed_user_role("svc-x");
        let mut privilege = user_role.spec.privileges[0].clone();
        privilege.database_ref.namespace = Some("prod".to_owned());
        privilege.generated_secret_name = "other".to_owned();
        user_role.spec.privileges.push(privilege);

        assert!(validate(&user_role, None, &[]).is_ok());
    }

    #[test]
    fn role_prefix_must_be_unique_across_objects() {
        let user_role = fakes::managed_user_role("svc-x");

        let mut peer = fakes::managed_user_role("svc-x");
        peer.metadata.name = Some("other".to_owned());
        let err = validate(&user_role, None, std::slice::from_ref(&peer)).unwrap_err();
        assert!(matches!(err, Error::RolePrefixTaken { .. }));

        // The object itself showing up in the listing is not a conflict.
        let this = user_role.clone();
        assert!(validate(&user_role, None, std::slice::from_ref(&this)).is_ok());
    }
}
