//! Secret access behind a trait.
//!
//! The work secret is externally mutable ground truth, so everything that
//! touches secrets goes through [`SecretStore`]. The production
//! implementation wraps the Kubernetes API; tests substitute an in-memory
//! store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use postgresql_operator_crd::UserRole;
use snafu::{OptionExt, ResultExt, Snafu};

/// Field manager used for server-side applies.
const FIELD_MANAGER: &str = "postgresql-operator";

/// Page size of the owned-secret sweep.
const LIST_PAGE_LIMIT: u32 = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get secret {name}"))]
    GetSecret { source: kube::Error, name: String },

    #[snafu(display("failed to apply secret {name}"))]
    ApplySecret { source: kube::Error, name: String },

    #[snafu(display("failed to delete secret {name}"))]
    DeleteSecret { source: kube::Error, name: String },

    #[snafu(display("failed to list secrets in namespace {namespace}"))]
    ListSecrets {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to serialize secret {name}"))]
    SerializeSecret {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("object is missing metadata to build an owner reference"))]
    MissingOwnerMetadata,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Creates the secret or replaces its data if it already exists.
    async fn apply(&self, secret: &Secret) -> Result<(), Error>;

    /// Deletes the secret; a secret that is already gone is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// All secrets in `namespace` controlled by the owner with `owner_uid`.
    /// Listed in pages of [`LIST_PAGE_LIMIT`].
    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Secret>, Error>;
}

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.api(namespace)
            .get_opt(name)
            .await
            .context(GetSecretSnafu { name })
    }

    async fn apply(&self, secret: &Secret) -> Result<(), Error> {
        let name = secret.name_any();
        let namespace = secret.namespace().unwrap_or_default();

        // k8s-openapi types carry no TypeMeta, which server-side apply
        // requires on the wire.
        let mut object =
            serde_json::to_value(secret).context(SerializeSecretSnafu { name: &name })?;
        object["apiVersion"] = "v1".into();
        object["kind"] = "Secret".into();

        self.api(&namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .context(ApplySecretSnafu { name })?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(Error::DeleteSecret {
                source,
                name: name.to_owned(),
            }),
        }
    }

    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Secret>, Error> {
        let api = self.api(namespace);
        let mut params = ListParams::default().limit(LIST_PAGE_LIMIT);
        let mut owned = Vec::new();

        loop {
            let page = api.list(&params).await.context(ListSecretsSnafu {
                namespace: namespace.to_owned(),
            })?;
            owned.extend(
                page.items
                    .into_iter()
                    .filter(|secret| is_controlled_by(secret, owner_uid)),
            );
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => break,
            }
        }

        Ok(owned)
    }
}

/// Whether the secret carries a controller owner reference with `owner_uid`.
pub fn is_controlled_by(secret: &Secret, owner_uid: &str) -> bool {
    secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == owner_uid)
}

/// Builds a secret owned by the given [`UserRole`], in its namespace.
pub fn build_owned_secret(
    owner: &UserRole,
    name: &str,
    data: BTreeMap<String, ByteString>,
) -> Result<Secret, Error> {
    let owner_reference = owner
        .controller_owner_ref(&())
        .context(MissingOwnerMetadataSnafu)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: owner.namespace(),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    })
}

/// Reads a key of the secret as UTF-8, `None` when absent or not UTF-8.
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

/// Converts plain string pairs into secret data.
pub fn to_secret_data(entries: BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    entries
        .into_iter()
        .map(|(key, value)| (key, ByteString(value.into_bytes())))
        .collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    fn secret_with_owner(uid: &str, controller: bool) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("s".to_owned()),
                owner_references: Some(vec![OwnerReference {
                    uid: uid.to_owned(),
                    controller: Some(controller),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[test]
    fn controller_reference_is_required() {
        assert!(is_controlled_by(&secret_with_owner("uid-1", true), "uid-1"));
        assert!(!is_controlled_by(&secret_with_owner("uid-1", false), "uid-1"));
        assert!(!is_controlled_by(&secret_with_owner("uid-2", true), "uid-1"));
    }

    #[test]
    fn secret_strings_decode_utf8() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "USERNAME".to_owned(),
                ByteString(b"svc-x-0".to_vec()),
            )])),
            ..Secret::default()
        };
        assert_eq!(secret_string(&secret, "USERNAME").as_deref(), Some("svc-x-0"));
        assert_eq!(secret_string(&secret, "PASSWORD"), None);
    }
}
