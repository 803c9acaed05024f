//! Cluster access used by the controller
//!
//! Two narrow traits keep the reconciler testable: [`ResourceClient`] for
//! the untyped objects rendered from charts and [`InstanceClient`] for the
//! MeshControlPlane being reconciled. Production implementations wrap a
//! kube [`Client`]; tests use the generated mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, ApiResource, Scope};
use kube::{Api, Client};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{MeshControlPlane, MeshControlPlaneStatus};
use crate::manifest::{parse_api_version, ObjectKey, ObjectKind};
use crate::retry::{retry_when, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// Get/create/update/delete/list over untyped cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, Error>;

    /// Create an object. Fails with [`Error::AlreadyExists`] if it exists.
    async fn create(&self, obj: &Value) -> Result<(), Error>;

    /// Replace an object. Fails with [`Error::Conflict`] on a stale
    /// `resourceVersion`.
    async fn update(&self, obj: &Value) -> Result<(), Error>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;

    /// Every object of `kind` matching a label selector, across namespaces.
    /// Kinds the cluster does not serve list as empty.
    async fn list(&self, kind: &ObjectKind, selector: &str) -> Result<Vec<Value>, Error>;
}

/// Access to MeshControlPlane instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Fetch the latest copy, `None` once it is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<MeshControlPlane>, Error>;

    /// Replace the instance (metadata and spec). Fails with
    /// [`Error::Conflict`] when the copy is stale.
    async fn replace(&self, instance: &MeshControlPlane) -> Result<MeshControlPlane, Error>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshControlPlaneStatus,
    ) -> Result<(), Error>;
}

/// Translate a failed write into the crate's conflict taxonomy.
fn write_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// A kind resolved against the API server
#[derive(Clone)]
struct Resolved {
    resource: ApiResource,
    namespaced: bool,
}

/// [`ResourceClient`] backed by `DynamicObject` and API discovery
pub struct KubeResourceClient {
    client: Client,
    discovery_retry: RetryConfig,
    resolved: RwLock<BTreeMap<ObjectKind, Resolved>>,
}

impl KubeResourceClient {
    /// Create a client over `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery_retry: RetryConfig::with_max_attempts(3),
            resolved: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up the plural and scope of a kind, caching the answer.
    ///
    /// Kinds the server does not know resolve to `None`; they are not cached
    /// so a CRD installed later in the same pass becomes visible.
    async fn resolve(&self, kind: &ObjectKind) -> Result<Option<Resolved>, Error> {
        if let Some(hit) = self.resolved.read().await.get(kind) {
            return Ok(Some(hit.clone()));
        }

        let (group, version) = parse_api_version(&kind.api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &kind.kind);
        let missing = |e: &kube::Error| matches!(e, kube::Error::Discovery(_)) || is_not_found(e);

        let found = retry_when(
            &self.discovery_retry,
            "discover_kind",
            |e: &kube::Error| !missing(e),
            || pinned_kind(&self.client, &gvk),
        )
        .await;

        let resolved = match found {
            Ok((resource, caps)) => Resolved {
                resource,
                namespaced: matches!(caps.scope, Scope::Namespaced),
            },
            Err(e) if missing(&e) => {
                debug!(kind = %kind.kind, api_version = %kind.api_version, "kind not served");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.resolved
            .write()
            .await
            .insert(kind.clone(), resolved.clone());
        Ok(Some(resolved))
    }

    async fn require(&self, kind: &ObjectKind) -> Result<Resolved, Error> {
        self.resolve(kind).await?.ok_or_else(|| {
            Error::validation(format!(
                "kind {} in {} is not served by the cluster",
                kind.kind, kind.api_version
            ))
        })
    }

    fn api(&self, resolved: &Resolved, namespace: Option<&str>) -> Api<DynamicObject> {
        match (resolved.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resolved.resource),
            _ => Api::all_with(self.client.clone(), &resolved.resource),
        }
    }

    /// Decode an object for writing, dropping the namespace of
    /// cluster-scoped kinds.
    async fn prepare(&self, obj: &Value) -> Result<(ObjectKey, Resolved, DynamicObject), Error> {
        let mut key = ObjectKey::from_value(obj)?;
        let resolved = self.require(&key.object_kind()).await?;
        let mut dynamic: DynamicObject = serde_json::from_value(obj.clone())?;
        if !resolved.namespaced {
            dynamic.metadata.namespace = None;
            key.namespace = None;
        }
        Ok((key, resolved, dynamic))
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, Error> {
        let Some(resolved) = self.resolve(&key.object_kind()).await? else {
            return Ok(None);
        };
        let api = self.api(&resolved, key.namespace.as_deref());
        match api.get_opt(&key.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &Value) -> Result<(), Error> {
        let (key, resolved, dynamic) = self.prepare(obj).await?;
        self.api(&resolved, key.namespace.as_deref())
            .create(&Self::post_params(), &dynamic)
            .await
            .map_err(|e| write_error(e, &key.kind, &key.name))?;
        Ok(())
    }

    async fn update(&self, obj: &Value) -> Result<(), Error> {
        let (key, resolved, dynamic) = self.prepare(obj).await?;
        self.api(&resolved, key.namespace.as_deref())
            .replace(&key.name, &Self::post_params(), &dynamic)
            .await
            .map_err(|e| write_error(e, &key.kind, &key.name))?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let Some(resolved) = self.resolve(&key.object_kind()).await? else {
            return Ok(());
        };
        match self
            .api(&resolved, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, kind: &ObjectKind, selector: &str) -> Result<Vec<Value>, Error> {
        let Some(resolved) = self.resolve(kind).await? else {
            return Ok(Vec::new());
        };
        let objects = self
            .api(&resolved, None)
            .list(&ListParams::default().labels(selector))
            .await?;

        objects
            .items
            .into_iter()
            .map(|mut obj| {
                // List responses omit the type on items.
                obj.types = Some(kube::core::TypeMeta {
                    api_version: kind.api_version.clone(),
                    kind: kind.kind.clone(),
                });
                serde_json::to_value(obj).map_err(Error::from)
            })
            .collect()
    }
}

/// [`InstanceClient`] over the MeshControlPlane API
pub struct KubeInstanceClient {
    client: Client,
}

impl KubeInstanceClient {
    /// Create a client over `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<MeshControlPlane> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl InstanceClient for KubeInstanceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<MeshControlPlane>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn replace(&self, instance: &MeshControlPlane) -> Result<MeshControlPlane, Error> {
        let name = instance.metadata.name.as_deref().unwrap_or_default();
        let namespace = instance
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("MeshControlPlane has no namespace"))?;

        self.api(namespace)
            .replace(name, &PostParams::default(), instance)
            .await
            .map_err(|e| write_error(e, "MeshControlPlane", name))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshControlPlaneStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });

        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }
}
