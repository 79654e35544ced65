//! Kubernetes-backed object store

use super::{patch, StoredObject};
use crate::domain::ports::{LabelSelector, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "storage-topology-operator";

/// Repository over one namespaced kind in the API server
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: StoredObject + Resource<Scope = NamespaceResourceScope>,
{
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn kind<K: StoredObject>() -> String {
    K::kind(&()).to_string()
}

/// Translate API status codes into the store's error vocabulary
fn map_error<K: StoredObject>(err: kube::Error, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind::<K>(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        self.api.get_opt(name).await.map_err(Error::from)
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if selector != &LabelSelector::everything() {
            params = params.labels(&selector.to_query());
        }
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        self.api
            .create(&post_params(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &post_params(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api
            .replace_status(&name, &post_params(), data)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn patch(&self, old: &K, new: &K) -> Result<K> {
        let name = old.name_any();
        let changes = patch::diff(&serde_json::to_value(old)?, &serde_json::to_value(new)?);
        if patch::is_empty(&changes) {
            return Ok(new.clone());
        }
        debug!(kind = %kind::<K>(), name = %name, "Patching object");
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api
            .patch(&name, &params, &Patch::Merge(&changes))
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(map_error::<K>(e, name)),
        }
    }
}
