//! The object store is everything the reconciler needs from the api server. The `Client`
//! implements it against a real cluster; `testkit::FakeStore` implements it in memory.
use crate::client::{Client, Error, Patch};
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Returns `None` if the object does not exist
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error>;

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Error>;

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<Value, Error>;

    /// JSON merge patch of the main resource. Changes to `status` are ignored for types that
    /// have a status subresource.
    async fn patch(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error>;

    /// JSON merge patch of the status subresource
    async fn patch_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error>;

    /// Fails with a not found error if the object does not exist
    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error>;
}

#[async_trait]
impl ObjectStore for Client {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error> {
        Client::get(self, k8s_type, id).await
    }

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Error> {
        let list = Client::list(self, k8s_type, namespace, label_selector).await?;
        Ok(list.items)
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<Value, Error> {
        Client::create(self, k8s_type, resource).await
    }

    async fn patch(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        Client::patch(self, k8s_type, id, patch).await
    }

    async fn patch_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        Client::patch_status(self, k8s_type, id, patch).await
    }

    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error> {
        Client::delete(self, k8s_type, id).await
    }
}
