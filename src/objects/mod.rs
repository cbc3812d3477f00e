//! Helpers that make sure the objects generated for a `CinderAPI` exist and look the way we
//! want them to. Each of them talks to the api server only through an `ObjectStore`.
pub mod config_map;
pub mod endpoint;
pub mod keystone;
pub mod secret;
pub mod stateful_set;

use crate::api::CinderApi;
use crate::client::{Error, Patch};
use crate::compare::compare_values;
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::k8s_types::K8sType;
use crate::resource::{controller_reference, ObjectIdRef};
use crate::store::ObjectStore;

use serde_json::Value;

use std::time::Duration;

/// Outcome of a helper that may have to wait for another controller to do its part
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness<T> {
    Ready(T),
    /// Not there yet, check again after the given delay
    Pending(Duration),
}

/// The controlling owner reference that every generated object carries
pub fn owner_reference(instance: &CinderApi) -> Value {
    controller_reference(CinderAPI, instance.name(), instance.uid())
}

/// Creates the object if it doesn't exist. Otherwise it gets merge patched, but only if
/// it differs from `desired`. Returns the object as it is after the call.
pub async fn create_or_patch<S: ObjectStore + ?Sized>(
    store: &S,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    desired: &Value,
) -> Result<Value, Error> {
    let existing = store.get(k8s_type, id).await?;
    apply(store, k8s_type, id, existing, desired).await
}

/// Like `create_or_patch`, for callers that already fetched the existing object
pub async fn apply<S: ObjectStore + ?Sized>(
    store: &S,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    existing: Option<Value>,
    desired: &Value,
) -> Result<Value, Error> {
    let existing = match existing {
        Some(existing) => existing,
        None => {
            log::info!("Creating {} {}", k8s_type.kind, id);
            return store.create(k8s_type, desired).await;
        }
    };
    let diffs = compare_values(&existing, desired);
    if diffs.is_empty() {
        log::trace!("{} {} is up to date", k8s_type.kind, id);
        return Ok(existing);
    }
    log::info!("Patching {} {}, {}", k8s_type.kind, id, diffs);
    store
        .patch(k8s_type, id, &Patch::merge(desired.clone()))
        .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::core::v1::ConfigMap;
    use crate::testkit::FakeStore;
    use serde_json::json;
    use tokio::runtime;

    fn config_map(value: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"namespace": "openstack", "name": "cm"},
            "data": {"key": value},
        })
    }

    #[test]
    fn create_or_patch_creates_then_patches_only_on_change() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let id = ObjectIdRef::new("openstack", "cm");

            let created = create_or_patch(&store, ConfigMap, &id, &config_map("a")).await.unwrap();
            assert_eq!("a", created["data"]["key"]);
            assert_eq!(1, store.mutation_count());

            create_or_patch(&store, ConfigMap, &id, &config_map("a")).await.unwrap();
            assert_eq!(1, store.mutation_count());

            let patched = create_or_patch(&store, ConfigMap, &id, &config_map("b")).await.unwrap();
            assert_eq!("b", patched["data"]["key"]);
            assert_eq!(2, store.mutation_count());
        });
    }
}
