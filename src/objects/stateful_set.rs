use crate::api::CinderApi;
use crate::cinder::PENDING_REQUEUE_SECS;
use crate::client::Error;
use crate::k8s_types::apps::v1::StatefulSet;
use crate::objects::{create_or_patch, owner_reference, Readiness};
use crate::resource::ObjectIdRef;
use crate::store::ObjectStore;

use k8s_openapi::api::apps::v1::StatefulSet as StatefulSetObject;
use serde_json::Value;

use std::time::Duration;

/// Creates or patches the rendered StatefulSet and returns its number of ready replicas
pub async fn apply<S: ObjectStore + ?Sized>(
    store: &S,
    instance: &CinderApi,
    stateful_set: &StatefulSetObject,
) -> Result<Readiness<i32>, Error> {
    let mut desired = serde_json::to_value(stateful_set)?;
    desired["metadata"]["ownerReferences"] = Value::Array(vec![owner_reference(instance)]);

    let id = ObjectIdRef::new(instance.namespace(), instance.name());
    match create_or_patch(store, StatefulSet, &id, &desired).await {
        Ok(applied) => {
            let ready = applied
                .pointer("/status/readyReplicas")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(Readiness::Ready(ready as i32))
        }
        Err(ref err) if err.is_conflict() => {
            log::info!("Conflict updating StatefulSet {}, will retry", id);
            Ok(Readiness::Pending(Duration::from_secs(PENDING_REQUEUE_SECS)))
        }
        Err(err) => Err(err),
    }
}
