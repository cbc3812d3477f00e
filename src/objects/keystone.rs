//! Keystone registrations are `KeystoneService` resources that the keystone operator turns
//! into a service and its endpoints. We only create them and wait for the service id.
use crate::api::CinderApi;
use crate::cinder::{Facade, DEPENDENCY_REQUEUE_SECS};
use crate::client::Error;
use crate::k8s_types::keystone_openstack_org::v1beta1::KeystoneService;
use crate::labels::service_labels;
use crate::objects::{create_or_patch, owner_reference, Readiness};
use crate::resource::{str_value, ObjectIdRef};
use crate::store::ObjectStore;

use serde_json::{json, Value};

use std::collections::BTreeMap;
use std::time::Duration;

fn desired_service(
    instance: &CinderApi,
    facade: &Facade,
    endpoints: &BTreeMap<String, String>,
) -> Value {
    let spec = &instance.spec;
    json!({
        "apiVersion": KeystoneService.api_version,
        "kind": KeystoneService.kind,
        "metadata": {
            "namespace": instance.namespace(),
            "name": facade.name,
            "labels": service_labels(),
            "ownerReferences": [owner_reference(instance)],
        },
        "spec": {
            "serviceType": facade.service_type,
            "serviceName": facade.name,
            "serviceDescription": facade.description,
            "enabled": true,
            "apiEndpoints": endpoints,
            "serviceUser": spec.service_user,
            "secret": spec.secret,
            "passwordSelector": spec.password_selectors.service,
        },
    })
}

/// Creates or updates the registration of a facade. Ready with the keystone service id once
/// the keystone operator has reported it.
pub async fn ensure_service<S: ObjectStore + ?Sized>(
    store: &S,
    instance: &CinderApi,
    facade: &Facade,
    endpoints: &BTreeMap<String, String>,
) -> Result<Readiness<String>, Error> {
    let id = ObjectIdRef::new(instance.namespace(), facade.name);
    let desired = desired_service(instance, facade, endpoints);
    let service = create_or_patch(store, KeystoneService, &id, &desired).await?;

    match str_value(&service, "/status/serviceID").filter(|s| !s.is_empty()) {
        Some(service_id) => Ok(Readiness::Ready(service_id.to_owned())),
        None => {
            log::info!("Waiting for keystone to register service {}", id);
            Ok(Readiness::Pending(Duration::from_secs(DEPENDENCY_REQUEUE_SECS)))
        }
    }
}

/// Removes the registration of a facade. Succeeds if it's already gone.
pub async fn delete_service<S: ObjectStore + ?Sized>(
    store: &S,
    namespace: &str,
    facade: &Facade,
) -> Result<(), Error> {
    let id = ObjectIdRef::new(namespace, facade.name);
    match store.delete(KeystoneService, &id).await {
        Ok(()) => {
            log::info!("Deleted KeystoneService {}", id);
            Ok(())
        }
        Err(ref err) if err.is_not_found() => {
            log::debug!("KeystoneService {} was already deleted", id);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cinder::FACADES;
    use crate::testkit::FakeStore;
    use tokio::runtime;

    fn instance() -> CinderApi {
        serde_json::from_value(json!({
            "metadata": {"name": "cinder-api", "namespace": "openstack", "uid": "u-1"},
            "spec": {"secret": "osp-secret"},
        }))
        .unwrap()
    }

    fn endpoints() -> BTreeMap<String, String> {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("admin".to_owned(), "http://cinder-admin.openstack.svc:8776/v2/%(project_id)s".to_owned());
        endpoints
    }

    #[test]
    fn registration_carries_facade_and_credentials() {
        let service = desired_service(&instance(), &FACADES[0], &endpoints());
        assert_eq!(json!("cinderv2"), service["metadata"]["name"]);
        assert_eq!(
            json!({
                "serviceType": "volumev2",
                "serviceName": "cinderv2",
                "serviceDescription": "Cinder V2 Service",
                "enabled": true,
                "apiEndpoints": {"admin": "http://cinder-admin.openstack.svc:8776/v2/%(project_id)s"},
                "serviceUser": "cinder",
                "secret": "osp-secret",
                "passwordSelector": "CinderPassword",
            }),
            service["spec"]
        );
    }

    #[test]
    fn service_id_is_pending_until_keystone_reports_it() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let result = ensure_service(&store, &instance(), &FACADES[0], &endpoints()).await.unwrap();
            assert_eq!(Readiness::Pending(Duration::from_secs(10)), result);

            let store = FakeStore::new().with_keystone_service_ids();
            let result = ensure_service(&store, &instance(), &FACADES[1], &endpoints()).await.unwrap();
            assert_eq!(Readiness::Ready("cinderv3-id".to_owned()), result);
        });
    }

    #[test]
    fn deleting_a_missing_registration_succeeds() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            delete_service(&store, "openstack", &FACADES[0]).await.unwrap();
            assert_eq!(0, store.mutation_count());
        });
    }
}
