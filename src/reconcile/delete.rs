use super::{Pass, ReconcileAction, ReconcileError, Reconciler};
use crate::cinder::FACADES;
use crate::client::Patch;
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::objects::keystone;
use crate::store::ObjectStore;

/// Removes the keystone registrations, then our finalizer. Everything else we created is
/// owned by the `CinderAPI` and gets garbage collected.
pub(super) async fn reconcile_delete<S: ObjectStore>(
    reconciler: &Reconciler<S>,
    pass: &mut Pass,
) -> Result<ReconcileAction, ReconcileError> {
    let store = reconciler.store();
    let namespace = pass.instance.namespace().to_owned();

    for facade in FACADES.iter() {
        if pass.status().api_endpoints.contains_key(facade.name) {
            keystone::delete_service(store, &namespace, facade).await?;
        }
    }

    if !pass.instance.has_finalizer(reconciler.finalizer()) {
        return Ok(ReconcileAction::Done);
    }
    let patch = Patch::remove_finalizer(&pass.resource, reconciler.finalizer());
    match store.patch(CinderAPI, &pass.instance.id(), &patch).await {
        Ok(_) => {
            log::info!("Removed finalizer from CinderAPI {}", pass.instance.id());
            Ok(ReconcileAction::Done)
        }
        Err(ref err) if err.is_not_found() => {
            log::debug!("CinderAPI {} is already gone", pass.instance.id());
            Ok(ReconcileAction::Done)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod test {
    use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
    use crate::k8s_types::keystone_openstack_org::v1beta1::KeystoneService;
    use crate::reconcile::ReconcileAction;
    use crate::testkit::{FakeStore, TestKit};
    use serde_json::{json, Value};

    fn deleting_cinder_api(status: Value) -> Value {
        json!({
            "apiVersion": "cinder.openstack.org/v1beta1",
            "kind": "CinderAPI",
            "metadata": {
                "namespace": "openstack",
                "name": "cinder-api",
                "finalizers": ["openstack.org/cinderapi"],
                "deletionTimestamp": "2021-01-01T00:00:00Z",
            },
            "spec": {},
            "status": status,
        })
    }

    fn keystone_service(name: &str) -> Value {
        json!({
            "apiVersion": "keystone.openstack.org/v1beta1",
            "kind": "KeystoneService",
            "metadata": {"namespace": "openstack", "name": name},
            "spec": {},
        })
    }

    #[test]
    fn without_endpoints_no_keystone_calls_are_made() {
        let store = FakeStore::new();
        store.insert(deleting_cinder_api(json!({})));
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert!(kit.store().calls().iter().all(|call| !call.contains("KeystoneService")));
        assert!(kit.get_cinder_api("openstack", "cinder-api").is_none());
    }

    #[test]
    fn registrations_are_removed_before_the_finalizer() {
        let store = FakeStore::new();
        store.insert(deleting_cinder_api(json!({
            "apiEndpoint": {"cinderv2": {"admin": "x"}, "cinderv3": {"admin": "y"}},
        })));
        store.insert(keystone_service("cinderv2"));
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        let calls = kit.store().calls();
        let deletes = calls
            .iter()
            .filter(|call| call.starts_with("delete"))
            .cloned()
            .collect::<Vec<_>>();
        // the missing cinderv3 registration counts as deleted
        assert_eq!(
            vec![
                "delete KeystoneService openstack/cinderv2".to_owned(),
                "delete KeystoneService openstack/cinderv3".to_owned(),
            ],
            deletes
        );
        assert!(kit.store().objects_of_type(KeystoneService).is_empty());
        assert!(kit.get_cinder_api("openstack", "cinder-api").is_none());
    }

    #[test]
    fn resource_vanishing_before_finalizer_removal_counts_as_done() {
        let store = FakeStore::new();
        store.insert(deleting_cinder_api(json!({})));
        store.fail_on("patch", CinderAPI, 404);
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert!(kit
            .store()
            .calls()
            .contains(&"patch CinderAPI openstack/cinder-api".to_owned()));
    }

    #[test]
    fn failed_deregistration_keeps_the_finalizer() {
        let store = FakeStore::new();
        store.insert(deleting_cinder_api(json!({"apiEndpoint": {"cinderv2": {"admin": "x"}}})));
        store.fail_on("delete", KeystoneService, 503);
        let kit = TestKit::new(store);

        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert_eq!(None, err.requeue_after());
        let api = kit.get_cinder_api("openstack", "cinder-api").unwrap();
        assert_eq!(json!(["openstack.org/cinderapi"]), api["metadata"]["finalizers"]);

        kit.store().clear_failures();
        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert!(kit.store().get_object(CinderAPI, "openstack", "cinder-api").is_none());
    }
}
