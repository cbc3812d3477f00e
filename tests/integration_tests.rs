use cinder_api_operator::k8s_types::apps::v1::StatefulSet;
use cinder_api_operator::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use cinder_api_operator::k8s_types::core::v1::{ConfigMap, Service};
use cinder_api_operator::k8s_types::keystone_openstack_org::v1beta1::KeystoneService;
use cinder_api_operator::k8s_types::route_openshift_io::v1::Route;
use cinder_api_operator::reconcile::ReconcileAction;
use cinder_api_operator::testkit::{FakeStore, TestKit};

use cinder_api_operator::serde_json::{json, Value};

use std::time::Duration;

const NAMESPACE: &str = "openstack";
const NAME: &str = "cinder-api";

fn setup(store: FakeStore) -> TestKit {
    std::env::set_var("RUST_LOG", "cinder_api_operator=trace");
    let _ = env_logger::try_init();
    TestKit::new(store)
}

fn cinder_api(spec: Value) -> Value {
    json!({
        "apiVersion": "cinder.openstack.org/v1beta1",
        "kind": "CinderAPI",
        "metadata": {
            "namespace": NAMESPACE,
            "name": NAME,
            "ownerReferences": [{
                "apiVersion": "cinder.openstack.org/v1beta1",
                "kind": "Cinder",
                "name": "cinder",
                "uid": "parent-uid",
                "controller": true,
            }],
        },
        "spec": spec,
    })
}

fn secret(password: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"namespace": NAMESPACE, "name": "osp-secret"},
        "data": {"CinderPassword": password},
    })
}

fn seed_parent_config_maps(store: &FakeStore) {
    for name in ["cinder-scripts", "cinder-config-data"].iter() {
        store.insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "namespace": NAMESPACE,
                "name": name,
                "labels": {"cinder.openstack.org/name": "cinder"},
            },
            "data": {"00-default.conf": format!("[DEFAULT]\n# {}\n", name)},
        }));
    }
}

fn converged_store() -> FakeStore {
    let store = FakeStore::new()
        .with_route_hosts("apps.example.com")
        .with_keystone_service_ids()
        .with_ready_replicas();
    store.insert(cinder_api(json!({
        "secret": "osp-secret",
        "replicas": 1,
        "containerImage": "quay.io/podified-antelope-centos9/openstack-cinder-api:current-podified",
    })));
    store.insert(secret("MTIzNDU2Nzg="));
    seed_parent_config_maps(&store);
    store
}

fn status(kit: &TestKit) -> Value {
    kit.get_cinder_api(NAMESPACE, NAME).expect("CinderAPI is missing")["status"].clone()
}

fn config_hash(stateful_set: &Value) -> Option<String> {
    stateful_set
        .pointer("/spec/template/spec/containers")?
        .as_array()?
        .iter()
        .filter_map(|c| c["env"].as_array())
        .flatten()
        .find(|env| env["name"] == "CONFIG_HASH")
        .and_then(|env| env["value"].as_str())
        .map(String::from)
}

#[test]
fn cinder_api_converges_with_every_dependency_ready() {
    let kit = setup(converged_store());
    assert_eq!(ReconcileAction::Done, kit.reconcile(NAMESPACE, NAME).unwrap());

    let status = status(&kit);
    assert_eq!(json!(1), status["readyCount"]);
    assert_eq!(
        json!({
            "admin": "http://cinder-admin.openstack.svc:8776/v3/%(project_id)s",
            "internal": "http://cinder-internal.openstack.svc:8776/v3/%(project_id)s",
            "public": "http://cinder-public-openstack.apps.example.com/v3/%(project_id)s",
        }),
        status["apiEndpoint"]["cinderv3"]
    );
    assert_eq!(
        json!({
            "admin": "http://cinder-admin.openstack.svc:8776/v2/%(project_id)s",
            "internal": "http://cinder-internal.openstack.svc:8776/v2/%(project_id)s",
            "public": "http://cinder-public-openstack.apps.example.com/v2/%(project_id)s",
        }),
        status["apiEndpoint"]["cinderv2"]
    );
    assert_eq!(json!({"cinderv2": "cinderv2-id", "cinderv3": "cinderv3-id"}), status["serviceIDs"]);

    let store = kit.store();
    assert_eq!(3, store.objects_of_type(Service).len());
    assert_eq!(1, store.objects_of_type(Route).len());
    assert_eq!(2, store.objects_of_type(KeystoneService).len());
    assert!(store.get_object(ConfigMap, NAMESPACE, "cinder-api-config-data").is_some());

    let stateful_set = store
        .get_object(StatefulSet, NAMESPACE, NAME)
        .expect("StatefulSet was not created");
    assert_eq!(json!(1), stateful_set["spec"]["replicas"]);
    assert_eq!(
        status["hash"]["input"].as_str().map(String::from),
        config_hash(&stateful_set)
    );
}

#[test]
fn reconciling_a_converged_cinder_api_changes_nothing() {
    let kit = setup(converged_store());
    kit.reconcile_until_done(NAMESPACE, NAME, 5);
    let mutations = kit.store().mutation_count();
    let before = kit.get_cinder_api(NAMESPACE, NAME).unwrap();

    assert_eq!(ReconcileAction::Done, kit.reconcile(NAMESPACE, NAME).unwrap());
    assert_eq!(mutations, kit.store().mutation_count());
    assert_eq!(before, kit.get_cinder_api(NAMESPACE, NAME).unwrap());
}

#[test]
fn changing_the_password_secret_rolls_the_stateful_set() {
    let kit = setup(converged_store());
    kit.reconcile_until_done(NAMESPACE, NAME, 5);
    let old_hash = status(&kit)["hash"]["input"].clone();

    kit.store().insert(secret("b3RoZXI="));
    kit.reconcile_until_done(NAMESPACE, NAME, 5);

    let new_hash = status(&kit)["hash"]["input"].clone();
    assert_ne!(old_hash, new_hash);
    let stateful_set = kit.store().get_object(StatefulSet, NAMESPACE, NAME).unwrap();
    assert_eq!(new_hash.as_str().map(String::from), config_hash(&stateful_set));
}

#[test]
fn missing_secret_is_retried_until_it_shows_up() {
    let store = FakeStore::new().with_all_reactors();
    store.insert(cinder_api(json!({"secret": "osp-secret"})));
    seed_parent_config_maps(&store);
    let kit = setup(store);

    let err = kit.reconcile(NAMESPACE, NAME).unwrap_err();
    assert_eq!(Some(Duration::from_secs(10)), err.requeue_after());
    assert!(kit.store().get_object(StatefulSet, NAMESPACE, NAME).is_none());

    kit.store().insert(secret("MTIzNDU2Nzg="));
    kit.reconcile_until_done(NAMESPACE, NAME, 5);
    assert!(kit.store().get_object(StatefulSet, NAMESPACE, NAME).is_some());
}

#[test]
fn public_route_host_is_awaited_before_registering_endpoints() {
    let store = FakeStore::new().with_keystone_service_ids().with_ready_replicas();
    store.insert(cinder_api(json!({"secret": "osp-secret"})));
    store.insert(secret("MTIzNDU2Nzg="));
    seed_parent_config_maps(&store);
    let kit = setup(store);

    assert_eq!(
        ReconcileAction::RequeueAfter(Duration::from_secs(5)),
        kit.reconcile(NAMESPACE, NAME).unwrap()
    );
    assert!(kit.store().objects_of_type(KeystoneService).is_empty());

    kit.store().set_status(
        Route,
        NAMESPACE,
        "cinder-public",
        json!({"ingress": [{"host": "cinder.apps.example.com"}]}),
    );
    kit.reconcile_until_done(NAMESPACE, NAME, 5);
    assert_eq!(
        json!("http://cinder.apps.example.com/v3/%(project_id)s"),
        status(&kit)["apiEndpoint"]["cinderv3"]["public"]
    );
}

#[test]
fn deleting_a_cinder_api_removes_its_registrations_and_finalizer() {
    let kit = setup(converged_store());
    kit.reconcile_until_done(NAMESPACE, NAME, 5);
    assert_eq!(2, kit.store().objects_of_type(KeystoneService).len());

    kit.store().request_deletion(CinderAPI, NAMESPACE, NAME);
    assert!(kit.get_cinder_api(NAMESPACE, NAME).is_some());

    assert_eq!(ReconcileAction::Done, kit.reconcile(NAMESPACE, NAME).unwrap());
    assert!(kit.store().objects_of_type(KeystoneService).is_empty());
    assert!(kit.get_cinder_api(NAMESPACE, NAME).is_none());
}
