//! A reconcile pass brings everything that belongs to one `CinderAPI` in line with its spec.
//! Passes are idempotent: a pass that finds nothing to change doesn't write anything.
mod delete;
mod normal;

use crate::api::{CinderApi, CinderApiStatus, TlsError};
use crate::client::{self, Patch};
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef};
use crate::store::ObjectStore;

use serde_json::json;

use std::fmt::{self, Display};
use std::time::Duration;

/// What the caller should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileAction {
    Done,
    /// Something we depend on isn't ready yet, try again after the delay
    RequeueAfter(Duration),
}

#[derive(Debug)]
pub enum ReconcileError {
    Client(client::Error),
    /// A dependency that someone else provides is missing
    NotReady {
        message: String,
        requeue_after: Duration,
    },
    Render(TlsError),
    Serde(serde_json::Error),
    InvalidResource(InvalidResourceError),
}

impl ReconcileError {
    pub fn not_ready(message: impl Into<String>, requeue_after: Duration) -> ReconcileError {
        ReconcileError::NotReady {
            message: message.into(),
            requeue_after,
        }
    }

    /// The delay before the next attempt, if the error asks for a specific one
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::NotReady { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Client(e) => write!(f, "Client error: {}", e),
            ReconcileError::NotReady { message, .. } => f.write_str(message),
            ReconcileError::Render(e) => write!(f, "Failed to render StatefulSet: {}", e),
            ReconcileError::Serde(e) => write!(f, "(De)Serialization error: {}", e),
            ReconcileError::InvalidResource(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Client(e) => Some(e),
            ReconcileError::Render(e) => Some(e),
            ReconcileError::Serde(e) => Some(e),
            ReconcileError::InvalidResource(e) => Some(e),
            ReconcileError::NotReady { .. } => None,
        }
    }
}

impl From<client::Error> for ReconcileError {
    fn from(e: client::Error) -> ReconcileError {
        ReconcileError::Client(e)
    }
}

impl From<TlsError> for ReconcileError {
    fn from(e: TlsError) -> ReconcileError {
        ReconcileError::Render(e)
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> ReconcileError {
        ReconcileError::Serde(e)
    }
}

impl From<InvalidResourceError> for ReconcileError {
    fn from(e: InvalidResourceError) -> ReconcileError {
        ReconcileError::InvalidResource(e)
    }
}

/// State of a single pass. `persisted` is the status as the api server last saw it, so the
/// final status patch is only sent when something changed.
#[derive(Debug)]
struct Pass {
    resource: K8sResource,
    instance: CinderApi,
    persisted: Option<CinderApiStatus>,
}

impl Pass {
    fn status(&mut self) -> &mut CinderApiStatus {
        self.instance.initialize_status()
    }
}

#[derive(Debug)]
pub struct Reconciler<S> {
    store: S,
    finalizer: String,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, finalizer: impl Into<String>) -> Reconciler<S> {
        Reconciler {
            store,
            finalizer: finalizer.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn finalizer(&self) -> &str {
        self.finalizer.as_str()
    }

    pub async fn reconcile(&self, id: &ObjectIdRef<'_>) -> Result<ReconcileAction, ReconcileError> {
        let value = match self.store.get(CinderAPI, id).await? {
            Some(value) => value,
            None => {
                log::debug!("CinderAPI {} no longer exists, nothing to do", id);
                return Ok(ReconcileAction::Done);
            }
        };
        let resource = K8sResource::from_value(value)?;
        let instance: CinderApi = serde_json::from_value(resource.as_ref().clone())?;
        let mut pass = Pass {
            persisted: instance.status.clone(),
            resource,
            instance,
        };
        pass.instance.initialize_status();

        let result = if pass.instance.is_deleting() {
            log::info!("Reconciling deletion of CinderAPI {}", id);
            delete::reconcile_delete(self, &mut pass).await
        } else {
            log::debug!("Reconciling CinderAPI {}", id);
            normal::reconcile_normal(self, &mut pass).await
        };

        self.persist_status(&mut pass).await;
        match result {
            Ok(ReconcileAction::Done) => log::info!("Reconciled CinderAPI {}", id),
            Ok(ReconcileAction::RequeueAfter(delay)) => {
                log::info!("CinderAPI {} is not ready yet, requeue after {:?}", id, delay)
            }
            Err(ref err) => log::error!("Failed to reconcile CinderAPI {}: {}", id, err),
        }
        result
    }

    /// Writes the status right away
    async fn save_status(&self, pass: &mut Pass) -> Result<(), client::Error> {
        let patch = Patch::merge(json!({ "status": pass.instance.status }));
        self.store
            .patch_status(CinderAPI, &pass.instance.id(), &patch)
            .await?;
        pass.persisted = pass.instance.status.clone();
        Ok(())
    }

    /// Runs at the end of every pass, whatever the outcome
    async fn persist_status(&self, pass: &mut Pass) {
        if pass.instance.status == pass.persisted {
            return;
        }
        match self.save_status(pass).await {
            Ok(()) => {}
            Err(ref err) if err.is_not_found() => {
                log::debug!("CinderAPI {} was deleted before its status was saved", pass.instance.id());
            }
            Err(err) => {
                log::error!("Failed to save status of CinderAPI {}: {}", pass.instance.id(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::apps::v1::StatefulSet;
    use crate::k8s_types::core::v1::ConfigMap;
    use crate::k8s_types::keystone_openstack_org::v1beta1::KeystoneService;
    use crate::k8s_types::route_openshift_io::v1::Route;
    use crate::testkit::{FakeStore, TestKit};
    use serde_json::Value;

    fn cinder_api(spec: Value) -> Value {
        json!({
            "apiVersion": "cinder.openstack.org/v1beta1",
            "kind": "CinderAPI",
            "metadata": {
                "namespace": "openstack",
                "name": "cinder-api",
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

    fn seed_dependencies(store: &FakeStore) {
        store.insert(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"namespace": "openstack", "name": "osp-secret"},
            "data": {"CinderPassword": "MTIzNDU2Nzg="},
        }));
        for name in ["cinder-scripts", "cinder-config-data"].iter() {
            store.insert(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"namespace": "openstack", "name": name},
                "data": {"file": name},
            }));
        }
    }

    fn status(kit: &TestKit) -> Value {
        kit.get_cinder_api("openstack", "cinder-api").unwrap()["status"].clone()
    }

    #[test]
    fn missing_resource_is_done_without_writes() {
        let kit = TestKit::new(FakeStore::new());
        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "nope").unwrap());
        assert_eq!(0, kit.store().mutation_count());
    }

    #[test]
    fn other_fetch_errors_are_surfaced() {
        let store = FakeStore::new();
        store.fail_on("get", CinderAPI, 500);
        let kit = TestKit::new(store);
        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert!(matches!(err, ReconcileError::Client(_)));
        assert_eq!(None, err.requeue_after());
    }

    #[test]
    fn missing_secret_requeues_after_ten_seconds() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        let kit = TestKit::new(store);

        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert_eq!(Some(Duration::from_secs(10)), err.requeue_after());
        assert_eq!("OpenStack secret osp-secret not found", err.to_string());

        let api = kit.get_cinder_api("openstack", "cinder-api").unwrap();
        assert_eq!(json!(["openstack.org/cinderapi"]), api["metadata"]["finalizers"]);
        // status maps were initialized and persisted even though the pass failed
        assert_eq!(json!({}), api["status"]["hash"]);
        assert_eq!(json!({}), api["status"]["apiEndpoint"]);
        assert_eq!(json!({}), api["status"]["serviceIDs"]);
    }

    #[test]
    fn missing_parent_config_maps_requeue_after_ten_seconds() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        store.insert(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"namespace": "openstack", "name": "osp-secret"},
            "data": {},
        }));
        let kit = TestKit::new(store);

        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert_eq!(Some(Duration::from_secs(10)), err.requeue_after());
        assert_eq!(
            "Could not find all config maps for parent Cinder CR cinder",
            err.to_string()
        );
        // the service config map is created before the parent config maps are checked
        assert!(kit
            .store()
            .get_object(crate::k8s_types::core::v1::ConfigMap, "openstack", "cinder-api-config-data")
            .is_some());
    }

    #[test]
    fn converges_in_one_pass_when_dependencies_react() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret", "replicas": 1})));
        seed_dependencies(&store);
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        let status = status(&kit);
        assert_eq!(json!(1), status["readyCount"]);
        assert_eq!(json!("cinderv2-id"), status["serviceIDs"]["cinderv2"]);
        assert_eq!(json!("cinderv3-id"), status["serviceIDs"]["cinderv3"]);
        assert_eq!(3, status["apiEndpoint"]["cinderv2"].as_object().unwrap().len());
        assert_eq!(3, status["apiEndpoint"]["cinderv3"].as_object().unwrap().len());
        assert_eq!(64, status["hash"]["input"].as_str().unwrap().len());
    }

    #[test]
    fn second_pass_makes_no_changes() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        seed_dependencies(&store);
        let kit = TestKit::new(store);

        kit.reconcile("openstack", "cinder-api").unwrap();
        let mutations = kit.store().mutation_count();
        let input_hash = status(&kit)["hash"]["input"].clone();

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert_eq!(mutations, kit.store().mutation_count());
        assert_eq!(input_hash, status(&kit)["hash"]["input"]);
    }

    #[test]
    fn failed_input_hash_write_is_a_hard_error() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        seed_dependencies(&store);
        store.fail_on("patch_status", CinderAPI, 500);
        let kit = TestKit::new(store);

        // the input hash is written immediately, and that write failing is a hard error
        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert!(matches!(err, ReconcileError::Client(_)));
    }

    #[test]
    fn failed_final_status_write_keeps_the_outcome_of_the_pass() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        store.fail_on("patch_status", CinderAPI, 500);
        let kit = TestKit::new(store);

        let err = kit.reconcile("openstack", "cinder-api").unwrap_err();
        assert_eq!(Some(Duration::from_secs(10)), err.requeue_after());
        assert_eq!("OpenStack secret osp-secret not found", err.to_string());
        assert!(kit
            .store()
            .calls()
            .contains(&"patch_status CinderAPI openstack/cinder-api".to_owned()));
    }

    #[test]
    fn service_config_map_failure_does_not_stop_the_pass() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({"secret": "osp-secret"})));
        seed_dependencies(&store);
        store.fail_on("create", ConfigMap, 500);
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert!(kit
            .store()
            .get_object(ConfigMap, "openstack", "cinder-api-config-data")
            .is_none());
        assert!(kit.store().get_object(StatefulSet, "openstack", "cinder-api").is_some());
        assert_eq!(json!(1), status(&kit)["readyCount"]);
    }

    #[test]
    fn switching_public_tls_off_is_rolled_out() {
        let store = FakeStore::new().with_all_reactors();
        store.insert(cinder_api(json!({
            "secret": "osp-secret",
            "tls": {"api": {"public": {"secretName": "cert-public"}}},
        })));
        seed_dependencies(&store);
        let kit = TestKit::new(store);

        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        let public_url = status(&kit)["apiEndpoint"]["cinderv3"]["public"].clone();
        assert!(public_url.as_str().unwrap().starts_with("https://"));
        let sts = kit.store().get_object(StatefulSet, "openstack", "cinder-api").unwrap();
        assert!(volume_names(&sts).contains(&"public-tls-certs".to_owned()));

        let mut api = kit.get_cinder_api("openstack", "cinder-api").unwrap();
        api["spec"]["tls"] = json!({});
        kit.store().insert(api);
        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());

        let public_url = status(&kit)["apiEndpoint"]["cinderv3"]["public"].clone();
        assert!(public_url.as_str().unwrap().starts_with("http://"));
        let route = kit.store().get_object(Route, "openstack", "cinder-public").unwrap();
        assert!(route["spec"].get("tls").map_or(true, Value::is_null));
        let sts = kit.store().get_object(StatefulSet, "openstack", "cinder-api").unwrap();
        assert!(!volume_names(&sts).contains(&"public-tls-certs".to_owned()));
        let probe = &sts["spec"]["template"]["spec"]["containers"][1]["readinessProbe"];
        assert_eq!(json!("HTTP"), probe["httpGet"]["scheme"]);
        let keystone = kit.store().get_object(KeystoneService, "openstack", "cinderv3").unwrap();
        assert_eq!(public_url, keystone["spec"]["apiEndpoints"]["public"]);

        // and the result is stable again
        let mutations = kit.store().mutation_count();
        assert_eq!(ReconcileAction::Done, kit.reconcile("openstack", "cinder-api").unwrap());
        assert_eq!(mutations, kit.store().mutation_count());
    }

    fn volume_names(stateful_set: &Value) -> Vec<String> {
        stateful_set["spec"]["template"]["spec"]["volumes"]
            .as_array()
            .map(|volumes| {
                volumes
                    .iter()
                    .filter_map(|v| v["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}
