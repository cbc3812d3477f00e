//! Tools for testing the reconciler without a cluster. `FakeStore` is an in-memory
//! `ObjectStore` that behaves enough like the api server for our purposes: it assigns uids and
//! resourceVersions, applies JSON merge patches, treats `status` as a subresource and honors
//! finalizers on delete. Reactors stand in for the other controllers that we wait on.
use crate::client::{Error, Patch};
use crate::config::DEFAULT_FINALIZER;
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::k8s_types::K8sType;
use crate::reconcile::{ReconcileAction, ReconcileError, Reconciler};
use crate::resource::{str_value, ObjectId, ObjectIdRef};
use crate::store::ObjectStore;

use async_trait::async_trait;
use http::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::runtime::{self, Runtime};

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait ToJson {
    fn to_json(&self) -> Value;
}

impl<T: Serialize> ToJson for T {
    fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("failed to serialize value")
    }
}

/// Simulates a controller that reacts to objects we create or patch
#[derive(Debug, Clone, PartialEq)]
enum Reactor {
    /// Admits Routes, assigning `<name>-<namespace>.<domain>` as host
    RouteHosts(String),
    /// Reports a service id of `<name>-id` for every KeystoneService
    KeystoneServiceIds,
    /// Reports all desired replicas of a StatefulSet as ready
    ReadyReplicas,
}

impl Reactor {
    fn react(&self, kind: &str, object: &mut Value) {
        let name = str_value(object, "/metadata/name").unwrap_or("").to_owned();
        match self {
            Reactor::RouteHosts(domain) if kind == "Route" => {
                let namespace = str_value(object, "/metadata/namespace").unwrap_or("");
                let host = format!("{}-{}.{}", name, namespace, domain);
                object["status"] = json!({"ingress": [{"host": host}]});
            }
            Reactor::KeystoneServiceIds if kind == "KeystoneService" => {
                object["status"] = json!({"serviceID": format!("{}-id", name)});
            }
            Reactor::ReadyReplicas if kind == "StatefulSet" => {
                let replicas = object
                    .pointer("/spec/replicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                object["status"] = json!({"replicas": replicas, "readyReplicas": replicas});
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
struct Failure {
    verb: String,
    kind: &'static str,
    status: StatusCode,
}

type TypeKey = (String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(TypeKey, ObjectId), Value>,
    last_uid: u64,
    last_resource_version: u64,
    mutations: usize,
    calls: Vec<String>,
    failures: Vec<Failure>,
    reactors: Vec<Reactor>,
}

impl State {
    fn record(&mut self, verb: &str, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error> {
        self.calls.push(format!("{} {} {}", verb, k8s_type.kind, id));
        match self
            .failures
            .iter()
            .find(|f| f.verb == verb && f.kind == k8s_type.kind)
        {
            Some(failure) => Err(Error::http(failure.status)),
            None => Ok(()),
        }
    }

    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn react(&self, kind: &str, object: &mut Value) {
        for reactor in self.reactors.iter() {
            reactor.react(kind, object);
        }
    }
}

fn type_key(k8s_type: &K8sType) -> TypeKey {
    (k8s_type.api_version.to_owned(), k8s_type.kind.to_owned())
}

fn key(k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> (TypeKey, ObjectId) {
    (type_key(k8s_type), id.to_owned())
}

fn not_found() -> Error {
    Error::http(StatusCode::NOT_FOUND)
}

fn conflict() -> Error {
    Error::http(StatusCode::CONFLICT)
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Some(target_fields) = target.as_object_mut() {
                for (key, value) in fields {
                    if value.is_null() {
                        target_fields.remove(key);
                    } else {
                        let entry = target_fields.entry(key.clone()).or_insert(Value::Null);
                        merge_patch(entry, value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn finalizers(object: &Value) -> usize {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

fn is_deleting(object: &Value) -> bool {
    object.pointer("/metadata/deletionTimestamp").is_some()
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    selector
        .into_iter()
        .flat_map(|s| s.split(','))
        .filter(|requirement| !requirement.is_empty())
        .all(|requirement| {
            let mut parts = requirement.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            object
                .pointer("/metadata/labels")
                .and_then(|labels| labels.get(key))
                .and_then(Value::as_str)
                == Some(value)
        })
}

/// In-memory object store. Clones share the same objects.
#[derive(Clone, Default)]
pub struct FakeStore(Arc<Mutex<State>>);

impl Debug for FakeStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("FakeStore")
    }
}

impl FakeStore {
    pub fn new() -> FakeStore {
        FakeStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panicking test may have poisoned the lock, the state is still usable
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_reactor(self, reactor: Reactor) -> FakeStore {
        self.lock().reactors.push(reactor);
        self
    }

    pub fn with_route_hosts(self, domain: &str) -> FakeStore {
        self.with_reactor(Reactor::RouteHosts(domain.to_owned()))
    }

    pub fn with_keystone_service_ids(self) -> FakeStore {
        self.with_reactor(Reactor::KeystoneServiceIds)
    }

    pub fn with_ready_replicas(self) -> FakeStore {
        self.with_reactor(Reactor::ReadyReplicas)
    }

    /// Everything the reconciler waits on happens right away
    pub fn with_all_reactors(self) -> FakeStore {
        self.with_route_hosts("apps.example.com")
            .with_keystone_service_ids()
            .with_ready_replicas()
    }

    /// Adds an object as if someone else had created it. This is not counted as a mutation.
    /// The type is taken from the object's apiVersion and kind.
    pub fn insert(&self, object: impl ToJson) {
        let mut object = object.to_json();
        let mut state = self.lock();
        let api_version = str_value(&object, "/apiVersion").unwrap_or("").to_owned();
        let kind = str_value(&object, "/kind").unwrap_or("").to_owned();
        let id = ObjectId::new(
            str_value(&object, "/metadata/namespace").unwrap_or(""),
            str_value(&object, "/metadata/name").unwrap_or(""),
        );
        if object.pointer("/metadata/uid").is_none() {
            state.last_uid += 1;
            object["metadata"]["uid"] = json!(format!("uid-{}", state.last_uid));
        }
        object["metadata"]["resourceVersion"] = json!(state.next_resource_version());
        state.objects.insert(((api_version, kind), id), object);
    }

    pub fn get_object(&self, k8s_type: &K8sType, namespace: &str, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&key(k8s_type, &ObjectIdRef::new(namespace, name)))
            .cloned()
    }

    pub fn objects_of_type(&self, k8s_type: &K8sType) -> Vec<Value> {
        let type_key = type_key(k8s_type);
        self.lock()
            .objects
            .iter()
            .filter(|((t, _), _)| *t == type_key)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Replaces the status of an object, as the controller responsible for it would
    pub fn set_status(&self, k8s_type: &K8sType, namespace: &str, name: &str, status: Value) {
        let mut state = self.lock();
        let version = state.next_resource_version();
        if let Some(object) = state
            .objects
            .get_mut(&key(k8s_type, &ObjectIdRef::new(namespace, name)))
        {
            object["status"] = status;
            object["metadata"]["resourceVersion"] = json!(version);
        }
    }

    /// Deletes an object the way a user would. Objects with finalizers only get a deletion
    /// timestamp. Not counted as a mutation.
    pub fn request_deletion(&self, k8s_type: &K8sType, namespace: &str, name: &str) {
        let mut state = self.lock();
        let key = key(k8s_type, &ObjectIdRef::new(namespace, name));
        let version = state.next_resource_version();
        let remove = match state.objects.get_mut(&key) {
            Some(object) if finalizers(object) > 0 => {
                object["metadata"]["deletionTimestamp"] = json!("2021-01-01T00:00:00Z");
                object["metadata"]["resourceVersion"] = json!(version);
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            state.objects.remove(&key);
        }
    }

    /// Makes every following `verb` ("get", "create", "patch", ...) on objects of the given
    /// type fail with the http status
    pub fn fail_on(&self, verb: &str, k8s_type: &K8sType, status: u16) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.lock().failures.push(Failure {
            verb: verb.to_owned(),
            kind: k8s_type.kind,
            status,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of successful create, patch and delete calls
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// Every call in the form `<verb> <kind> <namespace>/<name>`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error> {
        let mut state = self.lock();
        state.record("get", k8s_type, id)?;
        Ok(state.objects.get(&key(k8s_type, id)).cloned())
    }

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Error> {
        let mut state = self.lock();
        let all = ObjectIdRef::new(namespace.unwrap_or(""), "*");
        state.record("list", k8s_type, &all)?;
        let type_key = type_key(k8s_type);
        Ok(state
            .objects
            .iter()
            .filter(|((t, id), _)| {
                *t == type_key && namespace.map_or(true, |ns| ns == id.namespace)
            })
            .map(|(_, object)| object)
            .filter(|object| matches_selector(object, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<Value, Error> {
        let mut state = self.lock();
        let id = ObjectId::new(
            str_value(resource, "/metadata/namespace").unwrap_or(""),
            str_value(resource, "/metadata/name").unwrap_or(""),
        );
        state.record("create", k8s_type, &id.as_id_ref())?;
        let key = key(k8s_type, &id.as_id_ref());
        if state.objects.contains_key(&key) {
            return Err(conflict());
        }

        let mut object = resource.clone();
        if let Some(fields) = object.as_object_mut() {
            fields.remove("status");
            fields.insert("apiVersion".to_owned(), json!(k8s_type.api_version));
            fields.insert("kind".to_owned(), json!(k8s_type.kind));
        }
        state.last_uid += 1;
        object["metadata"]["uid"] = json!(format!("uid-{}", state.last_uid));
        object["metadata"]["resourceVersion"] = json!(state.next_resource_version());
        state.react(k8s_type.kind, &mut object);

        state.mutations += 1;
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn patch(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        let mut state = self.lock();
        state.record("patch", k8s_type, id)?;
        let key = key(k8s_type, id);
        let mut object = state.objects.get(&key).cloned().ok_or_else(not_found)?;
        let expected_version = str_value(patch.value(), "/metadata/resourceVersion");
        if expected_version.is_some() && expected_version != str_value(&object, "/metadata/resourceVersion") {
            return Err(conflict());
        }

        let mut changes = patch.value().clone();
        if let Some(fields) = changes.as_object_mut() {
            fields.remove("status");
        }
        merge_patch(&mut object, &changes);
        object["metadata"]["resourceVersion"] = json!(state.next_resource_version());
        state.react(k8s_type.kind, &mut object);

        state.mutations += 1;
        if is_deleting(&object) && finalizers(&object) == 0 {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, object.clone());
        }
        Ok(object)
    }

    async fn patch_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        let mut state = self.lock();
        state.record("patch_status", k8s_type, id)?;
        let key = key(k8s_type, id);
        let mut object = state.objects.get(&key).cloned().ok_or_else(not_found)?;
        if let Some(status) = patch.value().get("status") {
            let mut current = object.get("status").cloned().unwrap_or(Value::Null);
            merge_patch(&mut current, status);
            object["status"] = current;
        }
        object["metadata"]["resourceVersion"] = json!(state.next_resource_version());

        state.mutations += 1;
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error> {
        let mut state = self.lock();
        state.record("delete", k8s_type, id)?;
        let key = key(k8s_type, id);
        let version = state.next_resource_version();
        let remove = match state.objects.get_mut(&key) {
            None => return Err(not_found()),
            Some(object) if finalizers(object) > 0 => {
                object["metadata"]["deletionTimestamp"] = json!("2021-01-01T00:00:00Z");
                object["metadata"]["resourceVersion"] = json!(version);
                false
            }
            Some(_) => true,
        };
        if remove {
            state.objects.remove(&key);
        }
        state.mutations += 1;
        Ok(())
    }
}

/// Drives a `Reconciler` backed by a `FakeStore` from synchronous tests
pub struct TestKit {
    runtime: Runtime,
    reconciler: Reconciler<FakeStore>,
    store: FakeStore,
}

impl Debug for TestKit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestKit").field("store", &self.store).finish()
    }
}

impl TestKit {
    pub fn new(store: FakeStore) -> TestKit {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create runtime");
        let reconciler = Reconciler::new(store.clone(), DEFAULT_FINALIZER);
        TestKit {
            runtime,
            reconciler,
            store,
        }
    }

    pub fn store(&self) -> &FakeStore {
        &self.store
    }

    pub fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileAction, ReconcileError> {
        let id = ObjectIdRef::new(namespace, name);
        self.runtime.block_on(self.reconciler.reconcile(&id))
    }

    pub fn get_cinder_api(&self, namespace: &str, name: &str) -> Option<Value> {
        self.store.get_object(CinderAPI, namespace, name)
    }

    /// Reconciles until the reconciler has nothing left to do, without waiting for requeue
    /// delays. Panics if that takes more than `max_passes`.
    pub fn reconcile_until_done(&self, namespace: &str, name: &str, max_passes: usize) {
        for _ in 0..max_passes {
            match self.reconcile(namespace, name) {
                Ok(ReconcileAction::Done) => return,
                Ok(ReconcileAction::RequeueAfter(delay)) => {
                    log::debug!("requeue after {:?}", delay);
                }
                Err(err) => panic!("reconcile of {}/{} failed: {}", namespace, name, err),
            }
        }
        panic!(
            "{}/{} was not reconciled within {} passes",
            namespace, name, max_passes
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::core::v1::ConfigMap;

    #[test]
    fn merge_patch_follows_rfc_7386() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}, "list": [1, 2]});
        merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}, "list": [3]}));
        assert_eq!(json!({"a": "z", "c": {"d": "e"}, "list": [3]}), target);
    }

    #[test]
    fn patch_ignores_status_and_patch_status_only_changes_status() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let id = ObjectIdRef::new("ns", "cm");
            store
                .create(ConfigMap, &json!({"metadata": {"namespace": "ns", "name": "cm"}}))
                .await
                .unwrap();

            let patched = store
                .patch(ConfigMap, &id, &Patch::merge(json!({"data": {"a": "1"}, "status": {"x": 1}})))
                .await
                .unwrap();
            assert_eq!(json!("1"), patched["data"]["a"]);
            assert!(patched.get("status").is_none());

            let patched = store
                .patch_status(ConfigMap, &id, &Patch::merge(json!({"data": {"a": "2"}, "status": {"x": 1}})))
                .await
                .unwrap();
            assert_eq!(json!("1"), patched["data"]["a"]);
            assert_eq!(json!(1), patched["status"]["x"]);
            assert_eq!(3, store.mutation_count());
        });
    }

    #[test]
    fn stale_resource_version_is_a_conflict() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let id = ObjectIdRef::new("ns", "cm");
            store
                .create(ConfigMap, &json!({"metadata": {"namespace": "ns", "name": "cm"}}))
                .await
                .unwrap();
            let err = store
                .patch(ConfigMap, &id, &Patch::finalizers("0", &["f".to_owned()]))
                .await
                .unwrap_err();
            assert!(err.is_conflict());
        });
    }

    #[test]
    fn objects_with_finalizers_are_only_marked_for_deletion() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let id = ObjectIdRef::new("ns", "cm");
            let created = store
                .create(ConfigMap, &json!({"metadata": {"namespace": "ns", "name": "cm", "finalizers": ["f"]}}))
                .await
                .unwrap();
            store.delete(ConfigMap, &id).await.unwrap();
            let marked = store.get_object(ConfigMap, "ns", "cm").unwrap();
            assert!(is_deleting(&marked));

            let version = str_value(&marked, "/metadata/resourceVersion").unwrap().to_owned();
            assert_ne!(str_value(&created, "/metadata/resourceVersion"), Some(version.as_str()));
            store.patch(ConfigMap, &id, &Patch::finalizers(&version, &[])).await.unwrap();
            assert!(store.get_object(ConfigMap, "ns", "cm").is_none());
        });
    }

    #[test]
    fn list_filters_by_namespace_and_labels() {
        let store = FakeStore::new();
        store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"namespace": "a", "name": "one", "labels": {"app": "x"}}}));
        store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"namespace": "a", "name": "two"}}));
        store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"namespace": "b", "name": "three", "labels": {"app": "x"}}}));
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        let listed = rt
            .block_on(store.list(ConfigMap, Some("a"), Some("app=x")))
            .unwrap();
        assert_eq!(1, listed.len());
        assert_eq!(json!("one"), listed[0]["metadata"]["name"]);
    }
}
