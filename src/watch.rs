//! Maps watch events to the `CinderAPI` resources that need to be reconciled because of them.
//!
//! Objects we generate carry a controlling owner reference, so they map straight to their
//! owner. The parent's config maps and the password secret are owned by someone else. For
//! those, the `ParentIndex` remembers which `CinderAPI`s depend on them.
use crate::cinder::PARENT_NAME_LABEL;
use crate::k8s_types::cinder_openstack_org::v1beta1::{Cinder, CinderAPI};
use crate::k8s_types::core::v1::{ConfigMap, Secret};
use crate::k8s_types::K8sType;
use crate::resource::{controller_of, object_id, owner_references, str_value, ObjectId};

use serde_json::Value;

use std::collections::{BTreeSet, HashMap};

/// What a `CinderAPI` depends on without owning it
#[derive(Debug, Clone, PartialEq, Default)]
struct Dependencies {
    parent: Option<ObjectId>,
    secret: Option<ObjectId>,
}

/// Secondary index from the identity of a parent `Cinder` (and of a secret) to the `CinderAPI`
/// resources that depend on it. Kept current from `CinderAPI` watch events.
#[derive(Debug, Default)]
pub struct ParentIndex {
    by_parent: HashMap<ObjectId, BTreeSet<ObjectId>>,
    by_secret: HashMap<ObjectId, BTreeSet<ObjectId>>,
    dependencies: HashMap<ObjectId, Dependencies>,
}

fn parent_of(cinder_api: &Value) -> Option<&str> {
    owner_references(cinder_api)
        .find(|owner| Cinder.matches(owner.api_version, owner.kind))
        .map(|owner| owner.name)
        .filter(|name| !name.is_empty())
}

fn unlink(index: &mut HashMap<ObjectId, BTreeSet<ObjectId>>, key: &ObjectId, id: &ObjectId) {
    let now_empty = match index.get_mut(key) {
        Some(ids) => {
            ids.remove(id);
            ids.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.remove(key);
    }
}

impl ParentIndex {
    pub fn new() -> ParentIndex {
        ParentIndex::default()
    }

    /// Adds or updates the entry of a `CinderAPI`
    pub fn upsert(&mut self, cinder_api: &Value) {
        let id = match object_id(cinder_api) {
            Some(id) => id.to_owned(),
            None => return,
        };
        let dependencies = Dependencies {
            parent: parent_of(cinder_api).map(|parent| ObjectId::new(id.namespace.as_str(), parent)),
            secret: str_value(cinder_api, "/spec/secret")
                .filter(|s| !s.is_empty())
                .map(|secret| ObjectId::new(id.namespace.as_str(), secret)),
        };
        self.remove(&id);
        if let Some(parent) = dependencies.parent.clone() {
            self.by_parent.entry(parent).or_default().insert(id.clone());
        }
        if let Some(secret) = dependencies.secret.clone() {
            self.by_secret.entry(secret).or_default().insert(id.clone());
        }
        self.dependencies.insert(id, dependencies);
    }

    pub fn remove(&mut self, id: &ObjectId) {
        if let Some(old) = self.dependencies.remove(id) {
            if let Some(parent) = old.parent.as_ref() {
                unlink(&mut self.by_parent, parent, id);
            }
            if let Some(secret) = old.secret.as_ref() {
                unlink(&mut self.by_secret, secret, id);
            }
        }
    }

    /// The `CinderAPI`s in `namespace` whose parent `Cinder` is named `parent`
    pub fn dependents(&self, namespace: &str, parent: &str) -> Vec<ObjectId> {
        lookup(&self.by_parent, namespace, parent)
    }

    /// The `CinderAPI`s in `namespace` that use the secret named `secret`
    pub fn secret_dependents(&self, namespace: &str, secret: &str) -> Vec<ObjectId> {
        lookup(&self.by_secret, namespace, secret)
    }

    /// True if a `CinderAPI` with this id has been seen and not deleted since
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

fn lookup(index: &HashMap<ObjectId, BTreeSet<ObjectId>>, namespace: &str, name: &str) -> Vec<ObjectId> {
    index
        .get(&ObjectId::new(namespace, name))
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default()
}

/// The `CinderAPI` that controls the object, if any
pub fn owner_request(object: &Value) -> Option<ObjectId> {
    let owner = controller_of(object).filter(|owner| CinderAPI.matches(owner.api_version, owner.kind))?;
    let namespace = str_value(object, "/metadata/namespace").unwrap_or("");
    Some(ObjectId::new(namespace, owner.name))
}

/// Requests for a config map event. Config maps that we generated map to their owner. The
/// others are matched to `CinderAPI`s through the parent name label.
pub fn config_map_requests(index: &ParentIndex, config_map: &Value) -> Vec<ObjectId> {
    if let Some(owner) = owner_request(config_map) {
        return vec![owner];
    }
    let namespace = str_value(config_map, "/metadata/namespace").unwrap_or("");
    match str_value(config_map, &label_pointer(PARENT_NAME_LABEL)).filter(|v| !v.is_empty()) {
        Some(parent) => index.dependents(namespace, parent),
        None => Vec::new(),
    }
}

fn label_pointer(label: &str) -> String {
    // '/' inside a json pointer segment is escaped as '~1'
    format!("/metadata/labels/{}", label.replace('~', "~0").replace('/', "~1"))
}

/// Maps any watched object to the `CinderAPI`s that need to be reconciled
pub fn requests_for(index: &ParentIndex, k8s_type: &K8sType, object: &Value) -> Vec<ObjectId> {
    if k8s_type == CinderAPI {
        return object_id(object).map(|id| id.to_owned()).into_iter().collect();
    }
    if k8s_type == ConfigMap {
        return config_map_requests(index, object);
    }
    if k8s_type == Secret {
        let namespace = str_value(object, "/metadata/namespace").unwrap_or("");
        let name = str_value(object, "/metadata/name").unwrap_or("");
        return index.secret_dependents(namespace, name);
    }
    owner_request(object).into_iter().collect()
}
