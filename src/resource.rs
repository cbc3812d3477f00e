pub mod object_id;

use crate::k8s_types::K8sType;

use serde_json::{json, Value};

pub use self::object_id::{ObjectId, ObjectIdRef};

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// An untyped Kubernetes object, as received from a watch or list. Construction validates
/// that the fields every object must have are present, so the accessors don't need to
/// return options for them.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        match K8sResource::validate(&value) {
            Ok(()) => Ok(K8sResource(value)),
            Err(message) => Err(InvalidResourceError { message, value }),
        }
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        str_value(value, "/metadata/name").ok_or("missing metadata.name")?;
        str_value(value, "/metadata/resourceVersion").ok_or("missing metadata.resourceVersion")?;
        str_value(value, "/apiVersion").ok_or("missing apiVersion")?;
        str_value(value, "/kind").ok_or("missing kind")?;
        Ok(())
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or_default()
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        str_value(&self.0, pointer)
    }
}

impl AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The parts of a `metadata.ownerReferences` entry that we look at
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct OwnerRef<'a> {
    pub api_version: &'a str,
    pub kind: &'a str,
    pub name: &'a str,
    pub uid: &'a str,
    pub controller: bool,
}

impl<'a> OwnerRef<'a> {
    fn from_value(value: &'a Value) -> Option<OwnerRef<'a>> {
        Some(OwnerRef {
            api_version: str_value(value, "/apiVersion")?,
            kind: str_value(value, "/kind")?,
            name: str_value(value, "/name")?,
            uid: str_value(value, "/uid").unwrap_or(""),
            controller: value
                .get("controller")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

pub fn owner_references(value: &Value) -> impl Iterator<Item = OwnerRef<'_>> {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(OwnerRef::from_value)
}

pub fn controller_of(value: &Value) -> Option<OwnerRef<'_>> {
    owner_references(value).find(|owner| owner.controller)
}

/// Builds a controlling owner reference, which makes the api server garbage collect the
/// owned object when the owner is deleted
pub fn controller_reference(owner_type: &K8sType, name: &str, uid: &str) -> Value {
    json!({
        "apiVersion": owner_type.api_version,
        "kind": owner_type.kind,
        "name": name,
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

pub fn object_id(json: &Value) -> Option<ObjectIdRef> {
    let namespace = str_value(json, "/metadata/namespace").unwrap_or("");
    str_value(json, "/metadata/name").map(|name| ObjectIdRef::new(namespace, name))
}

pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}
