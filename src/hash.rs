//! Content hashes used for change detection. A change to any input the pods consume (the
//! password secret or one of the config maps) changes the aggregate input hash, which ends up
//! in the pod template and rolls the pods.
use k8s_openapi::api::core::v1::EnvVar;
use serde::Serialize;
use sha2::{Digest, Sha256};

use std::collections::BTreeMap;

/// Hex encoded sha256 of the JSON encoding of `value`
pub fn object_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Hash of the `data` of a secret or config map. Objects without data all hash the same.
pub fn data_hash(object: &serde_json::Value) -> Result<String, serde_json::Error> {
    let empty = serde_json::Value::Object(Default::default());
    object_hash(object.get("data").unwrap_or(&empty))
}

/// Content hashes of every input, keyed by the name of the object they came from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputHashes(BTreeMap<String, String>);

impl InputHashes {
    pub fn new() -> InputHashes {
        InputHashes::default()
    }

    pub fn record(&mut self, name: impl Into<String>, hash: impl Into<String>) {
        self.0.insert(name.into(), hash.into());
    }

    /// The recorded hashes as environment variables, sorted by name
    pub fn env_vars(&self) -> Vec<EnvVar> {
        self.0
            .iter()
            .map(|(name, hash)| EnvVar {
                name: name.clone(),
                value: Some(hash.clone()),
                ..Default::default()
            })
            .collect()
    }

    /// Aggregate hash over all the recorded hashes. Only determinism matters here.
    pub fn aggregate(&self) -> Result<String, serde_json::Error> {
        object_hash(&self.env_vars())
    }
}
