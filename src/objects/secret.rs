use crate::client::Error;
use crate::hash::data_hash;
use crate::k8s_types::core::v1::Secret;
use crate::resource::ObjectIdRef;
use crate::store::ObjectStore;

use serde_json::Value;

/// Fetches a secret along with the hash of its data. Returns `None` if it doesn't exist.
pub async fn get_secret<S: ObjectStore + ?Sized>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<Option<(Value, String)>, Error> {
    let id = ObjectIdRef::new(namespace, name);
    match store.get(Secret, &id).await? {
        Some(secret) => {
            let hash = data_hash(&secret)?;
            Ok(Some((secret, hash)))
        }
        None => Ok(None),
    }
}
