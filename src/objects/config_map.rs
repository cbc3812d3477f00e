use crate::api::CinderApi;
use crate::cinder::{config_data_name, scripts_name, CUSTOM_CONFIG_KEY, LABEL_GROUP};
use crate::client::Error;
use crate::hash::data_hash;
use crate::k8s_types::core::v1::ConfigMap;
use crate::labels::owner_labels;
use crate::objects::{apply, owner_reference};
use crate::resource::ObjectIdRef;
use crate::store::ObjectStore;

use serde_json::{json, Map, Value};

use std::collections::BTreeMap;

/// The config map data for the service. Entries of `defaultConfigOverwrite` come first, then
/// the custom config blob, which wins over an override of the same name.
pub fn service_config_data(instance: &CinderApi) -> BTreeMap<String, String> {
    let mut data = instance.spec.default_config_overwrite.clone();
    data.insert(
        CUSTOM_CONFIG_KEY.to_owned(),
        instance.spec.custom_service_config.clone(),
    );
    data
}

/// Creates or updates `<name>-config-data` and returns the hash of its data
pub async fn ensure_service_config<S: ObjectStore + ?Sized>(
    store: &S,
    instance: &CinderApi,
) -> Result<(String, String), Error> {
    let name = config_data_name(instance.name());
    let id = ObjectIdRef::new(instance.namespace(), name.as_str());
    let existing = store.get(ConfigMap, &id).await?;

    let mut data = Map::new();
    // keys that are no longer wanted get removed by the merge patch
    if let Some(old) = existing
        .as_ref()
        .and_then(|cm| cm.get("data"))
        .and_then(Value::as_object)
    {
        for key in old.keys() {
            data.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in service_config_data(instance) {
        data.insert(key, Value::String(value));
    }

    let desired = json!({
        "apiVersion": ConfigMap.api_version,
        "kind": ConfigMap.kind,
        "metadata": {
            "namespace": instance.namespace(),
            "name": name,
            "labels": owner_labels(instance, LABEL_GROUP),
            "ownerReferences": [owner_reference(instance)],
        },
        "data": data,
    });
    let config_map = apply(store, ConfigMap, &id, existing, &desired).await?;
    let hash = data_hash(&config_map)?;
    Ok((name, hash))
}

/// Hashes of the config maps that the parent `Cinder` generates for its services, keyed by
/// name. Returns `None` unless all of them exist.
pub async fn parent_config_hashes<S: ObjectStore + ?Sized>(
    store: &S,
    namespace: &str,
    parent: &str,
) -> Result<Option<Vec<(String, String)>>, Error> {
    let mut hashes = Vec::with_capacity(2);
    for name in [scripts_name(parent), config_data_name(parent)].iter() {
        match store.get(ConfigMap, &ObjectIdRef::new(namespace, name)).await? {
            Some(config_map) => hashes.push((name.clone(), data_hash(&config_map)?)),
            None => {
                log::debug!("config map {}/{} does not exist yet", namespace, name);
                return Ok(None);
            }
        }
    }
    Ok(Some(hashes))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::FakeStore;
    use tokio::runtime;

    fn instance(spec: Value) -> CinderApi {
        serde_json::from_value(json!({
            "metadata": {"name": "cinder-api", "namespace": "openstack", "uid": "u-1"},
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn custom_config_wins_over_an_override_of_the_same_name() {
        let data = service_config_data(&instance(json!({
            "customServiceConfig": "[DEFAULT]\ndebug = true",
            "defaultConfigOverwrite": {"custom.conf": "ignored", "policy.yaml": "rules"}
        })));
        assert_eq!(Some("[DEFAULT]\ndebug = true"), data.get("custom.conf").map(String::as_str));
        assert_eq!(Some("rules"), data.get("policy.yaml").map(String::as_str));
    }

    #[test]
    fn service_config_map_is_owned_and_labeled() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let api = instance(json!({"customServiceConfig": "x"}));
            let (name, hash) = ensure_service_config(&store, &api).await.unwrap();
            assert_eq!("cinder-api-config-data", name);
            assert_eq!(64, hash.len());

            let cm = store.get_object(ConfigMap, "openstack", "cinder-api-config-data").unwrap();
            assert_eq!(json!("x"), cm["data"]["custom.conf"]);
            assert_eq!(json!("u-1"), cm["metadata"]["labels"]["cinder.openstack.org/uid"]);
            assert_eq!(json!("CinderAPI"), cm["metadata"]["ownerReferences"][0]["kind"]);
            assert_eq!(json!(true), cm["metadata"]["ownerReferences"][0]["controller"]);
        });
    }

    #[test]
    fn removed_overrides_are_deleted_from_the_config_map() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            let with_policy = instance(json!({"defaultConfigOverwrite": {"policy.yaml": "rules"}}));
            let (_, first) = ensure_service_config(&store, &with_policy).await.unwrap();

            let without = instance(json!({}));
            let (_, second) = ensure_service_config(&store, &without).await.unwrap();
            assert_ne!(first, second);

            let cm = store.get_object(ConfigMap, "openstack", "cinder-api-config-data").unwrap();
            assert!(cm["data"].get("policy.yaml").is_none());
            assert_eq!(json!(""), cm["data"]["custom.conf"]);

            ensure_service_config(&store, &without).await.unwrap();
            assert_eq!(2, store.mutation_count());
        });
    }

    #[test]
    fn parent_config_hashes_require_both_config_maps() {
        let rt = runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = FakeStore::new();
            store.insert(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"namespace": "openstack", "name": "cinder-scripts"},
                "data": {"init.sh": "#!/bin/bash"},
            }));
            assert_eq!(None, parent_config_hashes(&store, "openstack", "cinder").await.unwrap());

            store.insert(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"namespace": "openstack", "name": "cinder-config-data"},
                "data": {"cinder.conf": "[DEFAULT]"},
            }));
            let hashes = parent_config_hashes(&store, "openstack", "cinder").await.unwrap().unwrap();
            let names = hashes.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();
            assert_eq!(vec!["cinder-scripts", "cinder-config-data"], names);
        });
    }
}
