use crate::api::CinderApi;
use crate::cinder::{COMPONENT, SERVICE_NAME};

use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

/// Labels that identify which `CinderAPI` generated an object, under the given label group
pub fn owner_labels(instance: &CinderApi, group: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(format!("{}/uid", group), instance.uid().to_owned());
    labels.insert(format!("{}/namespace", group), instance.namespace().to_owned());
    labels.insert(format!("{}/name", group), instance.name().to_owned());
    labels
}

/// Labels shared by the kubernetes Services and the API pods. The Services select on these.
pub fn service_labels() -> Labels {
    let mut labels = Labels::new();
    labels.insert("service".to_owned(), SERVICE_NAME.to_owned());
    labels.insert("component".to_owned(), COMPONENT.to_owned());
    labels
}

pub fn with_label(mut labels: Labels, key: &str, value: &str) -> Labels {
    labels.insert(key.to_owned(), value.to_owned());
    labels
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn owner_labels_use_the_group_prefix() {
        let instance: CinderApi = serde_json::from_value(json!({
            "metadata": {"name": "cinder-api", "namespace": "openstack", "uid": "u-1"},
            "spec": {}
        }))
        .unwrap();
        let labels = owner_labels(&instance, "cinder.openstack.org");
        assert_eq!(Some("u-1"), labels.get("cinder.openstack.org/uid").map(String::as_str));
        assert_eq!(Some("openstack"), labels.get("cinder.openstack.org/namespace").map(String::as_str));
        assert_eq!(Some("cinder-api"), labels.get("cinder.openstack.org/name").map(String::as_str));
    }
}
