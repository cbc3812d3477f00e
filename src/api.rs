//! The `CinderAPI` custom resource (`cinder.openstack.org/v1beta1`)
pub mod tls;

use crate::k8s_types::cinder_openstack_org::v1beta1::Cinder;
use crate::resource::ObjectIdRef;

use k8s_openapi::api::core::v1::{ResourceRequirements, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use std::collections::BTreeMap;

pub use self::tls::{ServiceTls, Tls, TlsError, TlsService};

/// Extra mounts tagged with this propagation type are added to the API pods
pub const API_PROPAGATION: &str = "CinderAPI";
/// Extra mounts tagged with this propagation type are added to every Cinder service
pub const ALL_SERVICES_PROPAGATION: &str = "Cinder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CinderApi {
    pub metadata: ObjectMeta,
    pub spec: CinderApiSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CinderApiStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CinderApiSpec {
    #[serde(default)]
    pub container_image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub debug: DebugSettings,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub extra_mounts: Vec<ExtraVolMounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account: String,
    /// Secret holding the service password
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_service_user")]
    pub service_user: String,
    #[serde(default)]
    pub password_selectors: PasswordSelector,
    #[serde(default)]
    pub custom_service_config: String,
    #[serde(default)]
    pub default_config_overwrite: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_service_user() -> String {
    "cinder".to_owned()
}

fn default_service_password_selector() -> String {
    "CinderPassword".to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugSettings {
    /// Keep the container running without starting the service
    #[serde(default)]
    pub service: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordSelector {
    #[serde(default = "default_service_password_selector")]
    pub service: String,
}

impl Default for PasswordSelector {
    fn default() -> Self {
        PasswordSelector {
            service: default_service_password_selector(),
        }
    }
}

/// A group of extra volumes and mounts, propagated to the services named in `propagation`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraVolMounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub ext_vol: Vec<VolMounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolMounts {
    /// An empty list propagates to every service
    #[serde(default)]
    pub propagation: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_vol_type: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
}

impl VolMounts {
    pub fn propagates_to(&self, services: &[&str]) -> bool {
        self.propagation.is_empty()
            || self
                .propagation
                .iter()
                .any(|p| services.contains(&p.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CinderApiStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// content hashes by name
    #[serde(default)]
    pub hash: BTreeMap<String, String>,
    /// facade name -> endpoint scope -> url
    #[serde(default, rename = "apiEndpoint")]
    pub api_endpoints: BTreeMap<String, BTreeMap<String, String>>,
    /// facade name -> keystone service id
    #[serde(default, rename = "serviceIDs")]
    pub service_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub ready_count: i32,
}

impl CinderApi {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    pub fn resource_version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or("")
    }

    pub fn id(&self) -> ObjectIdRef<'_> {
        ObjectIdRef::new(self.namespace(), self.name())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or(&[])
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Name of the `Cinder` resource that owns this one, which is also the prefix of the
    /// config maps that the parent produces. Empty if there is no such owner.
    pub fn parent_name(&self) -> &str {
        self.metadata
            .owner_references
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .find(|owner| Cinder.matches(&owner.api_version, &owner.kind))
            .map(|owner| owner.name.as_str())
            .unwrap_or("")
    }

    /// Creates the status if it was never written. Maps that were missing from a persisted
    /// status are already empty after deserialization.
    pub fn initialize_status(&mut self) -> &mut CinderApiStatus {
        self.status.get_or_insert_with(CinderApiStatus::default)
    }

    /// Extra volumes and mounts that propagate to the API pods, in declaration order
    pub fn api_extra_mounts(&self) -> impl Iterator<Item = &VolMounts> {
        let services = [API_PROPAGATION, ALL_SERVICES_PROPAGATION];
        self.spec
            .extra_mounts
            .iter()
            .flat_map(|extra| extra.ext_vol.iter())
            .filter(move |vm| vm.propagates_to(&services))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn from_json(value: serde_json::Value) -> CinderApi {
        serde_json::from_value(value).expect("failed to deserialize CinderAPI")
    }

    #[test]
    fn minimal_resource_gets_defaults() {
        let api = from_json(json!({
            "apiVersion": "cinder.openstack.org/v1beta1",
            "kind": "CinderAPI",
            "metadata": {"name": "cinder-api", "namespace": "openstack"},
            "spec": {"secret": "osp-secret"}
        }));
        assert_eq!(1, api.spec.replicas);
        assert_eq!("cinder", api.spec.service_user);
        assert_eq!("CinderPassword", api.spec.password_selectors.service);
        assert!(!api.spec.debug.service);
        assert!(api.status.is_none());
        assert_eq!("", api.parent_name());
    }

    #[test]
    fn status_maps_missing_from_json_are_empty() {
        let mut api = from_json(json!({
            "metadata": {"name": "cinder-api"},
            "spec": {},
            "status": {"readyCount": 2}
        }));
        let status = api.initialize_status();
        assert_eq!(2, status.ready_count);
        assert!(status.hash.is_empty());
        assert!(status.api_endpoints.is_empty());
        assert!(status.service_ids.is_empty());
    }

    #[test]
    fn initialize_status_never_replaces_existing_status() {
        let mut api = from_json(json!({
            "metadata": {"name": "cinder-api"},
            "spec": {},
            "status": {"hash": {"input": "abc"}}
        }));
        api.initialize_status();
        assert_eq!(Some("abc"), api.initialize_status().hash.get("input").map(String::as_str));
    }

    #[test]
    fn parent_name_comes_from_the_cinder_owner() {
        let api = from_json(json!({
            "metadata": {
                "name": "cinder-api",
                "ownerReferences": [
                    {"apiVersion": "v1", "kind": "ConfigMap", "name": "unrelated", "uid": "1"},
                    {"apiVersion": "cinder.openstack.org/v1beta1", "kind": "Cinder", "name": "cinder", "uid": "2"}
                ]
            },
            "spec": {}
        }));
        assert_eq!("cinder", api.parent_name());
    }

    #[test]
    fn cinder_owner_from_another_group_is_not_the_parent() {
        let api = from_json(json!({
            "metadata": {
                "name": "cinder-api",
                "ownerReferences": [
                    {"apiVersion": "other.example.com/v1", "kind": "Cinder", "name": "imposter", "uid": "1"}
                ]
            },
            "spec": {}
        }));
        assert_eq!("", api.parent_name());
    }

    #[test]
    fn extra_mounts_are_filtered_by_propagation() {
        let api = from_json(json!({
            "metadata": {"name": "cinder-api"},
            "spec": {
                "extraMounts": [{
                    "extVol": [
                        {"propagation": ["CinderVolume"], "volumes": [{"name": "volume-only"}]},
                        {"propagation": ["CinderAPI"], "volumes": [{"name": "api"}]},
                        {"propagation": [], "volumes": [{"name": "everyone"}]},
                        {"propagation": ["Cinder"], "volumes": [{"name": "all-cinder"}]}
                    ]
                }]
            }
        }));
        let names = api
            .api_extra_mounts()
            .flat_map(|vm| vm.volumes.iter().map(|v| v.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(vec!["api", "everyone", "all-cinder"], names);
    }
}
