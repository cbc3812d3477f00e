use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// Just enough information about a Kubernetes resource type to build api server urls and
/// to recognize objects of that type. All of the fields are `&'static str` so that types can
/// be declared as statics and passed around by reference:
///
/// ```no_run
/// use cinder_api_operator::k8s_types::K8sType;
///
/// #[allow(non_upper_case_globals)]
/// pub static Widget: &K8sType = &K8sType {
///     api_version: "example.com/v1",
///     kind: "Widget",
///     plural_kind: "widgets",
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }

    /// true if the given `apiVersion` and `kind` (as found in an object or owner reference)
    /// refer to this type
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_version == api_version && self.kind == kind
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

pub mod core {
    pub mod v1 {
        k8s_type!(ConfigMap, "v1", "ConfigMap", "configmaps");
        k8s_type!(Secret, "v1", "Secret", "secrets");
        k8s_type!(Service, "v1", "Service", "services");
    }
}

pub mod apps {
    pub mod v1 {
        k8s_type!(StatefulSet, "apps/v1", "StatefulSet", "statefulsets");
    }
}

pub mod route_openshift_io {
    pub mod v1 {
        k8s_type!(Route, "route.openshift.io/v1", "Route", "routes");
    }
}

pub mod keystone_openstack_org {
    pub mod v1beta1 {
        k8s_type!(
            KeystoneService,
            "keystone.openstack.org/v1beta1",
            "KeystoneService",
            "keystoneservices"
        );
    }
}

pub mod cinder_openstack_org {
    pub mod v1beta1 {
        k8s_type!(Cinder, "cinder.openstack.org/v1beta1", "Cinder", "cinders");
        k8s_type!(CinderAPI, "cinder.openstack.org/v1beta1", "CinderAPI", "cinderapis");
    }
}
