//! Names, ports and paths of the Cinder API service

use std::fmt::{self, Display};

/// Keystone service name, also the prefix of the per-endpoint kubernetes Services
pub const SERVICE_NAME: &str = "cinder";
pub const COMPONENT: &str = "cinder-api";
/// Label group for the owner labels on generated objects
pub const LABEL_GROUP: &str = "cinder.openstack.org";
/// Label on the parent's config maps that names the owning `Cinder` resource
pub const PARENT_NAME_LABEL: &str = "cinder.openstack.org/name";

pub const ADMIN_PORT: i32 = 8776;
pub const PUBLIC_PORT: i32 = 8776;
pub const INTERNAL_PORT: i32 = 8776;

pub const LOG_FILE: &str = "/var/log/cinder/cinder-api.log";
pub const KOLLA_CONFIG_FILE: &str = "cinder-api-config.json";
/// Key under which the aggregate input hash is stored in `status.hash`
pub const INPUT_HASH_NAME: &str = "input";
pub const CUSTOM_CONFIG_KEY: &str = "custom.conf";

/// Requeue delay when a secret or config map that someone else owns isn't there yet
pub const DEPENDENCY_REQUEUE_SECS: u64 = 10;
/// Requeue delay when something we created hasn't settled yet
pub const PENDING_REQUEUE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Admin,
    Public,
    Internal,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Admin, Endpoint::Public, Endpoint::Internal];

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Admin => "admin",
            Endpoint::Public => "public",
            Endpoint::Internal => "internal",
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Endpoint::Admin => ADMIN_PORT,
            Endpoint::Public => PUBLIC_PORT,
            Endpoint::Internal => INTERNAL_PORT,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned API of the service, registered in keystone as its own service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facade {
    pub service_type: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub path: &'static str,
}

pub const FACADES: [Facade; 2] = [
    Facade {
        service_type: "volumev2",
        name: "cinderv2",
        description: "Cinder V2 Service",
        path: "/v2/%(project_id)s",
    },
    Facade {
        service_type: "volumev3",
        name: "cinderv3",
        description: "Cinder V3 Service",
        path: "/v3/%(project_id)s",
    },
];

pub fn config_data_name(name: &str) -> String {
    format!("{}-config-data", name)
}

pub fn scripts_name(name: &str) -> String {
    format!("{}-scripts", name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn facades_are_ordered_v2_then_v3() {
        let names = FACADES.iter().map(|f| f.name).collect::<Vec<_>>();
        assert_eq!(vec!["cinderv2", "cinderv3"], names);
        assert!(FACADES.iter().all(|f| f.path.ends_with("%(project_id)s")));
    }
}
