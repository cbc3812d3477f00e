use crate::cinder::Endpoint;

use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};
use lazy_static::lazy_static;
use regex::Regex;

use std::fmt::{self, Display};

pub const CA_BUNDLE_VOLUME: &str = "combined-ca-bundle";
pub const CA_BUNDLE_KEY: &str = "tls-ca-bundle.pem";
pub const CA_BUNDLE_MOUNT_PATH: &str = "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem";
const CERT_DIR: &str = "/var/lib/config-data/tls/certs";
const KEY_DIR: &str = "/var/lib/config-data/tls/private";

lazy_static! {
    static ref DNS_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

/// TLS settings of a single endpoint. TLS is enabled when a secret is named.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl TlsService {
    pub fn enabled(&self) -> bool {
        self.secret_name.as_deref().map_or(false, |s| !s.is_empty())
    }

    /// Validates the configuration and turns it into something that can be mounted into a pod
    pub fn to_service(&self, endpoint: Endpoint) -> Result<ServiceTls, TlsError> {
        let secret_name = self.secret_name.clone().unwrap_or_default();
        if secret_name.len() > 253 || !DNS_SUBDOMAIN.is_match(&secret_name) {
            return Err(TlsError::InvalidSecretName {
                endpoint,
                secret_name,
            });
        }
        Ok(ServiceTls {
            endpoint,
            secret_name,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiTls {
    #[serde(default)]
    pub public: TlsService,
    #[serde(default)]
    pub internal: TlsService,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub api: ApiTls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_name: Option<String>,
}

impl Tls {
    pub fn for_endpoint(&self, endpoint: Endpoint) -> Option<&TlsService> {
        match endpoint {
            Endpoint::Public => Some(&self.api.public),
            Endpoint::Internal => Some(&self.api.internal),
            Endpoint::Admin => None,
        }
    }

    pub fn endpoint_enabled(&self, endpoint: Endpoint) -> bool {
        self.for_endpoint(endpoint).map_or(false, TlsService::enabled)
    }

    pub fn ca_bundle_secret(&self) -> Option<&str> {
        self.ca_bundle_secret_name.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TlsError {
    InvalidSecretName {
        endpoint: Endpoint,
        secret_name: String,
    },
}

impl Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::InvalidSecretName {
                endpoint,
                secret_name,
            } => write!(
                f,
                "invalid TLS secret name '{}' for {} endpoint",
                secret_name, endpoint
            ),
        }
    }
}

impl std::error::Error for TlsError {}

/// A validated TLS endpoint whose certificate and key come from a `kubernetes.io/tls` secret
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTls {
    pub endpoint: Endpoint,
    pub secret_name: String,
}

impl ServiceTls {
    pub fn volume_name(&self) -> String {
        format!("{}-tls-certs", self.endpoint)
    }

    pub fn volume(&self) -> Volume {
        Volume {
            name: self.volume_name(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.secret_name.clone()),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn volume_mounts(&self) -> Vec<VolumeMount> {
        vec![
            VolumeMount {
                name: self.volume_name(),
                mount_path: format!("{}/{}.crt", CERT_DIR, self.endpoint),
                sub_path: Some("tls.crt".to_owned()),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: self.volume_name(),
                mount_path: format!("{}/{}.key", KEY_DIR, self.endpoint),
                sub_path: Some("tls.key".to_owned()),
                read_only: Some(true),
                ..Default::default()
            },
        ]
    }
}

pub fn ca_bundle_volume(secret_name: &str) -> Volume {
    Volume {
        name: CA_BUNDLE_VOLUME.to_owned(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_owned()),
            default_mode: Some(0o444),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ca_bundle_mount() -> VolumeMount {
    VolumeMount {
        name: CA_BUNDLE_VOLUME.to_owned(),
        mount_path: CA_BUNDLE_MOUNT_PATH.to_owned(),
        sub_path: Some(CA_BUNDLE_KEY.to_owned()),
        read_only: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tls(secret: Option<&str>) -> TlsService {
        TlsService {
            secret_name: secret.map(String::from),
        }
    }

    #[test]
    fn tls_is_enabled_only_with_a_non_empty_secret_name() {
        assert!(!tls(None).enabled());
        assert!(!tls(Some("")).enabled());
        assert!(tls(Some("cert-cinder-public-svc")).enabled());
    }

    #[test]
    fn invalid_secret_names_cannot_be_rendered() {
        let err = tls(Some("Not_A_Dns_Name")).to_service(Endpoint::Public).unwrap_err();
        assert_eq!(
            "invalid TLS secret name 'Not_A_Dns_Name' for public endpoint",
            err.to_string()
        );
    }

    #[test]
    fn service_tls_mounts_cert_and_key_under_endpoint_name() {
        let svc = tls(Some("cert-internal")).to_service(Endpoint::Internal).unwrap();
        let mounts = svc.volume_mounts();
        assert_eq!("internal-tls-certs", svc.volume().name);
        assert_eq!("/var/lib/config-data/tls/certs/internal.crt", mounts[0].mount_path);
        assert_eq!("/var/lib/config-data/tls/private/internal.key", mounts[1].mount_path);
    }

    #[test]
    fn admin_endpoint_has_no_tls_settings() {
        let mut settings = Tls::default();
        settings.api.public = tls(Some("cert-public"));
        assert!(settings.endpoint_enabled(Endpoint::Public));
        assert!(!settings.endpoint_enabled(Endpoint::Internal));
        assert!(!settings.endpoint_enabled(Endpoint::Admin));
    }
}
