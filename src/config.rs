pub mod kubeconfig;

use crate::error::Error;

use std::path::Path;

pub use self::kubeconfig::KubeConfigError;

pub const DEFAULT_FINALIZER: &str = "openstack.org/cinderapi";
pub const DEFAULT_SERVER_PORT: u16 = 8080;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Runtime settings for the operator process. The defaults are suitable for running
/// inside a cluster; the binary overrides a few of them from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Used as the http user agent and in log messages
    pub operator_name: String,
    /// Restricts all watches to a single namespace. `None` watches every namespace.
    pub namespace: Option<String>,
    /// Finalizer added to every `CinderAPI` so that identity registrations are removed before
    /// the resource disappears
    pub finalizer: String,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> OperatorConfig {
        OperatorConfig {
            operator_name: operator_name.into(),
            namespace: None,
            finalizer: DEFAULT_FINALIZER.to_owned(),
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = finalizer.into();
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = expose;
        self
    }

    pub fn expose_health(mut self, expose: bool) -> Self {
        self.expose_health = expose;
        self
    }
}

/// How the client authenticates to the api server
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// Sent verbatim as the `Authorization` header
    Header(String),
    /// Client certificate and key, both base64 encoded PEM
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    /// Paths to PEM encoded client certificate and key files
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }
}

/// Certificate authority used to verify the api server
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// base64 encoded PEM, as found inline in a kubeconfig
    Contents(String),
    /// path to a PEM file
    File(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration that Kubernetes mounts into every pod that runs with a service account
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::bearer_token(&token),
            ca_data,
            user_agent: user_agent.into(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the current context from `$KUBECONFIG`, or from `~/.kube/config` when that isn't set
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, Error> {
        let conf = kubeconfig::load_from_kubeconfig(user_agent.into())?;
        Ok(conf)
    }

    /// Tries the service account first, then falls back to the kubeconfig
    pub fn load(user_agent: &str) -> Result<ClientConfig, Error> {
        ClientConfig::from_service_account(user_agent).or_else(|err| {
            log::debug!(
                "Unable to use service account credentials ({}), trying kubeconfig instead",
                err
            );
            ClientConfig::from_kubeconfig(user_agent)
        })
    }
}
