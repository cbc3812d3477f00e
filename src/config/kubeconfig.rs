//! Just enough of the kubeconfig format to build a `ClientConfig` for the current context.
//! This is what the operator uses when it runs outside of a cluster, typically during development.
use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

const MISSING_CREDENTIAL_MESSAGE: &str = "No supported credentials found for the current kubeconfig context. Supported mechanisms are token, username/password, client certificate, and exec";

#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    MissingCredentials,
    NoHomeDir,
    InvalidKubeconfig(String),
    ExecErr(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KubeConfigError::Io(ref e) => write!(f, "IO error: {}", e),
            KubeConfigError::Format(ref e) => write!(f, "Kubeconfig format error: {}", e),
            KubeConfigError::MissingCredentials => f.write_str(MISSING_CREDENTIAL_MESSAGE),
            KubeConfigError::NoHomeDir => {
                f.write_str("Unable to determine HOME directory to load ~/.kube/config")
            }
            KubeConfigError::InvalidKubeconfig(ref msg) => {
                write!(f, "Invalid kubeconfig file: {}", msg)
            }
            KubeConfigError::ExecErr(ref msg) => write!(f, "exec error: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

fn kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        return Ok(PathBuf::from(path));
    }
    let mut home = home_dir().ok_or(KubeConfigError::NoHomeDir)?;
    home.push(".kube");
    home.push("config");
    Ok(home)
}

pub fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let path = kubeconfig_path()?;
    load_kubeconfig(user_agent, path)
}

pub fn load_kubeconfig(
    user_agent: String,
    file_path: impl AsRef<Path>,
) -> Result<ClientConfig, KubeConfigError> {
    let path = file_path.as_ref();
    log::debug!("Loading kubeconfig from '{}'", path.display());
    let kubeconfig: KubeConfig = serde_yaml::from_reader(File::open(path)?)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    kubeconfig.client_config(user_agent, dir)
}

fn credentials(user: &UserInfo) -> Result<Credentials, KubeConfigError> {
    if let Some(token) = user.token.as_ref() {
        return Ok(Credentials::bearer_token(token));
    }
    if let Some(username) = user.username.as_ref() {
        let password = user.password.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig("username is specified without a password".to_owned())
        })?;
        return Ok(Credentials::basic(username, password));
    }
    if let Some(exec) = user.exec.as_ref() {
        return exec_token(exec).map(|token| Credentials::bearer_token(&token));
    }
    if let Some(certificate_path) = user.client_certificate.as_ref() {
        let private_key_path = user.client_key.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate' is specified without 'client-key'".to_owned(),
            )
        })?;
        return Ok(Credentials::PemPath {
            certificate_path: certificate_path.clone(),
            private_key_path: private_key_path.clone(),
        });
    }
    if let Some(certificate) = user.client_certificate_data.as_ref() {
        let private_key = user.client_key_data.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate-data' is specified without 'client-key-data'".to_owned(),
            )
        })?;
        return Ok(Credentials::Pem {
            certificate_base64: certificate.clone(),
            private_key_base64: private_key.clone(),
        });
    }
    Err(KubeConfigError::MissingCredentials)
}

fn exec_token(exec: &Exec) -> Result<String, KubeConfigError> {
    use std::process::Command;

    log::debug!("Running credential plugin: {}", exec.command);
    let mut cmd = Command::new(exec.command.as_str());
    cmd.args(exec.args.iter());
    for var in exec.env.iter() {
        cmd.env(var.name.as_str(), var.value.as_str());
    }

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(KubeConfigError::ExecErr(format!(
            "command '{}' exited with {}",
            exec.command, output.status
        )));
    }
    let credential: ExecCredential = serde_yaml::from_slice(output.stdout.as_slice())
        .map_err(|err| {
            KubeConfigError::ExecErr(format!(
                "invalid output from command '{}': {}",
                exec.command, err
            ))
        })?;
    log::info!(
        "Got token from credential plugin '{}', expires: {:?}",
        exec.command,
        credential.status.expiration_timestamp
    );
    Ok(credential.status.token)
}

#[derive(Deserialize, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<String>,
}

// Partial definitions of the kubeconfig file format. Unknown fields are ignored.

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedCluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    exec: Option<Exec>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecEnv {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Exec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnv>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedUser {
    name: String,
    user: UserInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedContext {
    name: String,
    context: ContextInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
}

fn find_named<'a, T>(
    items: &'a [T],
    name: &str,
    what: &str,
    get_name: impl Fn(&T) -> &str,
) -> Result<&'a T, KubeConfigError> {
    items
        .iter()
        .find(|item| get_name(item) == name)
        .ok_or_else(|| KubeConfigError::InvalidKubeconfig(format!("no {} named '{}'", what, name)))
}

impl KubeConfig {
    /// Relative certificate paths are resolved against `kubeconfig_dir`
    fn client_config(
        &self,
        user_agent: String,
        kubeconfig_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = find_named(&self.contexts, &self.current_context, "context", |c| {
            c.name.as_str()
        })?;
        let cluster = find_named(&self.clusters, &context.context.cluster, "cluster", |c| {
            c.name.as_str()
        })?;
        let user = find_named(&self.users, &context.context.user, "user", |u| u.name.as_str())?;

        let credentials = credentials(&user.user)?;
        let ca_data = match (
            cluster.cluster.certificate_authority_data.as_ref(),
            cluster.cluster.certificate_authority.as_ref(),
        ) {
            (Some(data), _) => Some(CAData::Contents(data.clone())),
            (None, Some(path)) => {
                let resolved = kubeconfig_dir.join(path);
                Some(CAData::File(resolved.to_string_lossy().into_owned()))
            }
            (None, None) => None,
        };

        Ok(ClientConfig {
            api_server_endpoint: cluster.cluster.server.clone(),
            credentials,
            ca_data,
            user_agent,
            verify_ssl_certs: !cluster.cluster.insecure_skip_tls_verify,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://api.dev.example:6443
    certificate-authority: certs/ca.crt
- name: other
  cluster:
    server: https://other.example
    certificate-authority-data: Zm9v
    insecure-skip-tls-verify: true
users:
- name: dev-user
  user:
    token: sha256~abc
- name: cert-user
  user:
    client-certificate: /tmp/client.crt
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
- name: broken
  context:
    cluster: other
    user: cert-user
"#;

    fn parse() -> KubeConfig {
        serde_yaml::from_str(KUBECONFIG).expect("failed to parse kubeconfig")
    }

    #[test]
    fn resolves_current_context_with_relative_ca_file() {
        let conf = parse()
            .client_config("agent".to_owned(), Path::new("/home/me/.kube"))
            .expect("failed to resolve");
        assert_eq!("https://api.dev.example:6443", conf.api_server_endpoint);
        assert_eq!(Credentials::Header("Bearer sha256~abc".to_owned()), conf.credentials);
        assert_eq!(
            Some(CAData::File("/home/me/.kube/certs/ca.crt".to_owned())),
            conf.ca_data
        );
        assert!(conf.verify_ssl_certs);
    }

    #[test]
    fn client_certificate_without_key_is_rejected() {
        let mut kubeconfig = parse();
        kubeconfig.current_context = "broken".to_owned();
        let err = kubeconfig
            .client_config("agent".to_owned(), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, KubeConfigError::InvalidKubeconfig(_)));
    }

    #[test]
    fn missing_context_is_an_error() {
        let mut kubeconfig = parse();
        kubeconfig.current_context = "nope".to_owned();
        let err = kubeconfig
            .client_config("agent".to_owned(), Path::new("."))
            .unwrap_err();
        assert_eq!("Invalid kubeconfig file: no context named 'nope'", err.to_string());
    }
}
