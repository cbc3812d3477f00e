mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::metrics::ClientMetrics;

use bytes::{Buf, BytesMut};
use http::{Request, Response, StatusCode};
use hyper::body::HttpBody;
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

pub use self::request::Patch;

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(StatusCode),
    Request(http::Error),
    InvalidUrl(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serde(e) => Some(e),
            Error::Request(e) => Some(e),
            Error::Http(_) | Error::InvalidUrl(_) => None,
        }
    }
}

impl Error {
    pub fn http(status: StatusCode) -> Error {
        Error::Http(status)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status) => status.as_u16() == code,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_status(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.is_http_status(409)
    }

    /// The resourceVersion used for a watch is too old
    pub fn is_gone(&self) -> bool {
        self.is_http_status(410)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(ref e) => write!(f, "Http Error: {}", e),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::InvalidUrl(ref e) => write!(f, "Invalid url: {}", e),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// Http client for the Kubernetes api server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

fn invalid_base64(what: &str, err: base64::DecodeError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Invalid base64 content of {}: {}", what, err),
    )
}

fn set_client_certificate(
    ssl: &mut SslConnectorBuilder,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(), io::Error> {
    let cert = X509::from_pem(cert_pem)?;
    let pkey = PKey::private_key_from_pem(key_pem)?;
    ssl.set_certificate(&cert)?;
    ssl.set_private_key(&pkey)?;
    // fails if the key doesn't belong to the certificate
    ssl.check_private_key()?;
    Ok(())
}

impl Client {
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;

        match config.ca_data.as_ref() {
            Some(CAData::Contents(certs)) => {
                let decoded = base64::decode(certs)
                    .map_err(|e| invalid_base64("certificate-authority-data", e))?;
                for cert in X509::stack_from_pem(decoded.as_slice())? {
                    ssl.cert_store_mut().add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => {
                ssl.set_ca_file(path.as_str())?;
            }
            None => {}
        }

        match config.credentials {
            Credentials::PemPath {
                ref certificate_path,
                ref private_key_path,
            } => {
                let cert = std::fs::read(certificate_path)?;
                let key = std::fs::read(private_key_path)?;
                set_client_certificate(&mut ssl, &cert, &key)?;
            }
            Credentials::Pem {
                ref certificate_base64,
                ref private_key_base64,
            } => {
                let cert = base64::decode(certificate_base64)
                    .map_err(|e| invalid_base64("client-certificate-data", e))?;
                let key = base64::decode(private_key_base64)
                    .map_err(|e| invalid_base64("client-key-data", e))?;
                set_client_certificate(&mut ssl, &cert, &key)?;
            }
            Credentials::Header(_) => {}
        }

        if config.verify_ssl_certs {
            ssl.set_verify(SslVerifyMode::PEER);
        } else {
            log::warn!("TLS certificate verification is disabled, connections to the api server are insecure");
            ssl.set_verify(SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let http_client = HyperClient::builder().build(https);
        Ok(Client(Arc::new(ClientInner {
            http_client,
            config,
            metrics,
        })))
    }

    /// Returns `None` if the object does not exist
    pub async fn get(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        match self.get_response_body::<Value>(req).await {
            Ok(body) => Ok(Some(body)),
            Err(ref e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, namespace, label_selector)?;
        self.get_response_body(req).await
    }

    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<WatchEvent>, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            namespace,
            resource_version,
            Some(300),
        )?;
        let response = self.get_response(req).await?;
        if response.status().is_success() {
            Ok(WatchStream::new(response.into_body()))
        } else {
            Err(Error::http(response.status()))
        }
    }

    pub async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<Value, Error> {
        let req = request::create_request(&self.0.config, k8s_type, resource)?;
        self.get_response_body(req).await
    }

    pub async fn patch(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        let req = request::patch_request(&self.0.config, k8s_type, id, None, patch)?;
        self.get_response_body(req).await
    }

    pub async fn patch_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<Value, Error> {
        let req = request::patch_request(&self.0.config, k8s_type, id, Some("status"), patch)?;
        self.get_response_body(req).await
    }

    /// A 409 means the object is already being deleted, which counts as success. A 404 is
    /// returned as an error so that callers can decide what it means to them.
    pub async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error> {
        log::info!("Deleting {} '{}'", k8s_type, id);
        let req = request::delete_request(&self.0.config, k8s_type, id)?;
        let response = self.get_response(req).await?;
        match response.status().as_u16() {
            200..=299 | 409 => Ok(()),
            _ => Err(Client::error_from_response(response).await),
        }
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        log::debug!("Starting {} request to: {}", method, uri);

        let start_time = Instant::now();
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();
        let duration = start_time.elapsed().as_millis();
        match result {
            Ok(resp) => {
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    resp.status().as_u16(),
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!("Failed to execute {} request to: {}, err: {}", method, uri, err);
                Err(err.into())
            }
        }
    }

    async fn get_response_body<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let response = self.get_response(req).await?;
        if !response.status().is_success() {
            return Err(Client::error_from_response(response).await);
        }

        if log::log_enabled!(log::Level::Trace) {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
            Ok(serde_json::from_slice(body.as_ref())?)
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            Ok(serde_json::from_reader(body.reader())?)
        }
    }

    /// Logs the body of an unsuccessful response and turns its status into an error
    async fn error_from_response(response: Response<Body>) -> Error {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Error::http(status);
        }
        match hyper::body::to_bytes(response.into_body()).await {
            Ok(body) => log::error!(
                "Response status: {}, body: {}",
                status,
                String::from_utf8_lossy(body.as_ref())
            ),
            Err(err) => log::error!("Response status: {}, failed to read body: {}", status, err),
        }
        Error::http(status)
    }
}

/// Reads newline delimited json documents from a streaming response body, as returned by
/// watch requests. Documents may span any number of chunks.
pub struct WatchStream<T> {
    body: Body,
    buffer: BytesMut,
    _phantom: PhantomData<T>,
}

impl<T: DeserializeOwned> WatchStream<T> {
    pub fn new(body: Body) -> WatchStream<T> {
        WatchStream {
            body,
            buffer: BytesMut::new(),
            _phantom: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        loop {
            if let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(newline + 1);
                if let Some(doc) = parse_line(&line) {
                    return Some(doc);
                }
                continue;
            }

            match self.body.data().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    log::error!("Error reading watch response: {}", err);
                    return Some(Err(err.into()));
                }
                None => {
                    let rest = self.buffer.split();
                    return parse_line(&rest);
                }
            }
        }
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<Result<T, Error>> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some(serde_json::from_slice(&line[start..=end]).map_err(Into::into))
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
    Error(ApiError),
}

#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}
