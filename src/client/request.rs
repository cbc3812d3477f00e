use crate::client::Error;
use crate::config::{ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectIdRef};

use http::{header, Method, Request};
use hyper::Body;
use serde_json::{json, Value};
use url::Url;

const JSON: &str = "application/json";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// A JSON merge patch (RFC 7386). Object fields are merged recursively, `null` removes a
/// field, and arrays are replaced as a whole.
#[derive(Debug, PartialEq, Clone)]
pub struct Patch {
    value: Value,
}

impl Patch {
    pub fn merge(value: Value) -> Patch {
        Patch { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Sets the complete list of finalizers. The resourceVersion is included so the api server
    /// rejects the patch with a conflict if the object changed since it was read.
    pub fn finalizers(resource_version: &str, finalizers: &[String]) -> Patch {
        Patch::merge(json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        }))
    }

    pub fn remove_finalizer(resource: &K8sResource, finalizer: &str) -> Patch {
        let remaining = resource
            .as_ref()
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|all| {
                all.iter()
                    .filter_map(Value::as_str)
                    .filter(|f| *f != finalizer)
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Patch::finalizers(resource.resource_version(), &remaining)
    }
}

pub fn get_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()), None)?;
    make_req(url, Method::GET, config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn list_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(config, k8s_type, namespace, None, None)?;
    if let Some(selector) = label_selector {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    make_req(url, Method::GET, config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn watch_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    resource_version: Option<&str>,
    timeout_seconds: Option<u32>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(config, k8s_type, namespace, None, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        query.append_pair("allowWatchBookmarks", "false");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(timeout) = timeout_seconds {
            query.append_pair("timeoutSeconds", &timeout.to_string());
        }
    }
    make_req(url, Method::GET, config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn create_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let namespace = resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str);
    let url = make_url(config, k8s_type, namespace, None, None)?;
    let body = serde_json::to_vec(resource)?;
    make_req(url, Method::POST, config)
        .header(header::CONTENT_TYPE, JSON)
        .body(Body::from(body))
        .map_err(Into::into)
}

pub fn patch_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    subresource: Option<&str>,
    patch: &Patch,
) -> Result<Request<Body>, Error> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()), subresource)?;
    let body = serde_json::to_vec(&patch.value)?;
    make_req(url, Method::PATCH, config)
        .header(header::CONTENT_TYPE, MERGE_PATCH)
        .body(Body::from(body))
        .map_err(Into::into)
}

pub fn delete_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()), None)?;
    // owned objects are removed in the background by the garbage collector
    let body = serde_json::to_vec(&json!({
        "apiVersion": "v1",
        "kind": "DeleteOptions",
        "propagationPolicy": "Background",
    }))?;
    make_req(url, Method::DELETE, config)
        .header(header::CONTENT_TYPE, JSON)
        .body(Body::from(body))
        .map_err(Into::into)
}

fn make_req(url: Url, method: Method, config: &ClientConfig) -> http::request::Builder {
    let builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::ACCEPT, JSON)
        .header(header::USER_AGENT, config.user_agent.as_str());
    match config.credentials {
        Credentials::Header(ref value) => builder.header(header::AUTHORIZATION, value.as_str()),
        _ => builder,
    }
}

fn make_url(
    config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
    subresource: Option<&str>,
) -> Result<Url, Error> {
    let mut url = Url::parse(config.api_server_endpoint.as_str())
        .map_err(|e| Error::InvalidUrl(format!("{}: {}", config.api_server_endpoint, e)))?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::InvalidUrl(format!(
                "api server endpoint cannot be a base: {}",
                config.api_server_endpoint
            ))
        })?;
        segments.pop_if_empty();

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);
        if let Some(n) = name {
            segments.push(n);
        }
        if let Some(sub) = subresource {
            segments.push(sub);
        }
    }
    Ok(url)
}
