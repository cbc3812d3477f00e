//! Exposes the API. Every endpoint scope gets its own Service, the public one additionally a
//! Route. The resulting URLs are what gets registered in keystone.
use crate::api::CinderApi;
use crate::cinder::{Endpoint, Facade, PENDING_REQUEUE_SECS, SERVICE_NAME};
use crate::client::Error;
use crate::k8s_types::core::v1::Service;
use crate::k8s_types::route_openshift_io::v1::Route;
use crate::labels::{service_labels, with_label};
use crate::objects::{create_or_patch, owner_reference, Readiness};
use crate::resource::{str_value, ObjectIdRef};
use crate::store::ObjectStore;

use serde_json::{json, Value};

use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the Service (and Route) of an endpoint scope
pub fn service_name(endpoint: Endpoint) -> String {
    format!("{}-{}", SERVICE_NAME, endpoint)
}

fn scheme(instance: &CinderApi, endpoint: Endpoint) -> &'static str {
    if instance.spec.tls.endpoint_enabled(endpoint) {
        "https"
    } else {
        "http"
    }
}

fn desired_service(instance: &CinderApi, endpoint: Endpoint) -> Value {
    let name = service_name(endpoint);
    json!({
        "apiVersion": Service.api_version,
        "kind": Service.kind,
        "metadata": {
            "namespace": instance.namespace(),
            "name": name,
            "labels": with_label(service_labels(), endpoint.as_str(), "true"),
            "ownerReferences": [owner_reference(instance)],
        },
        "spec": {
            "selector": service_labels(),
            "ports": [{
                "name": name,
                "port": endpoint.port(),
                "protocol": "TCP",
            }],
        },
    })
}

fn desired_route(instance: &CinderApi, endpoint: Endpoint) -> Value {
    let name = service_name(endpoint);
    let mut route = json!({
        "apiVersion": Route.api_version,
        "kind": Route.kind,
        "metadata": {
            "namespace": instance.namespace(),
            "name": name,
            "labels": with_label(service_labels(), endpoint.as_str(), "true"),
            "ownerReferences": [owner_reference(instance)],
        },
        "spec": {
            "to": {"kind": Service.kind, "name": name},
            "port": {"targetPort": name},
        },
    });
    // null removes the tls section again once TLS is switched off
    route["spec"]["tls"] = if instance.spec.tls.endpoint_enabled(endpoint) {
        json!({"termination": "passthrough"})
    } else {
        Value::Null
    };
    route
}

/// Base URL of one endpoint scope, without the path of a facade
async fn expose_scope<S: ObjectStore + ?Sized>(
    store: &S,
    instance: &CinderApi,
    endpoint: Endpoint,
) -> Result<Readiness<String>, Error> {
    let name = service_name(endpoint);
    let id = ObjectIdRef::new(instance.namespace(), name.as_str());
    create_or_patch(store, Service, &id, &desired_service(instance, endpoint)).await?;

    if endpoint != Endpoint::Public {
        return Ok(Readiness::Ready(format!(
            "{}://{}.{}.svc:{}",
            scheme(instance, endpoint),
            name,
            instance.namespace(),
            endpoint.port()
        )));
    }

    let route = create_or_patch(store, Route, &id, &desired_route(instance, endpoint)).await?;
    match str_value(&route, "/status/ingress/0/host").filter(|h| !h.is_empty()) {
        Some(host) => Ok(Readiness::Ready(format!(
            "{}://{}",
            scheme(instance, endpoint),
            host
        ))),
        None => {
            log::debug!("Route {} has not been admitted yet", id);
            Ok(Readiness::Pending(Duration::from_secs(PENDING_REQUEUE_SECS)))
        }
    }
}

/// Exposes all endpoint scopes and returns the URL of each scope for the given facade
pub async fn expose<S: ObjectStore + ?Sized>(
    store: &S,
    instance: &CinderApi,
    facade: &Facade,
) -> Result<Readiness<BTreeMap<String, String>>, Error> {
    let mut urls = BTreeMap::new();
    for endpoint in Endpoint::ALL.iter().copied() {
        match expose_scope(store, instance, endpoint).await? {
            Readiness::Ready(base) => {
                urls.insert(endpoint.as_str().to_owned(), format!("{}{}", base, facade.path));
            }
            Readiness::Pending(delay) => return Ok(Readiness::Pending(delay)),
        }
    }
    Ok(Readiness::Ready(urls))
}
