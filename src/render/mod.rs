//! Renders the StatefulSet that runs the API pods. Rendering is a pure function of its inputs,
//! so the output can be compared against what's in the cluster to detect drift.
mod volumes;

use crate::api::{tls, CinderApi, TlsError};
use crate::cinder::{Endpoint, COMPONENT, LOG_FILE, PUBLIC_PORT};
use crate::labels::Labels;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, ExecAction, HTTPGetAction, PodAffinityTerm, PodAntiAffinity,
    PodSpec, PodTemplateSpec, Probe, SecurityContext, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub use self::volumes::{volume_mounts, volumes};

pub const SERVICE_COMMAND: &str = "/usr/local/bin/kolla_set_configs && /usr/local/bin/kolla_start";
pub const DEBUG_COMMAND: &str = "/usr/local/bin/kolla_set_configs && /bin/sleep infinity";
const HEALTHCHECK_PATH: &str = "/healthcheck";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

struct ProbeTiming {
    timeout: i32,
    period: i32,
    initial_delay: i32,
}

const LIVENESS: ProbeTiming = ProbeTiming {
    timeout: 5,
    period: 3,
    initial_delay: 5,
};

const READINESS: ProbeTiming = ProbeTiming {
    timeout: 5,
    period: 5,
    initial_delay: 5,
};

fn probe(instance: &CinderApi, timing: &ProbeTiming) -> Probe {
    let mut probe = Probe {
        timeout_seconds: Some(timing.timeout),
        period_seconds: Some(timing.period),
        initial_delay_seconds: Some(timing.initial_delay),
        ..Default::default()
    };
    if instance.spec.debug.service {
        probe.exec = Some(ExecAction {
            command: Some(vec!["/bin/true".to_owned()]),
        });
    } else {
        // spelled out, so that switching TLS off shows up as a change
        let scheme = if instance.spec.tls.endpoint_enabled(Endpoint::Public) {
            "HTTPS"
        } else {
            "HTTP"
        };
        probe.http_get = Some(HTTPGetAction {
            path: Some(HEALTHCHECK_PATH.to_owned()),
            port: IntOrString::Int(PUBLIC_PORT),
            scheme: Some(scheme.to_owned()),
            ..Default::default()
        });
    }
    probe
}

fn env_vars(config_hash: &str) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "KOLLA_CONFIG_STRATEGY".to_owned(),
            value: Some("COPY_ALWAYS".to_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "CONFIG_HASH".to_owned(),
            value: Some(config_hash.to_owned()),
            ..Default::default()
        },
    ];
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

/// Prefers scheduling the API pods on different nodes
fn distribute_pods(key: &str, values: &[&str], topology_key: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 1,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_expressions: Some(vec![LabelSelectorRequirement {
                                key: key.to_owned(),
                                operator: "In".to_owned(),
                                values: Some(values.iter().map(|v| (*v).to_owned()).collect()),
                            }]),
                            ..Default::default()
                        }),
                        topology_key: topology_key.to_owned(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Renders the API StatefulSet. Fails only if an enabled TLS endpoint names a secret that
/// can't be mounted.
pub fn stateful_set(
    instance: &CinderApi,
    config_hash: &str,
    labels: &Labels,
    annotations: &Labels,
) -> Result<StatefulSet, TlsError> {
    let spec = &instance.spec;
    let mut pod_volumes = volumes(instance);
    let mut mounts = volume_mounts(instance);

    if let Some(ca_secret) = spec.tls.ca_bundle_secret() {
        pod_volumes.push(tls::ca_bundle_volume(ca_secret));
        mounts.push(tls::ca_bundle_mount());
    }
    for endpoint in [Endpoint::Internal, Endpoint::Public].iter().copied() {
        if let Some(settings) = spec.tls.for_endpoint(endpoint).filter(|t| t.enabled()) {
            let service = settings.to_service(endpoint)?;
            pod_volumes.push(service.volume());
            mounts.extend(service.volume_mounts());
        }
    }

    let command = if spec.debug.service {
        DEBUG_COMMAND
    } else {
        SERVICE_COMMAND
    };
    let security_context = SecurityContext {
        run_as_user: Some(0),
        ..Default::default()
    };

    let log_container = Container {
        name: format!("{}-log", instance.name()),
        image: Some(spec.container_image.clone()),
        command: Some(vec!["/usr/bin/dumb-init".to_owned()]),
        args: Some(
            ["--single-child", "--", "/usr/bin/tail", "-n+1", "-F", LOG_FILE]
                .iter()
                .map(|a| (*a).to_owned())
                .collect(),
        ),
        security_context: Some(security_context.clone()),
        env: Some(env_vars(config_hash)),
        resources: spec.resources.clone(),
        volume_mounts: Some(vec![volumes::logs_mount()]),
        ..Default::default()
    };
    let api_container = Container {
        name: COMPONENT.to_owned(),
        image: Some(spec.container_image.clone()),
        command: Some(vec!["/bin/bash".to_owned()]),
        args: Some(vec!["-c".to_owned(), command.to_owned()]),
        security_context: Some(security_context),
        env: Some(env_vars(config_hash)),
        resources: spec.resources.clone(),
        volume_mounts: Some(mounts),
        liveness_probe: Some(probe(instance, &LIVENESS)),
        readiness_probe: Some(probe(instance, &READINESS)),
        ..Default::default()
    };

    let node_selector = if spec.node_selector.is_empty() {
        None
    } else {
        Some(spec.node_selector.clone())
    };

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(instance.name().to_owned()),
            namespace: Some(instance.namespace().to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    annotations: Some(annotations.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(spec.service_account.clone()),
                    containers: vec![log_container, api_container],
                    volumes: Some(pod_volumes),
                    affinity: Some(distribute_pods(
                        "component",
                        &[COMPONENT],
                        HOSTNAME_TOPOLOGY_KEY,
                    )),
                    node_selector,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
