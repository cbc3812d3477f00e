//! A Kubernetes operator for the OpenStack Block Storage API. Each `CinderAPI` resource is
//! turned into a `StatefulSet` running the `cinder-api` service, a `Service` (and for the
//! public endpoint a `Route`) per API endpoint, a service configuration `ConfigMap` and one
//! `KeystoneService` registration per API version.
//!
//! The reconcile logic in [`reconcile`](reconcile/index.html) only talks to the cluster through
//! the [`ObjectStore`](store/trait.ObjectStore.html) trait, so it can be driven by the real
//! `Client` or by the in-memory store in `testkit`.
//!
//! The binary just needs to call `runner::run_operator`:
//! ```no_run
//! use cinder_api_operator::config::OperatorConfig;
//! use cinder_api_operator::runner::run_operator;
//!
//! let config = OperatorConfig::new("cinder-api-operator").within_namespace("openstack");
//! // blocks the current thread until the operator fails
//! let err = run_operator(config);
//! eprintln!("operator stopped: {}", err);
//! ```

#[macro_use]
extern crate serde_derive;

pub mod api;
pub mod cinder;
pub mod client;
pub mod compare;
pub mod config;
pub mod error;
pub mod hash;
pub mod k8s_types;
pub mod labels;
pub mod objects;
pub mod reconcile;
pub mod render;
pub mod resource;
pub mod runner;
pub mod store;
pub mod watch;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use serde_json;
