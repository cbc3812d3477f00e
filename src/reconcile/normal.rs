use super::{Pass, ReconcileAction, ReconcileError, Reconciler};
use crate::api::CinderApi;
use crate::cinder::{DEPENDENCY_REQUEUE_SECS, FACADES, INPUT_HASH_NAME};
use crate::client::Patch;
use crate::hash::InputHashes;
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::labels::{service_labels, Labels};
use crate::objects::{config_map, endpoint, keystone, secret, stateful_set, Readiness};
use crate::render;
use crate::resource::K8sResource;
use crate::store::ObjectStore;

use std::time::Duration;

/// Runs the steps of a normal pass in order. The first step that fails or has to wait ends
/// the pass.
pub(super) async fn reconcile_normal<S: ObjectStore>(
    reconciler: &Reconciler<S>,
    pass: &mut Pass,
) -> Result<ReconcileAction, ReconcileError> {
    ensure_finalizer(reconciler, pass).await?;

    let store = reconciler.store();
    let mut hashes = InputHashes::new();
    let namespace = pass.instance.namespace().to_owned();

    let secret_name = pass.instance.spec.secret.clone();
    match secret::get_secret(store, &namespace, &secret_name).await? {
        Some((_, hash)) => hashes.record(secret_name, hash),
        None => {
            return Err(ReconcileError::not_ready(
                format!("OpenStack secret {} not found", secret_name),
                Duration::from_secs(DEPENDENCY_REQUEUE_SECS),
            ));
        }
    }

    match config_map::ensure_service_config(store, &pass.instance).await {
        Ok((name, hash)) => hashes.record(name, hash),
        // the service runs fine without the custom config, so this doesn't stop the pass
        Err(err) => log::info!(
            "Failed to generate the config map of CinderAPI {}: {}",
            pass.instance.id(),
            err
        ),
    }

    let parent = pass.instance.parent_name().to_owned();
    match config_map::parent_config_hashes(store, &namespace, &parent).await? {
        Some(parent_hashes) => {
            for (name, hash) in parent_hashes {
                hashes.record(name, hash);
            }
        }
        None => {
            return Err(ReconcileError::not_ready(
                format!("Could not find all config maps for parent Cinder CR {}", parent),
                Duration::from_secs(DEPENDENCY_REQUEUE_SECS),
            ));
        }
    }

    let input_hash = hashes.aggregate()?;
    let previous = pass.status().hash.get(INPUT_HASH_NAME).cloned();
    if previous.as_deref() != Some(input_hash.as_str()) {
        log::info!("Input hash of CinderAPI {} changed to {}", pass.instance.id(), input_hash);
        pass.status()
            .hash
            .insert(INPUT_HASH_NAME.to_owned(), input_hash.clone());
        reconciler.save_status(pass).await?;
    }

    for facade in FACADES.iter() {
        match endpoint::expose(store, &pass.instance, facade).await? {
            Readiness::Ready(urls) => {
                pass.status()
                    .api_endpoints
                    .insert(facade.name.to_owned(), urls);
            }
            Readiness::Pending(delay) => return Ok(ReconcileAction::RequeueAfter(delay)),
        }
    }

    for facade in FACADES.iter() {
        let endpoints = pass
            .status()
            .api_endpoints
            .get(facade.name)
            .cloned()
            .unwrap_or_default();
        match keystone::ensure_service(store, &pass.instance, facade, &endpoints).await? {
            Readiness::Ready(service_id) => {
                pass.status()
                    .service_ids
                    .insert(facade.name.to_owned(), service_id);
            }
            Readiness::Pending(delay) => return Ok(ReconcileAction::RequeueAfter(delay)),
        }
    }

    update(pass);
    upgrade(pass);

    let labels = service_labels();
    let stateful_set = render::stateful_set(&pass.instance, &input_hash, &labels, &Labels::new())?;
    match stateful_set::apply(store, &pass.instance, &stateful_set).await? {
        Readiness::Ready(ready) => pass.status().ready_count = ready,
        Readiness::Pending(delay) => return Ok(ReconcileAction::RequeueAfter(delay)),
    }

    Ok(ReconcileAction::Done)
}

/// Adds our finalizer and saves it right away, so that it's there even if a later step fails
async fn ensure_finalizer<S: ObjectStore>(
    reconciler: &Reconciler<S>,
    pass: &mut Pass,
) -> Result<(), ReconcileError> {
    if pass.instance.has_finalizer(reconciler.finalizer()) {
        return Ok(());
    }
    let mut finalizers = pass.instance.finalizers().to_vec();
    finalizers.push(reconciler.finalizer().to_owned());
    let patch = Patch::finalizers(pass.instance.resource_version(), &finalizers);
    let updated = reconciler
        .store()
        .patch(CinderAPI, &pass.instance.id(), &patch)
        .await?;
    log::info!("Added finalizer to CinderAPI {}", pass.instance.id());

    pass.resource = K8sResource::from_value(updated)?;
    let updated: CinderApi = serde_json::from_value(pass.resource.as_ref().clone())?;
    pass.instance.metadata = updated.metadata;
    Ok(())
}

/// Minor version updates. Nothing to do yet.
fn update(pass: &Pass) {
    log::trace!("No update steps for CinderAPI {}", pass.instance.id());
}

/// Major version upgrades. Nothing to do yet.
fn upgrade(pass: &Pass) {
    log::trace!("No upgrade steps for CinderAPI {}", pass.instance.id());
}
