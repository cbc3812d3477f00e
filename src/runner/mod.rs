//! Runs the reconciler against a real cluster. Watchers feed every object they see into a
//! single dispatcher loop, which maps objects to `CinderAPI` ids and starts reconcile passes.
//! At most one pass per id runs at a time; events that arrive during a pass cause another pass
//! once it's done.
pub mod metrics;
mod server;
mod watcher;

use crate::client::Client;
use crate::config::{ClientConfig, OperatorConfig};
use crate::error::Error;
use crate::k8s_types::apps::v1::StatefulSet;
use crate::k8s_types::cinder_openstack_org::v1beta1::CinderAPI;
use crate::k8s_types::core::v1::{ConfigMap, Secret, Service};
use crate::k8s_types::keystone_openstack_org::v1beta1::KeystoneService;
use crate::k8s_types::route_openshift_io::v1::Route;
use crate::k8s_types::K8sType;
use crate::reconcile::{ReconcileAction, Reconciler};
use crate::resource::{object_id, ObjectId};
use crate::watch::{requests_for, ParentIndex};
use metrics::Metrics;

use backoff::{backoff::Backoff, ExponentialBackoff};
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, Receiver, Sender};

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Every type whose events can lead to a reconcile pass
pub static WATCHED_TYPES: &[&K8sType] = &[
    CinderAPI,
    ConfigMap,
    Secret,
    Service,
    Route,
    StatefulSet,
    KeystoneService,
];

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct UnexpectedShutdownError;

impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Operator shutdown due to an unexpected error")
    }
}

impl std::error::Error for UnexpectedShutdownError {}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts
/// down due to an error.
pub fn run_operator(config: OperatorConfig) -> Error {
    match ClientConfig::load(config.operator_name.as_str()) {
        Ok(client_config) => run_operator_with_client_config(config, client_config),
        Err(err) => err,
    }
}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts
/// down due to an error.
pub fn run_operator_with_client_config(config: OperatorConfig, client_config: ClientConfig) -> Error {
    let metrics = Arc::new(Metrics::new());
    let client = match Client::new(client_config, metrics.client_metrics()) {
        Ok(c) => c,
        Err(err) => return err.into(),
    };
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    runtime.block_on(run_with_client(config, client, metrics));
    log::warn!("Operator stopped, shutting down runtime");
    // the operator never stops under normal circumstances
    Box::new(UnexpectedShutdownError)
}

async fn run_with_client(config: OperatorConfig, client: Client, metrics: Arc<Metrics>) {
    log::debug!("Starting operator with configuration: {:?}", config);
    let (sender, receiver) = mpsc::channel::<Message>(1024);
    for k8s_type in WATCHED_TYPES.iter().copied() {
        watcher::start(
            k8s_type,
            config.namespace.clone(),
            client.clone(),
            sender.clone(),
            metrics.watcher_metrics(k8s_type),
        );
    }

    let reconciler = Arc::new(Reconciler::new(client, config.finalizer.as_str()));
    let dispatcher = Dispatcher::new(reconciler, metrics.clone(), sender, receiver);
    if config.expose_metrics || config.expose_health {
        let server = server::start(
            config.server_port,
            metrics,
            config.expose_metrics,
            config.expose_health,
        );
        futures_util::future::join(server, dispatcher.run()).await;
    } else {
        dispatcher.run().await;
    }
}

#[derive(Debug)]
pub(crate) enum Message {
    /// An object was listed, added, modified or deleted
    Event {
        k8s_type: &'static K8sType,
        deleted: bool,
        object: Value,
    },
    /// A delayed retry. Ignored unless no other pass happened since it was scheduled.
    Requeue { id: ObjectId, round: u32 },
    Finished { id: ObjectId, outcome: Outcome },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Outcome {
    Done,
    RequeueAfter(Duration),
    Failed(Option<Duration>),
}

#[derive(Debug)]
struct CappedBackoff(ExponentialBackoff);

impl Backoff for CappedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let CappedBackoff(exp) = self;
        exp.next_backoff()
    }
    fn reset(&mut self) {
        let CappedBackoff(exp) = self;
        exp.reset()
    }
}

impl Default for CappedBackoff {
    fn default() -> Self {
        let mut timer = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: MAX_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };
        timer.reset();
        CappedBackoff(timer)
    }
}

#[derive(Debug, Default)]
struct KeyState {
    started: Option<Instant>,
    /// something changed while a pass was running
    dirty: bool,
    /// incremented for every pass, so that stale requeues can be recognized
    round: u32,
    backoff: CappedBackoff,
}

struct Dispatcher<S: crate::store::ObjectStore> {
    reconciler: Arc<Reconciler<S>>,
    metrics: Arc<Metrics>,
    index: ParentIndex,
    states: HashMap<ObjectId, KeyState>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

impl<S: crate::store::ObjectStore> Dispatcher<S> {
    fn new(
        reconciler: Arc<Reconciler<S>>,
        metrics: Arc<Metrics>,
        sender: Sender<Message>,
        receiver: Receiver<Message>,
    ) -> Dispatcher<S> {
        Dispatcher {
            reconciler,
            metrics,
            index: ParentIndex::new(),
            states: HashMap::new(),
            sender,
            receiver,
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            log::trace!("Received: {:?}", message);
            self.handle(message);
        }
        log::warn!("All watchers have stopped, stopping operator");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Event {
                k8s_type,
                deleted,
                object,
            } => self.handle_event(k8s_type, deleted, &object),
            Message::Requeue { id, round } => {
                let current = self.states.get(&id).map(|s| (s.round, s.started.is_some()));
                match current {
                    Some((current_round, false)) if current_round == round => {
                        log::debug!("Triggering scheduled reconcile of {}", id);
                        self.start(id);
                    }
                    _ => log::debug!(
                        "Skipping scheduled reconcile of {} because it was reconciled since",
                        id
                    ),
                }
            }
            Message::Finished { id, outcome } => self.finished(id, outcome),
        }
    }

    fn handle_event(&mut self, k8s_type: &'static K8sType, deleted: bool, object: &Value) {
        self.metrics.watch_event_received();
        if k8s_type == CinderAPI {
            if deleted {
                if let Some(id) = object_id(object) {
                    let id = id.to_owned();
                    self.index.remove(&id);
                    self.metrics.cinder_api_deleted(&id.as_id_ref());
                    if self.states.get(&id).map_or(false, |s| s.started.is_none()) {
                        self.states.remove(&id);
                    }
                }
                return;
            }
            self.index.upsert(object);
        }
        for id in requests_for(&self.index, k8s_type, object) {
            log::debug!("{} {:?} triggers reconcile of {}", k8s_type.kind, object_id(object), id);
            self.trigger(id);
        }
    }

    fn trigger(&mut self, id: ObjectId) {
        let state = self.states.entry(id.clone()).or_default();
        if state.started.is_some() {
            state.dirty = true;
        } else {
            self.start(id);
        }
    }

    fn start(&mut self, id: ObjectId) {
        let state = self.states.entry(id.clone()).or_default();
        state.round += 1;
        state.dirty = false;
        state.started = Some(Instant::now());
        self.metrics.reconcile_started(&id.as_id_ref());

        let reconciler = self.reconciler.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let outcome = match reconciler.reconcile(&id.as_id_ref()).await {
                Ok(ReconcileAction::Done) => Outcome::Done,
                Ok(ReconcileAction::RequeueAfter(delay)) => Outcome::RequeueAfter(delay),
                Err(err) => Outcome::Failed(err.requeue_after()),
            };
            if sender.send(Message::Finished { id, outcome }).await.is_err() {
                log::warn!("Unable to report finished reconcile, dispatcher is gone");
            }
        });
    }

    fn finished(&mut self, id: ObjectId, outcome: Outcome) {
        self.metrics
            .reconcile_finished(&id.as_id_ref(), matches!(outcome, Outcome::Failed(_)));
        let state = self.states.entry(id.clone()).or_default();
        let elapsed = state.started.take().map(|s| s.elapsed()).unwrap_or_default();
        log::info!(
            "Completed reconcile of {} in {}ms with outcome: {:?}",
            id,
            elapsed.as_millis(),
            outcome
        );

        let retry = match outcome {
            Outcome::Done => {
                state.backoff.reset();
                None
            }
            Outcome::RequeueAfter(delay) | Outcome::Failed(Some(delay)) => {
                state.backoff.reset();
                Some(delay)
            }
            Outcome::Failed(None) => Some(state.backoff.next_backoff().unwrap_or(MAX_BACKOFF)),
        };

        if state.dirty {
            self.start(id);
        } else if !self.index.contains(&id) {
            // deleted while the pass was running, or never seen by the CinderAPI watcher
            log::debug!("Forgetting {}, no CinderAPI is known by that name", id);
            self.states.remove(&id);
        } else if let Some(delay) = retry {
            let round = state.round;
            self.schedule_requeue(id, round, delay);
        }
    }

    fn schedule_requeue(&self, id: ObjectId, round: u32, delay: Duration) {
        log::debug!("Scheduling reconcile of {} in {}ms", id, delay.as_millis());
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(Message::Requeue { id, round }).await.is_err() {
                log::warn!("Unable to send requeue message");
            }
        });
    }
}
