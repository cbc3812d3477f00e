//! Lists and then watches one resource type, forwarding every object it sees to the
//! dispatcher. Nothing is cached here; the dispatcher only needs to know what changed.
use crate::client::{ApiError, Client, Error as ClientError, ObjectList, WatchEvent};
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource};
use crate::runner::metrics::WatcherMetrics;
use crate::runner::Message;

use serde_json::Value;
use tokio::sync::mpsc::{error::SendError, Sender};

use std::fmt::{self, Display};
use std::time::Duration;

const ERROR_PAUSE: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum WatcherError {
    SendErr,
    ClientErr(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatcherError::SendErr => f.write_str("Sender channel closed"),
            WatcherError::ClientErr(err) => write!(f, "Client Error: {}", err),
            WatcherError::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            WatcherError::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            WatcherError::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::ClientErr(err) => Some(err),
            WatcherError::InvalidResource(e) => Some(e),
            WatcherError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for WatcherError {
    fn from(err: ApiError) -> WatcherError {
        if err.code == 410 {
            WatcherError::ResourceVersionExpired
        } else {
            WatcherError::Api(err)
        }
    }
}

impl From<InvalidResourceError> for WatcherError {
    fn from(err: InvalidResourceError) -> WatcherError {
        WatcherError::InvalidResource(err)
    }
}

impl From<ClientError> for WatcherError {
    fn from(err: ClientError) -> WatcherError {
        if err.is_gone() {
            WatcherError::ResourceVersionExpired
        } else {
            WatcherError::ClientErr(err)
        }
    }
}

impl<T> From<SendError<T>> for WatcherError {
    fn from(_: SendError<T>) -> WatcherError {
        WatcherError::SendErr
    }
}

pub(crate) fn start(
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    client: Client,
    sender: Sender<Message>,
    metrics: WatcherMetrics,
) {
    let watcher = Watcher {
        k8s_type,
        namespace,
        client,
        sender,
        metrics,
        last_error: None,
    };
    tokio::spawn(watcher.run());
}

struct Watcher {
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    client: Client,
    sender: Sender<Message>,
    metrics: WatcherMetrics,
    /// kept for logging when the watcher recovers
    last_error: Option<anyhow::Error>,
}

impl Watcher {
    async fn run(mut self) {
        log::debug!("Starting watcher for resources of type: {}", self.k8s_type);
        loop {
            let result = match self.list().await {
                Ok(resource_version) => self.watch_from(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !self.handle_error(err).await {
                    break;
                }
            }
        }
        log::info!("Ending watcher for resources: {}", self.k8s_type);
    }

    /// Returns false if the watcher should stop
    async fn handle_error(&mut self, error: WatcherError) -> bool {
        let expired = matches!(error, WatcherError::ResourceVersionExpired);
        let send_err = matches!(error, WatcherError::SendErr);
        if expired {
            log::warn!("ResourceVersion is too old for type: {}, listing again", self.k8s_type);
        } else {
            log::error!("Error in watcher for type: {}, err: {}", self.k8s_type, error);
            self.metrics.error();
        }
        self.last_error = Some(anyhow::Error::new(error));
        if send_err {
            return false;
        }
        if !expired {
            tokio::time::sleep(ERROR_PAUSE).await;
        }
        true
    }

    async fn watch_from(&mut self, mut resource_version: String) -> Result<(), WatcherError> {
        loop {
            self.metrics.request_started();
            log::debug!(
                "Starting watch of: {} with resourceVersion: {}",
                self.k8s_type,
                resource_version
            );
            let mut events = self
                .client
                .watch(self.k8s_type, self.namespace.as_deref(), Some(resource_version.as_str()))
                .await?;
            while let Some(result) = events.next().await {
                self.metrics.event_received();
                if let Some(version) = self.handle_event(result?).await? {
                    resource_version = version;
                }
            }
            // watches time out on the server side, so ending is expected
            log::trace!("Watch of {} ended, resuming at {}", self.k8s_type, resource_version);
        }
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<Option<String>, WatcherError> {
        let (deleted, object) = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => (false, object),
            WatchEvent::Deleted(object) => (true, object),
            WatchEvent::Bookmark(object) => {
                let version = object
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                    .map(String::from);
                return Ok(version);
            }
            WatchEvent::Error(err) => return Err(err.into()),
        };
        let resource = K8sResource::from_value(object)?;
        let version = resource.resource_version().to_owned();
        self.send(resource, deleted).await?;
        Ok(Some(version))
    }

    async fn send(&mut self, resource: K8sResource, deleted: bool) -> Result<(), WatcherError> {
        let message = Message::Event {
            k8s_type: self.k8s_type,
            deleted,
            object: resource.into_value(),
        };
        self.sender.send(message).await?;
        Ok(())
    }

    /// Sends every existing object and returns the resourceVersion to start watching from
    async fn list(&mut self) -> Result<String, WatcherError> {
        log::info!("Listing resources of type: {}", self.k8s_type);
        self.metrics.request_started();
        let ObjectList { metadata, items } = self
            .client
            .list(self.k8s_type, self.namespace.as_deref(), None)
            .await?;
        let resource_version = metadata.resource_version.ok_or_else(|| {
            InvalidResourceError::new(
                "list result from api server is missing metadata.resourceVersion",
                Value::Null,
            )
        })?;

        for mut object in items {
            self.add_type_to_list_object(&mut object)?;
            let resource = K8sResource::from_value(object)?;
            self.send(resource, false).await?;
        }
        if let Some(err) = self.last_error.take() {
            log::info!("Watcher for {} recovered from: {}", self.k8s_type, err);
        }
        Ok(resource_version)
    }

    /// Items of a list response don't have apiVersion and kind
    fn add_type_to_list_object(&self, object: &mut Value) -> Result<(), InvalidResourceError> {
        match object.as_object_mut() {
            Some(obj) => {
                obj.insert("apiVersion".to_owned(), self.k8s_type.api_version.into());
                obj.insert("kind".to_owned(), self.k8s_type.kind.into());
                Ok(())
            }
            None => Err(InvalidResourceError::new(
                "list item must be an object",
                object.clone(),
            )),
        }
    }
}
