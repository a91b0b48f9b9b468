//! In-process lifecycle hook bus.
//!
//! Observers subscribe to stream created/appended/deleted notifications.
//! Fan-out is best-effort: a slow or crashed observer never blocks the
//! operation that produced the event.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::store::{AppendRequest, StreamStore};
use crate::types::{StreamConfig, StreamLifecycleEvent};

/// Best-effort fan-out of lifecycle events to in-process subscribers.
#[derive(Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<StreamLifecycleEvent>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamLifecycleEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is subscribed or a
    /// subscriber has lagged past the channel capacity.
    pub fn emit(&self, event: StreamLifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror create/delete lifecycle events into a user-visible JSON stream.
///
/// Append events and events about the registry stream itself are skipped;
/// mirroring the registry into itself would loop forever.
pub fn spawn_registry_mirror(
    store: Arc<StreamStore>,
    registry_path: String,
) -> tokio::task::JoinHandle<()> {
    let mut rx = store.hooks().subscribe();

    tokio::spawn(async move {
        let config = StreamConfig {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        if let Err(e) = store.create(&registry_path, config) {
            warn!(path = %registry_path, error = %e, "failed to create registry stream");
            return;
        }

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "registry mirror lagged behind lifecycle events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let path = match &event {
                StreamLifecycleEvent::Created { path, .. } => path,
                StreamLifecycleEvent::Deleted { path, .. } => path,
                StreamLifecycleEvent::Appended { .. } => continue,
            };
            if path == &registry_path {
                continue;
            }

            let body = match serde_json::to_vec(&event) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    warn!(error = %e, "failed to serialize lifecycle event");
                    continue;
                }
            };

            match store.append(&registry_path, AppendRequest::body(body)) {
                Ok(outcome) => {
                    debug!(path = %registry_path, offset = %outcome.next_offset, "mirrored lifecycle event")
                }
                Err(e) => warn!(path = %registry_path, error = %e, "failed to mirror lifecycle event"),
            }
        }
    })
}
