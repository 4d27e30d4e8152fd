//! Progress event distribution.
//!
//! Every stage transition publishes a [`ProgressEvent`]. Two delivery paths
//! exist:
//!
//! - **Callbacks** registered with [`ProgressEventBus::on_progress`] run
//!   synchronously in the publishing task, in publish order. A slow callback
//!   slows the pipeline that produced the event.
//! - **Receivers** from [`ProgressEventBus::subscribe`] are backed by a
//!   `tokio::broadcast` channel. They never block producers; a receiver that
//!   falls behind the buffer sees `RecvError::Lagged`.

use crate::stage::Stage;
use crate::state::PipelineId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Emitted on every stage transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub pipeline_id: PipelineId,
    pub content_id: String,
    /// Stage just entered
    pub stage: Stage,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
}

/// Handle returned by [`ProgressEventBus::on_progress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Fan-out of progress events to callbacks and broadcast receivers
pub struct ProgressEventBus {
    callbacks: RwLock<Vec<(SubscriptionId, ProgressCallback)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ProgressEvent>,
    capacity: usize,
}

impl ProgressEventBus {
    /// Create a bus whose broadcast receivers buffer `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Register a callback invoked for every event published from now on
    pub fn on_progress<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Async view of the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every callback, then to broadcast receivers
    pub fn publish(&self, event: ProgressEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let callbacks: Vec<ProgressCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &callbacks {
            callback(&event);
        }

        trace!(
            pipeline_id = %event.pipeline_id,
            stage = %event.stage,
            progress = event.progress,
            "Published progress event"
        );
        let _ = self.tx.send(event);
    }

    /// Number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Number of live broadcast receivers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ProgressEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
