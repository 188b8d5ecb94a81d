//! ============================================================================
//! Access Events - Transition records and event sinks
//! ============================================================================
//! Every session transition produces exactly one `AccessEvent`. Sinks are
//! fire-and-forget: `record` cannot fail and must not block, so a slow or
//! broken audit pipeline never holds up an unlock.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::session::{FailureReason, UnlockState};
use crate::types::{ContentId, SessionId, UserId};

/// Default capacity of a broadcast sink
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// One state transition of an unlock session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub content_id: ContentId,
    pub from_state: UnlockState,
    pub to_state: UnlockState,
    /// Unix millis
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Destination for transition events (audit log, analytics, UI bus)
pub trait AccessEventSink: Send + Sync {
    fn record(&self, event: &AccessEvent);
}

/// Writes each event as a structured tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl AccessEventSink for TracingEventSink {
    fn record(&self, event: &AccessEvent) {
        match event.reason {
            Some(reason) => warn!(
                session_id = %event.session_id,
                user_id = %event.user_id,
                content_id = %event.content_id,
                from = %event.from_state,
                to = %event.to_state,
                reason = ?reason,
                "Unlock session transition"
            ),
            None => info!(
                session_id = %event.session_id,
                user_id = %event.user_id,
                content_id = %event.content_id,
                from = %event.from_state,
                to = %event.to_state,
                "Unlock session transition"
            ),
        }
    }
}

/// Broadcasts events to any number of async subscribers.
/// Sending never blocks; a lagging receiver loses the oldest events.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: broadcast::Sender<AccessEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccessEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

impl AccessEventSink for ChannelEventSink {
    fn record(&self, event: &AccessEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event.clone());
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<AccessEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AccessEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Transitions recorded for one session, in order
    pub fn transitions(&self, session_id: SessionId) -> Vec<(UnlockState, UnlockState)> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| (e.from_state, e.to_state))
            .collect()
    }
}

impl AccessEventSink for RecordingEventSink {
    fn record(&self, event: &AccessEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Forwards each event to several sinks
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn AccessEventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn AccessEventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AccessEventSink>) {
        self.sinks.push(sink);
    }
}

impl AccessEventSink for FanoutEventSink {
    fn record(&self, event: &AccessEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
