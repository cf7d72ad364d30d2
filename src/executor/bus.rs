//! Per-delegation event channels with terminal-event replay.
//!
//! The executor engine is the sole producer; SSE subscribers are the
//! consumers. A channel is opened at INVITE-admission time so a subscriber
//! can never race START. After the terminal event the completion record is
//! retained for a configurable window, during which late subscribers get a
//! single synthetic terminal replayed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::events::DelegationEvent;
use crate::{AwcpError, Result};

/// Retained terminal state of a finished delegation.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    /// The terminal event exactly as published.
    pub terminal: DelegationEvent,
    /// When the delegation finished.
    pub completed_at: DateTime<Utc>,
}

/// What a subscriber gets for a delegation id.
pub enum Subscription {
    /// Delegation in flight: a live receiver attached to the stream.
    Live(broadcast::Receiver<DelegationEvent>),
    /// Delegation finished within the retention window: one synthetic
    /// terminal event.
    Replay(DelegationEvent),
    /// Unknown id, or the retention window has lapsed.
    Unknown,
}

/// Event fan-out hub for all in-flight delegations.
pub struct EventBus {
    watermark: usize,
    retention: Duration,
    channels: Mutex<HashMap<String, broadcast::Sender<DelegationEvent>>>,
    completed: Mutex<HashMap<String, CompletionRecord>>,
}

impl EventBus {
    /// Create a bus with the given subscriber watermark and completion
    /// retention window.
    #[must_use]
    pub fn new(watermark: usize, retention_ms: u64) -> Self {
        Self {
            watermark: watermark.max(1),
            retention: Duration::from_millis(retention_ms),
            channels: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    /// Open the event channel for a newly admitted delegation.
    pub fn open(&self, delegation_id: &str) {
        let (tx, _) = broadcast::channel(self.watermark);
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if channels.insert(delegation_id.to_owned(), tx).is_some() {
            warn!(delegation_id, "event channel reopened for existing delegation");
        }
    }

    /// Publish an event to every attached subscriber, in producer order.
    ///
    /// A terminal event closes the channel and moves the delegation into
    /// the retained-completion map.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` if no channel exists for the id.
    pub fn publish(&self, delegation_id: &str, event: DelegationEvent) -> Result<()> {
        let terminal = event.is_terminal();
        {
            let channels = self
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(tx) = channels.get(delegation_id) else {
                return Err(AwcpError::NotFound(format!(
                    "no event channel for delegation {delegation_id}"
                )));
            };
            // A send error only means no subscriber is currently attached;
            // terminal events are still retained for replay below.
            if tx.send(event.clone()).is_err() {
                debug!(delegation_id, "event published with no live subscribers");
            }
        }

        if terminal {
            self.completed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(
                    delegation_id.to_owned(),
                    CompletionRecord {
                        terminal: event,
                        completed_at: Utc::now(),
                    },
                );
            self.channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(delegation_id);
        }
        Ok(())
    }

    /// Attach a subscriber to a delegation's stream.
    pub fn subscribe(&self, delegation_id: &str) -> Subscription {
        {
            let channels = self
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(tx) = channels.get(delegation_id) {
                return Subscription::Live(tx.subscribe());
            }
        }
        self.prune_expired();
        let completed = self
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match completed.get(delegation_id) {
            Some(record) => Subscription::Replay(record.terminal.clone()),
            None => Subscription::Unknown,
        }
    }

    /// Retained completion record for post-SSE recovery, if still within
    /// the retention window.
    #[must_use]
    pub fn completion(&self, delegation_id: &str) -> Option<CompletionRecord> {
        self.prune_expired();
        self.completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(delegation_id)
            .cloned()
    }

    /// Drop the channel for a delegation whose admission was discarded
    /// before START; no terminal is retained.
    pub fn discard(&self, delegation_id: &str) {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(delegation_id);
    }

    /// Subscriber queue watermark in events.
    #[must_use]
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Number of retained completion records.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.prune_expired();
        self.completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn prune_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        self.completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|_, record| record.completed_at > cutoff);
    }
}
