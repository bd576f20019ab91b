//! Broadcast of memory state changes
//!
//! Every subscriber receives every event over a [`tokio::sync::broadcast`]
//! channel. Publishing with no subscribers is normal and not an error; a slow
//! subscriber lags and loses the oldest events instead of blocking writers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::consolidation::ConsolidationRun;
use crate::types::{ChatId, Layer, MessageId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    PinApplied {
        chat_id: ChatId,
        message_id: MessageId,
        entry_id: Uuid,
    },
    MessageBoosted {
        chat_id: ChatId,
        message_id: MessageId,
        encoding_strength: f64,
    },
    MessageMuted {
        chat_id: ChatId,
        message_id: MessageId,
        affected_layers: Vec<Layer>,
    },
    AffectTagged {
        chat_id: ChatId,
        message_id: MessageId,
        tag: String,
        intensity: f64,
    },
    ConfigUpdated {
        config: MemoryConfig,
    },
    ConsolidationCompleted {
        run: ConsolidationRun,
    },
}

impl MemoryEvent {
    /// Event name as used on the SSE stream
    pub fn name(&self) -> &'static str {
        match self {
            MemoryEvent::PinApplied { .. } => "pin_applied",
            MemoryEvent::MessageBoosted { .. } => "message_boosted",
            MemoryEvent::MessageMuted { .. } => "message_muted",
            MemoryEvent::AffectTagged { .. } => "affect_tagged",
            MemoryEvent::ConfigUpdated { .. } => "config_updated",
            MemoryEvent::ConsolidationCompleted { .. } => "consolidation_completed",
        }
    }
}

/// An event with the moment it was published
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MemoryEvent,
}

/// Shared sender side; clones publish into the same channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers; returns how many received it
    pub fn publish(&self, event: MemoryEvent) -> usize {
        let name = event.name();
        let delivered = self
            .sender
            .send(Envelope {
                at: Utc::now(),
                event,
            })
            .unwrap_or(0);
        trace!(event = name, delivered, "published memory event");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
