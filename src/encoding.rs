//! L3 Encoding Store: long-term entries with a decaying encoding strength
//!
//! Strength is tracked as a base value fixed at creation or at the last
//! boost, decayed by elapsed time since `last_boosted_at`. The stored
//! `encoding_strength` is the decayed value as of the last recompute.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DecayFunction, MemoryConfig};
use crate::error::{Error, Result};
use crate::types::{ChatId, MessageId};

/// Strength of a freshly promoted entry
pub const INITIAL_STRENGTH: f64 = 1.0;

/// Floor applied before multiplying on boost, so fully decayed entries still rise
const BOOST_FLOOR: f64 = 0.1;

/// Apply the configured decay curve to `base` after `elapsed_days`
pub fn decay(base: f64, elapsed_days: f64, function: DecayFunction, rate: f64) -> f64 {
    let days = elapsed_days.max(0.0);
    let decayed = match function {
        DecayFunction::Exponential => base * (-rate * days).exp(),
        DecayFunction::Linear => base - rate * days,
    };
    decayed.max(0.0)
}

/// Map an unbounded strength into `[0, 1)`
pub fn normalized_strength(strength: f64) -> f64 {
    let s = strength.max(0.0);
    s / (s + 1.0)
}

/// A consolidated long-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingEntry {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub source_message_id: MessageId,
    pub content: String,
    /// Strength at `last_boosted_at`, before any decay
    pub base_strength: f64,
    /// Decayed strength as of the last recompute
    pub encoding_strength: f64,
    pub last_boosted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub boost_count: u32,
    /// Hidden because its source message was muted
    #[serde(default)]
    pub suppressed: bool,
}

impl EncodingEntry {
    pub fn new(chat_id: &str, source_message_id: &str, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            source_message_id: source_message_id.to_string(),
            content: content.to_string(),
            base_strength: INITIAL_STRENGTH,
            encoding_strength: INITIAL_STRENGTH,
            last_boosted_at: now,
            created_at: now,
            boost_count: 0,
            suppressed: false,
        }
    }

    /// Decayed strength at `now` without mutating the entry
    pub fn strength_at(&self, now: DateTime<Utc>, config: &MemoryConfig) -> f64 {
        let elapsed_days = (now - self.last_boosted_at).num_milliseconds() as f64 / 86_400_000.0;
        decay(self.base_strength, elapsed_days, config.decay_function, config.decay_rate)
    }

    /// Refresh the stored strength from the base
    pub fn recompute(&mut self, now: DateTime<Utc>, config: &MemoryConfig) {
        self.encoding_strength = self.strength_at(now, config);
    }

    /// Multiply the current strength by `factor` and restart the decay clock
    pub fn boost(&mut self, factor: f64, now: DateTime<Utc>, config: &MemoryConfig) -> Result<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(Error::validation("boost factor must be a finite number > 0"));
        }
        let current = self.strength_at(now, config);
        let boosted = current.max(BOOST_FLOOR) * factor;
        self.base_strength = boosted;
        self.encoding_strength = boosted;
        self.last_boosted_at = now;
        self.boost_count += 1;
        Ok(())
    }
}

/// One chat's encoding entries
#[derive(Debug, Default, Clone)]
pub struct EncodingStore {
    entries: HashMap<Uuid, EncodingEntry>,
    by_source: HashMap<MessageId, Uuid>,
}

impl EncodingStore {
    pub fn get(&self, id: &Uuid) -> Option<&EncodingEntry> {
        self.entries.get(id)
    }

    pub fn by_source(&self, message_id: &str) -> Option<&EncodingEntry> {
        self.by_source
            .get(message_id)
            .and_then(|id| self.entries.get(id))
    }

    /// Insert or replace; one entry per source message
    pub fn upsert(&mut self, entry: EncodingEntry) {
        if let Some(previous) = self.by_source.insert(entry.source_message_id.clone(), entry.id) {
            if previous != entry.id {
                self.entries.remove(&previous);
            }
        }
        self.entries.insert(entry.id, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn suppressed_count(&self) -> usize {
        self.entries.values().filter(|e| e.suppressed).count()
    }
}
