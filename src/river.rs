//! L1 River: recency-ordered buffer of raw conversational turns

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, MessageId};

/// Role of a message sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(crate::error::Error::validation(format!("unknown role: {other}"))),
        }
    }
}

/// A single conversational turn held in the river
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiverEntry {
    /// Message id from the chat store
    pub id: MessageId,

    pub chat_id: ChatId,

    #[serde(default)]
    pub role: Role,

    pub content: String,

    /// When the turn happened
    pub timestamp: DateTime<Utc>,

    /// Hidden from retrieval and search, retained for audit
    #[serde(default)]
    pub muted: bool,
}

impl RiverEntry {
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            role,
            content: content.into(),
            timestamp,
            muted: false,
        }
    }

    /// Age in whole seconds at `now` (never negative)
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds().max(0)
    }
}

/// Summary of one chat's river
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiverStats {
    pub total: usize,
    pub muted: usize,
    pub active: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// One chat's river
#[derive(Debug, Default, Clone)]
pub struct River {
    entries: HashMap<MessageId, RiverEntry>,
}

impl River {
    pub fn get(&self, id: &str) -> Option<&RiverEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, entry: RiverEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<RiverEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries newest first, muted ones included
    pub fn newest_first(&self) -> Vec<&RiverEntry> {
        let mut all: Vec<&RiverEntry> = self.entries.values().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// The `limit` most recent unmuted entries, newest first
    pub fn recent_unmuted(&self, limit: usize) -> Vec<&RiverEntry> {
        self.newest_first()
            .into_iter()
            .filter(|e| !e.muted)
            .take(limit)
            .collect()
    }

    /// Unmuted entries whose age lies in `(min_age_secs, max_age_secs]`, oldest first
    pub fn eligible_for_consolidation(
        &self,
        now: DateTime<Utc>,
        min_age_secs: i64,
        max_age_secs: i64,
    ) -> Vec<RiverEntry> {
        let mut eligible: Vec<RiverEntry> = self
            .entries
            .values()
            .filter(|e| !e.muted)
            .filter(|e| {
                let age = e.age_secs(now);
                age > min_age_secs && age <= max_age_secs
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        eligible
    }

    /// Ids of entries older than the retention window
    pub fn expired(&self, now: DateTime<Utc>, retention_secs: i64) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .entries
            .values()
            .filter(|e| e.age_secs(now) > retention_secs)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RiverStats {
        let muted = self.entries.values().filter(|e| e.muted).count();
        RiverStats {
            total: self.entries.len(),
            muted,
            active: self.entries.len() - muted,
            oldest: self.entries.values().map(|e| e.timestamp).min(),
            newest: self.entries.values().map(|e| e.timestamp).max(),
        }
    }
}

/// Recency signal in `(0, 1]`: halves every `half_life_hours`
pub fn recency_score(timestamp: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let age_hours = ((now - timestamp).num_milliseconds().max(0) as f64) / 3_600_000.0;
    if half_life_hours <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_hours / half_life_hours)
}
