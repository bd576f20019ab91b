//! L4 Salience Index: importance-ranked view over encoded and pinned entries

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::normalized_strength;
use crate::types::{ChatId, MessageId};

const STRENGTH_SHARE: f64 = 0.5;
const AFFECT_SHARE: f64 = 0.35;
const RECENCY_SHARE: f64 = 0.15;

/// Score reported for pinned entries, which are never scored
pub const PINNED_SCORE: f64 = 1.0;

/// Salience from encoding strength, affect intensity and recency
pub fn salience_score(encoding_strength: f64, affect_intensity: f64, recency: f64) -> f64 {
    STRENGTH_SHARE * normalized_strength(encoding_strength)
        + AFFECT_SHARE * affect_intensity.clamp(0.0, 1.0)
        + RECENCY_SHARE * recency.clamp(0.0, 1.0)
}

/// An importance-ranked memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalienceEntry {
    pub id: Uuid,
    pub chat_id: ChatId,
    /// Message the entry represents
    pub source_id: MessageId,
    /// Encoding entry backing this one, when the message was encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_id: Option<Uuid>,
    pub score: f64,
    pub pinned: bool,
    pub content: String,
    #[serde(default)]
    pub suppressed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SalienceEntry {
    pub fn scored(
        chat_id: &str,
        source_id: &str,
        encoding_id: Option<Uuid>,
        content: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            source_id: source_id.to_string(),
            encoding_id,
            score,
            pinned: false,
            content: content.to_string(),
            suppressed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pinned(chat_id: &str, source_id: &str, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            pinned: true,
            ..Self::scored(chat_id, source_id, None, content, PINNED_SCORE, now)
        }
    }

    /// Score as seen by ranking
    pub fn ranking_score(&self) -> f64 {
        if self.pinned {
            PINNED_SCORE
        } else {
            self.score
        }
    }
}

/// Filter for [`SalienceIndex::query`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalienceQuery {
    pub min_score: Option<f64>,
    #[serde(default)]
    pub pinned_only: bool,
    pub limit: Option<usize>,
}

/// One chat's salience entries, keyed by source message
#[derive(Debug, Default, Clone)]
pub struct SalienceIndex {
    entries: HashMap<MessageId, SalienceEntry>,
}

impl SalienceIndex {
    pub fn get(&self, source_id: &str) -> Option<&SalienceEntry> {
        self.entries.get(source_id)
    }

    pub fn upsert(&mut self, entry: SalienceEntry) {
        self.entries.insert(entry.source_id.clone(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SalienceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pinned_count(&self) -> usize {
        self.entries.values().filter(|e| e.pinned).count()
    }

    /// Unsuppressed entries, pinned first then by descending score
    pub fn ranked(&self) -> Vec<&SalienceEntry> {
        let mut ranked: Vec<&SalienceEntry> =
            self.entries.values().filter(|e| !e.suppressed).collect();
        ranked.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.ranking_score().total_cmp(&a.ranking_score()))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        ranked
    }

    pub fn query(&self, filter: &SalienceQuery) -> Vec<SalienceEntry> {
        let min = filter.min_score.unwrap_or(f64::NEG_INFINITY);
        let mut hits: Vec<SalienceEntry> = self
            .ranked()
            .into_iter()
            .filter(|e| !filter.pinned_only || e.pinned)
            .filter(|e| e.ranking_score() >= min)
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        hits
    }
}
