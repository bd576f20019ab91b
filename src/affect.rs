//! L2 Affect Ledger: per-message emotional annotations
//!
//! Entries are append-only. A message may carry several tags over time and
//! muting a message never removes its affect history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{normalize_tag, ChatId, MessageId};

/// One emotional annotation of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectEntry {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// Normalized category, e.g. `joy` or `frustration`
    pub tag: String,
    /// Strength in `[0, 1]`
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AffectEntry {
    /// Build a validated entry
    pub fn new(
        chat_id: &str,
        message_id: &str,
        tag: &str,
        intensity: f64,
        reason: Option<String>,
    ) -> Result<Self> {
        if !intensity.is_finite() || !(0.0..=1.0).contains(&intensity) {
            return Err(Error::validation("intensity must be within [0, 1]"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            tag: normalize_tag(tag)?,
            intensity,
            reason: reason.filter(|r| !r.trim().is_empty()),
            created_at: Utc::now(),
        })
    }
}

/// Filter for [`AffectLedger::query`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectQuery {
    pub category: Option<String>,
    pub min_intensity: Option<f64>,
    pub limit: Option<usize>,
}

/// One chat's affect history
#[derive(Debug, Default, Clone)]
pub struct AffectLedger {
    entries: Vec<AffectEntry>,
}

impl AffectLedger {
    pub fn append(&mut self, entry: AffectEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry attached to `message_id`, oldest first
    pub fn for_message<'a>(&'a self, message_id: &'a str) -> impl Iterator<Item = &'a AffectEntry> {
        self.entries.iter().filter(move |e| e.message_id == message_id)
    }

    /// Strongest intensity ever recorded for a message (0.0 when untagged)
    pub fn max_intensity(&self, message_id: &str) -> f64 {
        self.for_message(message_id)
            .map(|e| e.intensity)
            .fold(0.0, f64::max)
    }

    /// Strongest intensity among entries whose tag is in `tags`
    pub fn matching_intensity(&self, message_id: &str, tags: &[String]) -> Option<f64> {
        self.for_message(message_id)
            .filter(|e| tags.iter().any(|t| t == &e.tag))
            .map(|e| e.intensity)
            .reduce(f64::max)
    }

    /// Newest-first entries matching the filter
    pub fn query(&self, filter: &AffectQuery) -> Result<Vec<AffectEntry>> {
        let category = filter.category.as_deref().map(normalize_tag).transpose()?;
        let min = filter.min_intensity.unwrap_or(0.0);

        let mut matched: Vec<AffectEntry> = self
            .entries
            .iter()
            .filter(|e| category.as_ref().map_or(true, |c| &e.tag == c))
            .filter(|e| e.intensity >= min)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_intensity() {
        assert!(AffectEntry::new("c", "m", "joy", 1.2, None).is_err());
        assert!(AffectEntry::new("c", "m", "joy", f64::NAN, None).is_err());
        assert!(AffectEntry::new("c", "m", "", 0.5, None).is_err());
    }

    #[test]
    fn multiple_tags_accumulate_per_message() {
        let mut ledger = AffectLedger::default();
        ledger.append(AffectEntry::new("c", "m1", "joy", 0.4, None).unwrap());
        ledger.append(AffectEntry::new("c", "m1", "Relief", 0.7, Some("finally".into())).unwrap());
        ledger.append(AffectEntry::new("c", "m2", "anger", 0.9, None).unwrap());

        assert_eq!(ledger.for_message("m1").count(), 2);
        assert!((ledger.max_intensity("m1") - 0.7).abs() < 1e-9);
        assert_eq!(ledger.max_intensity("unknown"), 0.0);
        assert_eq!(ledger.matching_intensity("m1", &["joy".to_string()]), Some(0.4));
        assert_eq!(ledger.matching_intensity("m1", &["anger".to_string()]), None);
    }

    #[test]
    fn query_filters_by_category_and_intensity() {
        let mut ledger = AffectLedger::default();
        ledger.append(AffectEntry::new("c", "m1", "joy", 0.2, None).unwrap());
        ledger.append(AffectEntry::new("c", "m2", "joy", 0.8, None).unwrap());
        ledger.append(AffectEntry::new("c", "m3", "fear", 0.9, None).unwrap());

        let hits = ledger
            .query(&AffectQuery {
                category: Some("JOY".into()),
                min_intensity: Some(0.5),
                limit: None,
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m2");
    }
}
