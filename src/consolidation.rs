//! Consolidation: promote river turns into long-term tiers, prune, decay
//!
//! A run walks the eligible river window oldest first. Each promotion is
//! committed on its own so a failure or cancellation part way through keeps
//! everything committed so far. The store guarantees at most one run per chat.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{ChatChange, ChatMemory};
use crate::config::MemoryConfig;
use crate::encoding::{EncodingEntry, INITIAL_STRENGTH};
use crate::error::Result;
use crate::extract::{extract, Extraction};
use crate::lexical::tokenize;
use crate::memory::ChatHandle;
use crate::river::{recency_score, RiverEntry};
use crate::salience::{salience_score, SalienceEntry};
use crate::types::{ChatId, ConsolidationTrigger, MessageId};

const REPETITION_SHARE: f64 = 0.45;
const AFFECT_SHARE: f64 = 0.40;
const RECENCY_SHARE: f64 = 0.15;

/// Extra window entries containing a term beyond which repetition stops counting
const REPETITION_CAP: f64 = 3.0;

/// Recorded in `errors` when a run stopped early on request
pub const CANCELLED: &str = "cancelled";

/// Recorded in `errors` when a run was dropped before it could finish
pub const ABORTED: &str = "aborted";

/// Smallest change in a recomputed value worth writing back
const RECOMPUTE_EPSILON: f64 = 1e-9;

/// Audit record of one consolidation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationRun {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub trigger: ConsolidationTrigger,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub promoted: usize,
    pub pruned: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ConsolidationRun {
    pub fn start(chat_id: &str, trigger: ConsolidationTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            promoted: 0,
            pruned: 0,
            errors: Vec::new(),
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.errors.iter().any(|e| e == CANCELLED)
    }

    pub fn was_aborted(&self) -> bool {
        self.errors.iter().any(|e| e == ABORTED)
    }

    pub(crate) fn abort(&mut self) {
        self.errors.push(ABORTED.to_string());
        self.finish();
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Weighted promotion score from repetition, affect and recency, in `[0, 1]`
pub fn promotion_score(repetition: f64, affect_intensity: f64, recency: f64) -> f64 {
    REPETITION_SHARE * repetition.clamp(0.0, 1.0)
        + AFFECT_SHARE * affect_intensity.clamp(0.0, 1.0)
        + RECENCY_SHARE * recency.clamp(0.0, 1.0)
}

/// How much of each entry's vocabulary recurs elsewhere in the window
pub fn repetition_scores(window: &[RiverEntry]) -> HashMap<MessageId, f64> {
    let vocabularies: Vec<(&str, HashSet<String>)> = window
        .iter()
        .map(|e| (e.id.as_str(), tokenize(&e.content).into_iter().collect()))
        .collect();

    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for (_, terms) in &vocabularies {
        for term in terms {
            *document_frequency.entry(term.as_str()).or_insert(0) += 1;
        }
    }

    vocabularies
        .iter()
        .map(|(id, terms)| {
            let score = if terms.is_empty() {
                0.0
            } else {
                let sum: f64 = terms
                    .iter()
                    .map(|t| {
                        let extra = document_frequency.get(t.as_str()).copied().unwrap_or(1) - 1;
                        (extra as f64).min(REPETITION_CAP) / REPETITION_CAP
                    })
                    .sum();
                sum / terms.len() as f64
            };
            (id.to_string(), score)
        })
        .collect()
}

/// A planned promotion of one river entry
#[derive(Debug, Clone)]
pub struct Promotion {
    pub change: ChatChange,
    pub extraction: Extraction,
    pub score: f64,
}

/// Plan promoting `entry`, or `None` when it is muted, already encoded or
/// scores under the promotion threshold
pub fn plan_promotion(
    chat: &ChatMemory,
    entry: &RiverEntry,
    repetition: f64,
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> Option<Promotion> {
    if entry.muted || chat.is_muted(&entry.id) || chat.encoding.by_source(&entry.id).is_some() {
        return None;
    }

    let affect = chat.affect.max_intensity(&entry.id);
    let recency = recency_score(entry.timestamp, now, config.recency_half_life_hours);
    let score = promotion_score(repetition, affect, recency);
    if score < config.promotion_threshold {
        return None;
    }

    let encoding = EncodingEntry::new(&entry.chat_id, &entry.id, &entry.content, now);
    let mut change = ChatChange::default();
    match chat.salience.get(&entry.id) {
        Some(existing) if existing.encoding_id.is_none() => {
            change.salience.push(SalienceEntry {
                encoding_id: Some(encoding.id),
                updated_at: now,
                ..existing.clone()
            });
        }
        Some(_) => {}
        None if score >= config.salience_threshold => {
            change.salience.push(SalienceEntry::scored(
                &entry.chat_id,
                &entry.id,
                Some(encoding.id),
                &entry.content,
                salience_score(INITIAL_STRENGTH, affect, recency),
                now,
            ));
        }
        None => {}
    }
    change.encodings.push(encoding);

    Some(Promotion {
        change,
        extraction: extract(&entry.content),
        score,
    })
}

/// River entries past retention that nothing else keeps alive
pub fn plan_prune(chat: &ChatMemory, config: &MemoryConfig, now: DateTime<Utc>) -> ChatChange {
    let river_removed = chat
        .river
        .expired(now, config.river_retention_secs)
        .into_iter()
        .filter(|id| chat.encoding.by_source(id).is_none())
        .filter(|id| !chat.salience.get(id).is_some_and(|s| s.pinned))
        .collect();
    ChatChange {
        river_removed,
        ..Default::default()
    }
}

/// Refresh decayed strengths of entries not boosted since `since`, and the
/// scores of unpinned salience entries that depend on them
pub fn plan_decay(
    chat: &ChatMemory,
    since: DateTime<Utc>,
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> ChatChange {
    let mut change = ChatChange::default();
    let mut strengths: HashMap<Uuid, f64> = HashMap::new();

    for entry in chat.encoding.iter() {
        if entry.last_boosted_at >= since {
            strengths.insert(entry.id, entry.encoding_strength);
            continue;
        }
        let mut updated = entry.clone();
        updated.recompute(now, config);
        strengths.insert(entry.id, updated.encoding_strength);
        if (updated.encoding_strength - entry.encoding_strength).abs() > RECOMPUTE_EPSILON {
            change.encodings.push(updated);
        }
    }

    for entry in chat.salience.iter().filter(|e| !e.pinned) {
        let encoding = entry
            .encoding_id
            .and_then(|id| chat.encoding.get(&id))
            .or_else(|| chat.encoding.by_source(&entry.source_id));
        let Some(encoding) = encoding else {
            continue;
        };
        let strength = strengths
            .get(&encoding.id)
            .copied()
            .unwrap_or(encoding.encoding_strength);
        let timestamp = chat
            .river
            .get(&entry.source_id)
            .map_or(entry.created_at, |r| r.timestamp);
        let score = salience_score(
            strength,
            chat.affect.max_intensity(&entry.source_id),
            recency_score(timestamp, now, config.recency_half_life_hours),
        );
        if (score - entry.score).abs() > RECOMPUTE_EPSILON {
            change.salience.push(SalienceEntry {
                score,
                updated_at: now,
                ..entry.clone()
            });
        }
    }

    change
}

/// Drive one run to completion against a chat the caller holds exclusively
pub(crate) async fn execute(
    handle: &ChatHandle<'_>,
    run: &mut ConsolidationRun,
    config: &MemoryConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let now = run.started_at;
    info!(
        chat_id = %run.chat_id,
        run_id = %run.id,
        trigger = %run.trigger,
        "consolidation started"
    );

    let window = handle.read(|chat, _| {
        chat.river.eligible_for_consolidation(
            now,
            config.consolidation_grace_secs,
            config.river_retention_secs,
        )
    })?;
    let repetition = repetition_scores(&window);

    for entry in &window {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            run.errors.push(CANCELLED.to_string());
            break;
        }

        let rep = repetition.get(&entry.id).copied().unwrap_or(0.0);
        let plan = handle.read(|chat, _| plan_promotion(chat, entry, rep, config, now))?;
        let Some(promotion) = plan else {
            continue;
        };
        match handle.commit_promotion(promotion.change, &entry.id, &promotion.extraction, now) {
            Ok(()) => {
                run.promoted += 1;
                debug!(
                    chat_id = %run.chat_id,
                    message_id = %entry.id,
                    score = promotion.score,
                    "promoted"
                );
            }
            Err(e) => {
                warn!(
                    chat_id = %run.chat_id,
                    message_id = %entry.id,
                    error = %e,
                    "promotion failed"
                );
                run.errors.push(format!("{}: {}", entry.id, e));
            }
        }
    }

    if !run.was_cancelled() {
        tokio::task::yield_now().await;
        let prune = handle.read(|chat, _| plan_prune(chat, config, now))?;
        let pruned = prune.river_removed.len();
        match handle.commit(prune) {
            Ok(()) => run.pruned = pruned,
            Err(e) => {
                warn!(chat_id = %run.chat_id, error = %e, "prune failed");
                run.errors.push(format!("prune: {e}"));
            }
        }

        let decay = handle.read(|chat, _| plan_decay(chat, run.started_at, config, Utc::now()))?;
        if let Err(e) = handle.commit(decay) {
            warn!(chat_id = %run.chat_id, error = %e, "decay recompute failed");
            run.errors.push(format!("decay: {e}"));
        }
    }

    run.finish();
    info!(
        chat_id = %run.chat_id,
        run_id = %run.id,
        promoted = run.promoted,
        pruned = run.pruned,
        errors = run.errors.len(),
        "consolidation finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::AffectEntry;
    use crate::river::Role;
    use chrono::Duration;

    fn turn(id: &str, text: &str, age: Duration, now: DateTime<Utc>) -> RiverEntry {
        RiverEntry::new(id, "c1", Role::User, text, now - age)
    }

    fn chat_of(entries: &[RiverEntry]) -> ChatMemory {
        let mut chat = ChatMemory::default();
        chat.apply(&ChatChange {
            river: entries.to_vec(),
            ..Default::default()
        });
        chat
    }

    #[test]
    fn repetition_counts_terms_shared_across_the_window() {
        let now = Utc::now();
        let window = vec![
            turn("a", "kubernetes cluster upgrade", Duration::hours(3), now),
            turn("b", "cluster upgrade failed", Duration::hours(2), now),
            turn("c", "pizza tonight", Duration::hours(1), now),
        ];
        let scores = repetition_scores(&window);
        assert!(scores["a"] > 0.0);
        assert!(scores["b"] > 0.0);
        assert_eq!(scores["c"], 0.0);
    }

    #[test]
    fn affect_tagged_turns_promote_and_untagged_do_not() {
        let now = Utc::now();
        let entries = vec![
            turn("m1", "got the job offer", Duration::hours(1), now),
            turn("m2", "ordinary remark", Duration::hours(1), now),
        ];
        let mut chat = chat_of(&entries);
        chat.affect
            .append(AffectEntry::new("c1", "m1", "joy", 0.9, None).unwrap());
        let cfg = MemoryConfig::default();

        let promoted = plan_promotion(&chat, &entries[0], 0.0, &cfg, now).unwrap();
        assert_eq!(promoted.change.encodings.len(), 1);
        assert!(promoted.change.salience.is_empty());
        assert!(plan_promotion(&chat, &entries[1], 0.0, &cfg, now).is_none());
    }

    #[test]
    fn high_scores_also_create_salience_entries() {
        let now = Utc::now();
        let entries = vec![turn("m1", "We moved to Lisbon", Duration::minutes(5), now)];
        let mut chat = chat_of(&entries);
        chat.affect
            .append(AffectEntry::new("c1", "m1", "excitement", 1.0, None).unwrap());
        let cfg = MemoryConfig {
            salience_threshold: 0.5,
            ..MemoryConfig::default()
        };

        let promoted = plan_promotion(&chat, &entries[0], 0.0, &cfg, now).unwrap();
        assert_eq!(promoted.change.salience.len(), 1);
        assert_eq!(promoted.change.salience[0].encoding_id, Some(promoted.change.encodings[0].id));
        assert_eq!(promoted.extraction.entities[0].value, "lisbon");
    }

    #[test]
    fn encoded_and_muted_entries_are_skipped() {
        let now = Utc::now();
        let entries = vec![turn("m1", "anything", Duration::hours(1), now)];
        let cfg = MemoryConfig {
            promotion_threshold: 0.0,
            ..MemoryConfig::default()
        };

        let mut chat = chat_of(&entries);
        let first = plan_promotion(&chat, &entries[0], 0.0, &cfg, now).unwrap();
        chat.apply(&first.change);
        assert!(plan_promotion(&chat, &entries[0], 0.0, &cfg, now).is_none());

        let mut muted = chat_of(&entries);
        muted.muted.insert("m1".into());
        assert!(plan_promotion(&muted, &entries[0], 0.0, &cfg, now).is_none());
    }

    #[test]
    fn prune_spares_encoded_and_pinned_turns() {
        let now = Utc::now();
        let old = Duration::days(10);
        let entries = vec![
            turn("gone", "old chatter", old, now),
            turn("kept", "old but encoded", old, now),
            turn("pinned", "old but pinned", old, now),
            turn("fresh", "new chatter", Duration::hours(1), now),
        ];
        let mut chat = chat_of(&entries);
        chat.encoding
            .upsert(EncodingEntry::new("c1", "kept", "old but encoded", now));
        chat.salience
            .upsert(SalienceEntry::pinned("c1", "pinned", "old but pinned", now));

        let change = plan_prune(&chat, &MemoryConfig::default(), now);
        assert_eq!(change.river_removed, vec!["gone".to_string()]);
    }

    #[test]
    fn decay_skips_recent_boosts_and_pinned_scores() {
        let now = Utc::now();
        let cfg = MemoryConfig::default();
        let mut chat = ChatMemory::default();
        let stale = EncodingEntry::new("c1", "old", "stale", now - Duration::days(5));
        let fresh = EncodingEntry::new("c1", "new", "fresh", now);
        chat.salience.upsert(SalienceEntry::scored("c1", "old", Some(stale.id), "stale", 0.9, now));
        chat.salience.upsert(SalienceEntry::pinned("c1", "new", "fresh", now));
        chat.encoding.upsert(stale.clone());
        chat.encoding.upsert(fresh);

        let change = plan_decay(&chat, now - Duration::seconds(1), &cfg, now);
        assert_eq!(change.encodings.len(), 1);
        assert_eq!(change.encodings[0].id, stale.id);
        assert!(change.encodings[0].encoding_strength < INITIAL_STRENGTH);
        assert_eq!(change.salience.len(), 1);
        assert_eq!(change.salience[0].source_id, "old");
    }
}
