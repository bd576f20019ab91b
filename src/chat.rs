//! Per-chat tier state and the change sets that move it forward
//!
//! Every mutation is first expressed as a [`ChatChange`] holding the final
//! state of each record it touches. The store persists the change in one
//! transaction and only then calls [`ChatMemory::apply`], so readers never
//! observe half of a change.

use std::collections::HashSet;

use serde::Serialize;

use crate::affect::{AffectEntry, AffectLedger};
use crate::consolidation::ConsolidationRun;
use crate::encoding::{EncodingEntry, EncodingStore};
use crate::graph::GraphUpdate;
use crate::lexical::{DocKey, LexicalIndex};
use crate::river::{River, RiverEntry};
use crate::salience::{SalienceEntry, SalienceIndex};
use crate::types::MessageId;

/// Everything one chat remembers
#[derive(Debug, Default, Clone)]
pub struct ChatMemory {
    pub river: River,
    pub affect: AffectLedger,
    pub encoding: EncodingStore,
    pub salience: SalienceIndex,
    pub lexical: LexicalIndex,
    /// Messages muted in this chat, whether or not a tier holds them
    pub muted: HashSet<MessageId>,
    /// Finalized consolidation runs, oldest first
    pub runs: Vec<ConsolidationRun>,
}

/// Records created or overwritten by one atomic change, in their final state
#[derive(Debug, Default, Clone)]
pub struct ChatChange {
    pub river: Vec<RiverEntry>,
    pub river_removed: Vec<MessageId>,
    pub affect: Vec<AffectEntry>,
    pub encodings: Vec<EncodingEntry>,
    pub salience: Vec<SalienceEntry>,
    pub muted: Vec<MessageId>,
    pub graph: GraphUpdate,
}

impl ChatChange {
    pub fn is_empty(&self) -> bool {
        self.river.is_empty()
            && self.river_removed.is_empty()
            && self.affect.is_empty()
            && self.encodings.is_empty()
            && self.salience.is_empty()
            && self.muted.is_empty()
            && self.graph.is_empty()
    }
}

/// Per-tier counts for one chat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub river: usize,
    pub river_muted: usize,
    pub affect: usize,
    pub encoding: usize,
    pub encoding_suppressed: usize,
    pub salience: usize,
    pub pinned: usize,
    pub graph_entities: usize,
    pub graph_relations: usize,
    pub consolidation_runs: usize,
}

impl ChatMemory {
    pub fn is_muted(&self, message_id: &str) -> bool {
        self.muted.contains(message_id)
    }

    /// Apply an already-persisted change; the graph part is applied by the owner of the graph
    pub fn apply(&mut self, change: &ChatChange) {
        for id in &change.muted {
            self.muted.insert(id.clone());
        }

        for entry in &change.river {
            let key = DocKey::river(entry.id.as_str());
            if entry.muted || self.is_muted(&entry.id) {
                self.lexical.remove(&key);
            } else {
                self.lexical.index(key, &entry.id, &entry.content);
            }
            self.river.insert(entry.clone());
        }
        for id in &change.river_removed {
            self.lexical.remove(&DocKey::river(id.as_str()));
            self.river.remove(id);
        }

        for entry in &change.affect {
            self.affect.append(entry.clone());
        }

        for entry in &change.encodings {
            let key = DocKey::encoding(entry.id.to_string());
            if entry.suppressed || self.is_muted(&entry.source_message_id) {
                self.lexical.remove(&key);
            } else {
                self.lexical.index(key, &entry.source_message_id, &entry.content);
            }
            if let Some(previous) = self.encoding.by_source(&entry.source_message_id) {
                if previous.id != entry.id {
                    self.lexical.remove(&DocKey::encoding(previous.id.to_string()));
                }
            }
            self.encoding.upsert(entry.clone());
        }

        for entry in &change.salience {
            self.salience.upsert(entry.clone());
        }
    }

    pub fn stats(&self, graph_counts: (usize, usize)) -> MemoryStats {
        let river = self.river.stats();
        MemoryStats {
            river: river.total,
            river_muted: river.muted,
            affect: self.affect.len(),
            encoding: self.encoding.len(),
            encoding_suppressed: self.encoding.suppressed_count(),
            salience: self.salience.len(),
            pinned: self.salience.pinned_count(),
            graph_entities: graph_counts.0,
            graph_relations: graph_counts.1,
            consolidation_runs: self.runs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::river::Role;
    use chrono::Utc;

    #[test]
    fn apply_keeps_lexical_index_in_step_with_tiers() {
        let now = Utc::now();
        let mut chat = ChatMemory::default();
        let entry = RiverEntry::new("m1", "c1", Role::User, "tea ceremony", now);
        chat.apply(&ChatChange {
            river: vec![entry.clone()],
            ..Default::default()
        });
        assert_eq!(chat.lexical.search("tea", 5).len(), 1);

        let muted = RiverEntry {
            muted: true,
            ..entry
        };
        chat.apply(&ChatChange {
            river: vec![muted],
            muted: vec!["m1".into()],
            ..Default::default()
        });
        assert!(chat.lexical.search("tea", 5).is_empty());
        assert!(chat.is_muted("m1"));
        assert_eq!(chat.stats((0, 0)).river_muted, 1);
    }

    #[test]
    fn later_records_for_muted_messages_stay_hidden() {
        let now = Utc::now();
        let mut chat = ChatMemory::default();
        chat.apply(&ChatChange {
            muted: vec!["m1".into()],
            ..Default::default()
        });

        let encoded = EncodingEntry::new("c1", "m1", "tea ceremony", now);
        chat.apply(&ChatChange {
            encodings: vec![encoded],
            ..Default::default()
        });
        assert!(chat.lexical.is_empty());
        assert_eq!(chat.encoding.len(), 1);
    }

    #[test]
    fn removed_river_entries_leave_the_index() {
        let now = Utc::now();
        let mut chat = ChatMemory::default();
        let entry = RiverEntry::new("m1", "c1", Role::User, "tea ceremony", now);
        chat.apply(&ChatChange {
            river: vec![entry],
            ..Default::default()
        });
        chat.apply(&ChatChange {
            river_removed: vec!["m1".into()],
            ..Default::default()
        });
        assert!(chat.river.is_empty());
        assert!(chat.lexical.is_empty());
    }
}
