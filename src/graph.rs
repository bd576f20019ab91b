//! L5 Relation Graph: entities and typed relations extracted from conversation
//!
//! Entities are global and keyed by normalized value. Relations remember the
//! chat they were extracted in; a relation without a chat is visible from
//! every chat. Changes are planned first ([`RelationGraph::plan`]) so the
//! caller can persist them before [`RelationGraph::apply`] makes them visible.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extract::{normalize_entity, Extraction};
use crate::types::{ChatId, MessageId};

/// Weight added to a relation each time it is seen again
const RELATION_WEIGHT_STEP: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEntity {
    pub value: String,
    pub entity_type: String,
    /// Surface form of the first mention
    pub display: String,
    pub mention_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRelation {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    pub weight: f64,
    pub updated_at: DateTime<Utc>,
}

impl GraphRelation {
    fn key(&self) -> RelationKey {
        RelationKey {
            from: self.from_entity.clone(),
            to: self.to_entity.clone(),
            relation_type: self.relation_type.clone(),
            chat_id: self.chat_id.clone(),
        }
    }

    fn visible_from(&self, chat_id: Option<&str>) -> bool {
        match (chat_id, self.chat_id.as_deref()) {
            (None, _) | (_, None) => true,
            (Some(wanted), Some(own)) => wanted == own,
        }
    }

    fn other_end(&self, value: &str) -> &str {
        if self.from_entity == value {
            &self.to_entity
        } else {
            &self.from_entity
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RelationKey {
    from: String,
    to: String,
    relation_type: String,
    chat_id: Option<ChatId>,
}

/// A message that mentioned an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub entity: String,
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Records a graph change creates or overwrites, in their final state
#[derive(Debug, Clone, Default)]
pub struct GraphUpdate {
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
    pub mentions: Vec<Mention>,
}

impl GraphUpdate {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.mentions.is_empty()
    }
}

/// An entity reached by traversal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    pub value: String,
    pub entity_type: String,
    pub hops: usize,
    /// Relation type of the edge it was first reached through
    pub relation_type: String,
    pub weight: f64,
}

#[derive(Debug, Default, Clone)]
pub struct RelationGraph {
    entities: HashMap<String, GraphEntity>,
    relations: HashMap<RelationKey, GraphRelation>,
    adjacency: HashMap<String, Vec<RelationKey>>,
    mentions: HashMap<String, BTreeSet<(ChatId, MessageId)>>,
    recorded: HashSet<(ChatId, MessageId)>,
}

impl RelationGraph {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Entities mentioned in a chat and relations extracted from it
    pub fn chat_counts(&self, chat_id: &str) -> (usize, usize) {
        let entities = self
            .mentions
            .values()
            .filter(|set| set.iter().any(|(chat, _)| chat == chat_id))
            .count();
        let relations = self
            .relations
            .values()
            .filter(|r| r.chat_id.as_deref() == Some(chat_id))
            .count();
        (entities, relations)
    }

    /// Whether a message's extraction was already merged
    pub fn has_recorded(&self, chat_id: &str, message_id: &str) -> bool {
        self.recorded
            .contains(&(chat_id.to_string(), message_id.to_string()))
    }

    /// Compute the records merging `extraction` for one message would produce.
    ///
    /// Returns an empty update when the message was already merged.
    pub fn plan(
        &self,
        chat_id: &str,
        message_id: &str,
        extraction: &Extraction,
        now: DateTime<Utc>,
    ) -> GraphUpdate {
        let mut update = GraphUpdate::default();
        if extraction.is_empty() || self.has_recorded(chat_id, message_id) {
            return update;
        }

        for mention in &extraction.entities {
            let entity = match self.entities.get(&mention.value) {
                Some(existing) => GraphEntity {
                    mention_count: existing.mention_count + 1,
                    last_seen: now,
                    ..existing.clone()
                },
                None => GraphEntity {
                    value: mention.value.clone(),
                    entity_type: mention.entity_type.to_string(),
                    display: mention.surface.clone(),
                    mention_count: 1,
                    first_seen: now,
                    last_seen: now,
                },
            };
            update.entities.push(entity);
            update.mentions.push(Mention {
                entity: mention.value.clone(),
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            });
        }

        for found in &extraction.relations {
            let key = RelationKey {
                from: found.from.clone(),
                to: found.to.clone(),
                relation_type: found.relation_type.to_string(),
                chat_id: Some(chat_id.to_string()),
            };
            let weight = self
                .relations
                .get(&key)
                .map_or(0.0, |existing| existing.weight)
                + RELATION_WEIGHT_STEP;
            update.relations.push(GraphRelation {
                from_entity: key.from,
                to_entity: key.to,
                relation_type: key.relation_type,
                chat_id: key.chat_id,
                weight,
                updated_at: now,
            });
        }

        update
    }

    /// Make planned (or hydrated) records visible
    pub fn apply(&mut self, update: GraphUpdate) {
        for entity in update.entities {
            self.entities.insert(entity.value.clone(), entity);
        }
        for relation in update.relations {
            let key = relation.key();
            if !self.relations.contains_key(&key) {
                for end in [&key.from, &key.to] {
                    self.adjacency.entry(end.clone()).or_default().push(key.clone());
                }
            }
            self.relations.insert(key, relation);
        }
        for mention in update.mentions {
            self.recorded
                .insert((mention.chat_id.clone(), mention.message_id.clone()));
            self.mentions
                .entry(mention.entity)
                .or_default()
                .insert((mention.chat_id, mention.message_id));
        }
    }

    /// Entities within `hops` of `value`, nearest first
    pub fn related(
        &self,
        value: &str,
        chat_id: Option<&str>,
        hops: usize,
    ) -> Result<Vec<RelatedEntity>> {
        let start = normalize_entity(value);
        if !self.entities.contains_key(&start) {
            return Err(Error::not_found(format!("entity {value:?}")));
        }
        Ok(self.walk(&start, chat_id, hops))
    }

    /// Messages in `chat_id` mentioning any known entity named in `values`
    /// or an entity within `hops` of one, with the hop distance of the
    /// closest mention.
    pub fn mentioned_messages(
        &self,
        values: &[String],
        chat_id: &str,
        hops: usize,
    ) -> Vec<(MessageId, usize)> {
        let mut distance: HashMap<&str, usize> = HashMap::new();
        for value in values {
            if !self.entities.contains_key(value) {
                continue;
            }
            distance.insert(value.as_str(), 0);
            for related in self.walk(value, Some(chat_id), hops) {
                let Some((key, _)) = self.entities.get_key_value(&related.value) else {
                    continue;
                };
                let best = distance.entry(key.as_str()).or_insert(related.hops);
                *best = (*best).min(related.hops);
            }
        }

        let mut messages: HashMap<MessageId, usize> = HashMap::new();
        for (entity, hop) in distance {
            let Some(set) = self.mentions.get(entity) else {
                continue;
            };
            for (chat, message) in set {
                if chat != chat_id {
                    continue;
                }
                let best = messages.entry(message.clone()).or_insert(hop);
                *best = (*best).min(hop);
            }
        }

        let mut out: Vec<(MessageId, usize)> = messages.into_iter().collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn walk(&self, start: &str, chat_id: Option<&str>, hops: usize) -> Vec<RelatedEntity> {
        let mut seen: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(start, 0)]);
        let mut out = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= hops {
                continue;
            }
            let Some(edges) = self.adjacency.get(node) else {
                continue;
            };
            let mut visible: Vec<&GraphRelation> = edges
                .iter()
                .filter_map(|key| self.relations.get(key))
                .filter(|r| r.visible_from(chat_id))
                .collect();
            visible.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| a.other_end(node).cmp(b.other_end(node)))
            });

            for relation in visible {
                let next = relation.other_end(node);
                if !seen.insert(next) {
                    continue;
                }
                let entity_type = self
                    .entities
                    .get(next)
                    .map(|e| e.entity_type.clone())
                    .unwrap_or_default();
                out.push(RelatedEntity {
                    value: next.to_string(),
                    entity_type,
                    hops: depth + 1,
                    relation_type: relation.relation_type.clone(),
                    weight: relation.weight,
                });
                queue.push_back((next, depth + 1));
            }
        }

        out
    }
}
