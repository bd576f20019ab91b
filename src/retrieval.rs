//! Ensemble retrieval across the memory tiers
//!
//! Each active tier proposes candidates, every candidate gets one fused score
//! from its lexical, salience and recency signals, and representations of the
//! same message collapse onto the highest tier before the final sort.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ChatMemory;
use crate::config::MemoryConfig;
use crate::encoding::normalized_strength;
use crate::error::{Error, Result};
use crate::extract::{extract, normalize_entity};
use crate::graph::RelationGraph;
use crate::lexical::{tokenize, DocKey, LexicalIndex};
use crate::river::recency_score;
use crate::types::{normalize_tag, ChatId, Layer, MessageId, TemporalBias};

/// A retrieval request as it arrives from callers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalQuery {
    pub text: String,
    pub chat_id: ChatId,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub layers: Option<Vec<String>>,
    #[serde(default)]
    pub affect_boost: Option<Vec<String>>,
    #[serde(default)]
    pub temporal_bias: TemporalBias,
}

impl RetrievalQuery {
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn layers<S: Into<String>>(mut self, layers: impl IntoIterator<Item = S>) -> Self {
        self.layers = Some(layers.into_iter().map(Into::into).collect());
        self
    }

    pub fn affect_boost<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.affect_boost = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn temporal_bias(mut self, bias: TemporalBias) -> Self {
        self.temporal_bias = bias;
        self
    }

    /// Validate and fill in defaults
    pub fn resolve(&self, config: &MemoryConfig) -> Result<ResolvedQuery> {
        if self.chat_id.trim().is_empty() {
            return Err(Error::validation("chatId is required"));
        }
        let top_k = self.top_k.unwrap_or(config.default_top_k);
        if top_k == 0 {
            return Err(Error::validation("topK must be >= 1"));
        }
        let layers = match &self.layers {
            Some(names) => Layer::parse_list(names)?,
            None => Layer::ALL.to_vec(),
        };
        let affect_tags = self
            .affect_boost
            .iter()
            .flatten()
            .map(|t| normalize_tag(t))
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedQuery {
            text: self.text.trim().to_string(),
            chat_id: self.chat_id.clone(),
            top_k,
            layers,
            affect_tags,
            temporal_bias: self.temporal_bias,
        })
    }
}

/// A validated query
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub text: String,
    pub chat_id: ChatId,
    pub top_k: usize,
    pub layers: Vec<Layer>,
    pub affect_tags: Vec<String>,
    pub temporal_bias: TemporalBias,
}

impl ResolvedQuery {
    fn uses(&self, layer: Layer) -> bool {
        self.layers.contains(&layer)
    }
}

/// Per-candidate signal breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signals {
    pub lexical: f64,
    pub salience: f64,
    pub recency: f64,
    /// Intensity of the matched `affectBoost` tag, when one applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affect: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCandidate {
    pub message_id: MessageId,
    pub layer: Layer,
    pub content: String,
    pub score: f64,
    pub signals: Signals,
    pub timestamp: DateTime<Utc>,
    pub pinned: bool,
}

/// Ranked memories for one query
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub memories: Vec<RankedCandidate>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Format the memories for injection into a prompt
    pub fn format_for_prompt(&self) -> String {
        if self.memories.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Relevant Memories\n");
        for memory in &self.memories {
            let marker = if memory.pinned { " pinned" } else { "" };
            out.push_str(&format!("- [{}{}] {}\n", memory.layer, marker, memory.content));
        }
        out
    }
}

struct Weights {
    lexical: f64,
    salience: f64,
    recency: f64,
    affect: f64,
}

impl Weights {
    fn for_bias(config: &MemoryConfig, bias: TemporalBias) -> Self {
        let mut weights = Self {
            lexical: config.lexical_weight,
            salience: config.salience_weight,
            recency: config.recency_weight,
            affect: config.affect_weight,
        };
        match bias {
            TemporalBias::Recent => weights.recency *= config.temporal_bias_factor,
            TemporalBias::Salient => weights.salience *= config.temporal_bias_factor,
            TemporalBias::Balanced => {}
        }
        weights
    }

    fn fuse(&self, signals: &Signals) -> f64 {
        self.lexical * signals.lexical
            + self.salience * signals.salience
            + self.recency * signals.recency
    }
}

struct Candidate {
    tier: u8,
    ranked: RankedCandidate,
}

// Lower wins when one message appears in several tiers.
const TIER_PINNED: u8 = 0;
const TIER_SALIENCE: u8 = 1;
const TIER_ENCODING: u8 = 2;
const TIER_RIVER: u8 = 3;
const TIER_GRAPH: u8 = 4;

/// Rank one chat's memories against a resolved query
pub fn rank(
    query: &ResolvedQuery,
    chat: &ChatMemory,
    graph: &RelationGraph,
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> Vec<RankedCandidate> {
    let ranker = Ranker {
        query,
        chat,
        config,
        now,
        weights: Weights::for_bias(config, query.temporal_bias),
        limit: query.top_k.saturating_mul(config.overfetch_factor).max(1),
        has_text: !query.text.is_empty(),
    };

    let mut candidates = Vec::new();
    if query.uses(Layer::L1) {
        candidates.extend(ranker.river());
    }
    if query.uses(Layer::L3) {
        candidates.extend(ranker.encodings());
    }
    if query.uses(Layer::L4) {
        candidates.extend(ranker.salience());
    }
    if query.uses(Layer::L5) {
        candidates.extend(ranker.graph(graph));
    }

    let mut ranked = dedup(candidates);
    ranked.sort_by(ranking_order);
    ranked.truncate(query.top_k);
    ranked
}

/// Score descending, then newest first, then message id
fn ranking_order(a: &RankedCandidate, b: &RankedCandidate) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.message_id.cmp(&b.message_id))
}

struct Ranker<'a> {
    query: &'a ResolvedQuery,
    chat: &'a ChatMemory,
    config: &'a MemoryConfig,
    now: DateTime<Utc>,
    weights: Weights,
    limit: usize,
    has_text: bool,
}

impl Ranker<'_> {
    fn affect_of(&self, message_id: &str) -> f64 {
        self.chat.affect.max_intensity(message_id)
    }

    fn recency(&self, timestamp: DateTime<Utc>) -> f64 {
        recency_score(timestamp, self.now, self.config.recency_half_life_hours)
    }

    /// Timestamp of the underlying turn when the river still holds it
    fn source_time(&self, message_id: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.chat
            .river
            .get(message_id)
            .map_or(fallback, |entry| entry.timestamp)
    }

    #[allow(clippy::too_many_arguments)]
    fn candidate(
        &self,
        tier: u8,
        layer: Layer,
        message_id: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        pinned: bool,
        mut signals: Signals,
    ) -> Candidate {
        let mut score = self.weights.fuse(&signals);
        if !self.query.affect_tags.is_empty() {
            if let Some(intensity) = self
                .chat
                .affect
                .matching_intensity(message_id, &self.query.affect_tags)
            {
                score *= 1.0 + self.weights.affect * intensity;
                signals.affect = Some(intensity);
            }
        }
        Candidate {
            tier,
            ranked: RankedCandidate {
                message_id: message_id.to_string(),
                layer,
                content: content.to_string(),
                score,
                signals,
                timestamp,
                pinned,
            },
        }
    }

    fn keep_best(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.sort_by(|a, b| ranking_order(&a.ranked, &b.ranked));
        candidates.truncate(self.limit);
        candidates
    }

    fn river(&self) -> Vec<Candidate> {
        let found = self
            .chat
            .river
            .recent_unmuted(self.config.river_window)
            .into_iter()
            .filter(|entry| !self.chat.is_muted(&entry.id))
            .filter_map(|entry| {
                let lexical = self
                    .chat
                    .lexical
                    .score_doc(&DocKey::river(entry.id.as_str()), &self.query.text);
                if self.has_text && lexical <= 0.0 {
                    return None;
                }
                let signals = Signals {
                    lexical,
                    salience: self.affect_of(&entry.id),
                    recency: self.recency(entry.timestamp),
                    affect: None,
                };
                Some(self.candidate(
                    TIER_RIVER,
                    Layer::L1,
                    &entry.id,
                    &entry.content,
                    entry.timestamp,
                    false,
                    signals,
                ))
            })
            .collect();
        self.keep_best(found)
    }

    fn encodings(&self) -> Vec<Candidate> {
        if !self.has_text {
            return Vec::new();
        }
        let found = self
            .chat
            .encoding
            .iter()
            .filter(|entry| !entry.suppressed && !self.chat.is_muted(&entry.source_message_id))
            .filter_map(|entry| {
                let lexical = self
                    .chat
                    .lexical
                    .score_doc(&DocKey::encoding(entry.id.to_string()), &self.query.text);
                if lexical <= 0.0 {
                    return None;
                }
                let strength = normalized_strength(entry.strength_at(self.now, self.config));
                let timestamp = self.source_time(&entry.source_message_id, entry.created_at);
                let signals = Signals {
                    lexical,
                    salience: strength.max(self.affect_of(&entry.source_message_id)),
                    recency: self.recency(timestamp),
                    affect: None,
                };
                Some(self.candidate(
                    TIER_ENCODING,
                    Layer::L3,
                    &entry.source_message_id,
                    &entry.content,
                    timestamp,
                    false,
                    signals,
                ))
            })
            .collect();
        self.keep_best(found)
    }

    fn salience(&self) -> Vec<Candidate> {
        let mut pinned = Vec::new();
        let mut scored = Vec::new();
        for entry in self.chat.salience.ranked() {
            if self.chat.is_muted(&entry.source_id) {
                continue;
            }
            let timestamp = self.source_time(&entry.source_id, entry.created_at);
            let signals = Signals {
                lexical: LexicalIndex::score_text(&self.query.text, &entry.content),
                salience: entry.ranking_score(),
                recency: self.recency(timestamp),
                affect: None,
            };
            let (tier, bucket) = if entry.pinned {
                (TIER_PINNED, &mut pinned)
            } else {
                (TIER_SALIENCE, &mut scored)
            };
            bucket.push(self.candidate(
                tier,
                Layer::L4,
                &entry.source_id,
                &entry.content,
                timestamp,
                entry.pinned,
                signals,
            ));
        }
        // Pinned entries are always candidates; scored ones compete for the budget.
        pinned.extend(self.keep_best(scored));
        pinned
    }

    fn graph(&self, graph: &RelationGraph) -> Vec<Candidate> {
        if !self.has_text {
            return Vec::new();
        }
        let values = query_entities(&self.query.text);
        let found = graph
            .mentioned_messages(&values, &self.query.chat_id, self.config.graph_hop_limit)
            .into_iter()
            .filter(|(message_id, _)| !self.chat.is_muted(message_id))
            .filter_map(|(message_id, hops)| {
                let (content, timestamp) = self.visible_content(&message_id)?;
                let signals = Signals {
                    lexical: LexicalIndex::score_text(&self.query.text, &content),
                    salience: 1.0 / (1.0 + hops as f64),
                    recency: self.recency(timestamp),
                    affect: None,
                };
                Some(self.candidate(
                    TIER_GRAPH,
                    Layer::L5,
                    &message_id,
                    &content,
                    timestamp,
                    false,
                    signals,
                ))
            })
            .collect();
        self.keep_best(found)
    }

    /// Unsuppressed content for a message from whichever tier still holds it
    fn visible_content(&self, message_id: &str) -> Option<(String, DateTime<Utc>)> {
        if let Some(entry) = self.chat.river.get(message_id).filter(|e| !e.muted) {
            return Some((entry.content.clone(), entry.timestamp));
        }
        if let Some(entry) = self.chat.encoding.by_source(message_id).filter(|e| !e.suppressed) {
            return Some((entry.content.clone(), entry.created_at));
        }
        self.chat
            .salience
            .get(message_id)
            .filter(|e| !e.suppressed)
            .map(|e| (e.content.clone(), e.created_at))
    }
}

/// Entity keys a query may refer to: extracted mentions plus single terms
/// and adjacent term pairs, so lowercase queries still resolve.
pub fn query_entities(text: &str) -> Vec<String> {
    let mut values: Vec<String> = extract(text).entities.into_iter().map(|e| e.value).collect();
    let terms = tokenize(text);
    let pairs = terms.windows(2).map(|w| normalize_entity(&w.join(" ")));
    for value in terms.iter().cloned().chain(pairs) {
        if !values.contains(&value) {
            values.push(value);
        }
    }
    values
}

fn dedup(candidates: Vec<Candidate>) -> Vec<RankedCandidate> {
    let mut best: HashMap<MessageId, (Candidate, f64)> = HashMap::new();
    for candidate in candidates {
        let score = candidate.ranked.score;
        match best.get_mut(&candidate.ranked.message_id) {
            Some((kept, max_score)) => {
                *max_score = max_score.max(score);
                if candidate.tier < kept.tier {
                    *kept = candidate;
                }
            }
            None => {
                best.insert(candidate.ranked.message_id.clone(), (candidate, score));
            }
        }
    }
    best.into_values()
        .map(|(candidate, score)| RankedCandidate {
            score,
            ..candidate.ranked
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::AffectEntry;
    use crate::encoding::EncodingEntry;
    use crate::river::{RiverEntry, Role};
    use crate::salience::SalienceEntry;
    use chrono::Duration;

    fn chat_with(turns: &[(&str, &str, i64)], now: DateTime<Utc>) -> ChatMemory {
        let mut chat = ChatMemory::default();
        for (id, text, hours_ago) in turns {
            chat.river.insert(RiverEntry::new(
                *id,
                "c1",
                Role::User,
                *text,
                now - Duration::hours(*hours_ago),
            ));
            chat.lexical.index(DocKey::river(*id), id, text);
        }
        chat
    }

    fn resolve(query: RetrievalQuery) -> ResolvedQuery {
        query.resolve(&MemoryConfig::default()).unwrap()
    }

    fn ids(ranked: &[RankedCandidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.message_id.as_str()).collect()
    }

    #[test]
    fn unknown_layers_and_bad_tags_are_rejected() {
        let cfg = MemoryConfig::default();
        let bad_layer = RetrievalQuery::new("c1", "x").layers(["L7"]);
        assert!(bad_layer.resolve(&cfg).is_err());
        let bad_tag = RetrievalQuery::new("c1", "x").affect_boost(["not a tag"]);
        assert!(bad_tag.resolve(&cfg).is_err());
        assert_eq!(RetrievalQuery::new("c1", "x").resolve(&cfg).unwrap().top_k, 10);
    }

    #[test]
    fn salient_bias_lifts_affect_tagged_match_over_newer_one() {
        let now = Utc::now();
        let mut chat = chat_with(
            &[
                ("m1", "the deploy pipeline broke again", 10),
                ("m2", "lunch plans for friday", 8),
                ("m3", "weather looks fine", 6),
                ("m4", "deploy pipeline is green now", 2),
                ("m5", "random chatter", 1),
            ],
            now,
        );
        chat.affect
            .append(AffectEntry::new("c1", "m1", "frustration", 0.9, None).unwrap());

        let query = resolve(
            RetrievalQuery::new("c1", "deploy pipeline").temporal_bias(TemporalBias::Salient),
        );
        let ranked = rank(&query, &chat, &RelationGraph::default(), &MemoryConfig::default(), now);
        assert_eq!(ids(&ranked), vec!["m1", "m4"]);
    }

    #[test]
    fn affect_boost_multiplies_matching_candidates() {
        let now = Utc::now();
        let mut chat = chat_with(&[("m1", "coffee order", 1), ("m2", "coffee beans", 1)], now);
        chat.affect
            .append(AffectEntry::new("c1", "m2", "joy", 1.0, None).unwrap());

        let query = resolve(RetrievalQuery::new("c1", "coffee").affect_boost(["joy"]));
        let ranked = rank(&query, &chat, &RelationGraph::default(), &MemoryConfig::default(), now);
        assert_eq!(ranked[0].message_id, "m2");
        assert_eq!(ranked[0].signals.affect, Some(1.0));
        assert!(ranked[0].score > ranked[1].score * 1.4);
    }

    #[test]
    fn affect_boost_applies_under_a_river_only_filter() {
        let now = Utc::now();
        let mut chat = chat_with(&[("a", "coffee order", 1), ("b", "coffee beans", 1)], now);
        chat.affect
            .append(AffectEntry::new("c1", "b", "joy", 1.0, None).unwrap());
        let cfg = MemoryConfig::default();
        let graph = RelationGraph::default();

        let all = rank(
            &resolve(RetrievalQuery::new("c1", "coffee").affect_boost(["joy"])),
            &chat,
            &graph,
            &cfg,
            now,
        );
        let river_only = rank(
            &resolve(
                RetrievalQuery::new("c1", "coffee")
                    .layers(["L1"])
                    .affect_boost(["joy"]),
            ),
            &chat,
            &graph,
            &cfg,
            now,
        );
        assert_eq!(ids(&river_only), vec!["b", "a"]);
        assert_eq!(river_only[0].signals.affect, Some(1.0));
        assert!(river_only[0].score > river_only[1].score);
        assert_eq!(river_only[0].score, all[0].score);
    }

    #[test]
    fn overfetch_truncation_breaks_ties_by_recency_then_id() {
        let now = Utc::now();
        let turns: Vec<(String, String)> = (0..12)
            .map(|i| (format!("m{i:02}"), "same words here".to_string()))
            .collect();
        let mut chat = ChatMemory::default();
        for (id, text) in &turns {
            chat.river
                .insert(RiverEntry::new(id.as_str(), "c1", Role::User, text.as_str(), now));
            chat.lexical.index(DocKey::river(id.as_str()), id, text);
        }
        let cfg = MemoryConfig {
            overfetch_factor: 1,
            ..MemoryConfig::default()
        };
        let query = RetrievalQuery::new("c1", "same words")
            .layers(["L1"])
            .top_k(3)
            .resolve(&cfg)
            .unwrap();

        for _ in 0..5 {
            let ranked = rank(&query, &chat, &RelationGraph::default(), &cfg, now);
            assert_eq!(ids(&ranked), vec!["m00", "m01", "m02"]);
        }
    }

    #[test]
    fn duplicates_collapse_onto_highest_tier_with_best_score() {
        let now = Utc::now();
        let mut chat = chat_with(&[("m1", "rust borrow checker notes", 1)], now);
        let encoded = EncodingEntry::new("c1", "m1", "rust borrow checker notes", now);
        chat.lexical
            .index(DocKey::encoding(encoded.id.to_string()), "m1", &encoded.content);
        chat.encoding.upsert(encoded);
        chat.salience
            .upsert(SalienceEntry::pinned("c1", "m1", "pinned: borrow checker", now));

        let query = resolve(RetrievalQuery::new("c1", "borrow checker"));
        let ranked = rank(&query, &chat, &RelationGraph::default(), &MemoryConfig::default(), now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].layer, Layer::L4);
        assert!(ranked[0].pinned);
    }

    #[test]
    fn muted_messages_never_surface() {
        let now = Utc::now();
        let mut chat = chat_with(&[("m1", "secret plan", 1), ("m2", "public plan", 1)], now);
        chat.salience
            .upsert(SalienceEntry::pinned("c1", "m1", "secret plan", now));
        chat.muted.insert("m1".to_string());
        let hidden = RiverEntry {
            muted: true,
            ..chat.river.get("m1").unwrap().clone()
        };
        chat.river.insert(hidden);

        let query = resolve(RetrievalQuery::new("c1", "plan"));
        let ranked = rank(&query, &chat, &RelationGraph::default(), &MemoryConfig::default(), now);
        assert_eq!(ids(&ranked), vec!["m2"]);
    }

    #[test]
    fn layer_filter_restricts_sources() {
        let now = Utc::now();
        let mut chat = chat_with(&[("m1", "alpha beta", 1)], now);
        chat.salience
            .upsert(SalienceEntry::pinned("c1", "p1", "pinned alpha", now));

        let query = resolve(RetrievalQuery::new("c1", "alpha").layers(["L4"]));
        let ranked = rank(&query, &chat, &RelationGraph::default(), &MemoryConfig::default(), now);
        assert_eq!(ids(&ranked), vec!["p1"]);
    }

    #[test]
    fn graph_layer_reaches_related_messages() {
        let now = Utc::now();
        let chat = chat_with(
            &[("m1", "Alice works at Acme", 30), ("m2", "unrelated words", 1)],
            now,
        );
        let mut graph = RelationGraph::default();
        let update = graph.plan("c1", "m1", &extract("Alice works at Acme"), now);
        graph.apply(update);

        let query = resolve(RetrievalQuery::new("c1", "what about acme?").layers(["L5"]));
        let ranked = rank(&query, &chat, &graph, &MemoryConfig::default(), now);
        assert_eq!(ids(&ranked), vec!["m1"]);
        assert_eq!(ranked[0].layer, Layer::L5);
    }

    #[test]
    fn prompt_format_tags_layers() {
        let result = RetrievalResult {
            memories: vec![RankedCandidate {
                message_id: "m1".into(),
                layer: Layer::L4,
                content: "likes tea".into(),
                score: 1.0,
                signals: Signals::default(),
                timestamp: Utc::now(),
                pinned: true,
            }],
        };
        assert_eq!(result.format_for_prompt(), "## Relevant Memories\n- [L4 pinned] likes tea\n");
        assert_eq!(RetrievalResult::default().format_for_prompt(), "");
    }
}
