//! Inverted text index over river entries and encoded memories
//!
//! Matching is token overlap plus a whole-query substring bonus; the score
//! is a saturating term-frequency measure in `[0, 1]`. One index exists per
//! chat, owned by that chat's tier state.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::types::MessageId;

/// Bonus added when the whole query appears verbatim in the document
const SUBSTRING_BONUS: f64 = 0.25;

/// Characters of context returned around the first match
const SNIPPET_CHARS: usize = 160;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "from", "has", "have",
    "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of",
    "on", "or", "our", "she", "so", "that", "the", "their", "them", "then", "there", "they",
    "this", "to", "us", "was", "we", "were", "what", "when", "which", "who", "will", "with",
    "you", "your",
];

/// Split text into lowercase searchable terms
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Which tier a document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    River,
    Encoding,
}

/// Key of an indexed document: its tier plus the tier entry id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub kind: DocKind,
    pub id: String,
}

impl DocKey {
    pub fn river(id: impl Into<String>) -> Self {
        Self {
            kind: DocKind::River,
            id: id.into(),
        }
    }

    pub fn encoding(id: impl Into<String>) -> Self {
        Self {
            kind: DocKind::Encoding,
            id: id.into(),
        }
    }
}

/// One ranked lexical match
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LexicalHit {
    pub id: String,
    pub kind: DocKind,
    pub message_id: MessageId,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    message_id: MessageId,
    content: String,
    lowered: String,
    terms: HashMap<String, u32>,
}

impl IndexedDoc {
    fn new(message_id: &str, content: &str) -> Self {
        let mut terms: HashMap<String, u32> = HashMap::new();
        for term in tokenize(content) {
            *terms.entry(term).or_insert(0) += 1;
        }
        Self {
            message_id: message_id.to_string(),
            content: content.to_string(),
            lowered: content.to_lowercase(),
            terms,
        }
    }
}

/// Per-chat inverted index
#[derive(Debug, Default, Clone)]
pub struct LexicalIndex {
    docs: HashMap<DocKey, IndexedDoc>,
    postings: HashMap<String, HashSet<DocKey>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the searchable text of a document
    pub fn index(&mut self, key: DocKey, message_id: &str, content: &str) {
        self.remove(&key);

        let doc = IndexedDoc::new(message_id, content);
        for term in doc.terms.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(key.clone());
        }
        self.docs.insert(key, doc);
    }

    /// Drop a document; unknown keys are ignored
    pub fn remove(&mut self, key: &DocKey) {
        let Some(doc) = self.docs.remove(key) else {
            return;
        };
        for term in doc.terms.keys() {
            if let Some(set) = self.postings.get_mut(term) {
                set.remove(key);
                if set.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Rank documents of every kind against `query`
    pub fn search(&self, query: &str, limit: usize) -> Vec<LexicalHit> {
        let parsed = ParsedQuery::new(query);
        if parsed.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut candidates: HashSet<&DocKey> = HashSet::new();
        for term in &parsed.terms {
            if let Some(keys) = self.postings.get(term) {
                candidates.extend(keys.iter());
            }
        }
        if parsed.phrase.chars().count() >= 3 {
            for (key, doc) in &self.docs {
                if doc.lowered.contains(&parsed.phrase) {
                    candidates.insert(key);
                }
            }
        }

        let mut hits: Vec<(&DocKey, f64)> = candidates
            .into_iter()
            .filter_map(|key| {
                let doc = self.docs.get(key)?;
                let score = parsed.score(doc);
                (score > 0.0).then_some((key, score))
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        hits.truncate(limit);

        hits.into_iter()
            .filter_map(|(key, score)| {
                let doc = self.docs.get(key)?;
                Some(LexicalHit {
                    id: key.id.clone(),
                    kind: key.kind,
                    message_id: doc.message_id.clone(),
                    snippet: snippet(doc, &parsed),
                    score,
                })
            })
            .collect()
    }

    /// Score a single document against `query` (0.0 when absent or unmatched)
    pub fn score_doc(&self, key: &DocKey, query: &str) -> f64 {
        let parsed = ParsedQuery::new(query);
        self.docs
            .get(key)
            .map(|doc| parsed.score(doc))
            .unwrap_or(0.0)
    }

    /// Score arbitrary text that is not in the index
    pub fn score_text(query: &str, content: &str) -> f64 {
        let parsed = ParsedQuery::new(query);
        if parsed.is_empty() {
            return 0.0;
        }
        parsed.score(&IndexedDoc::new("", content))
    }

}

struct ParsedQuery {
    terms: Vec<String>,
    phrase: String,
}

impl ParsedQuery {
    fn new(query: &str) -> Self {
        let mut seen = HashSet::new();
        let terms = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self {
            terms,
            phrase: query.trim().to_lowercase(),
        }
    }

    fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.phrase.is_empty()
    }

    fn score(&self, doc: &IndexedDoc) -> f64 {
        let mut score = 0.0;
        if !self.terms.is_empty() {
            let sum: f64 = self
                .terms
                .iter()
                .filter_map(|t| doc.terms.get(t))
                .map(|&tf| tf as f64 / (tf as f64 + 1.0))
                .sum();
            score = sum / self.terms.len() as f64;
        }
        if !self.phrase.is_empty() && doc.lowered.contains(&self.phrase) {
            score += SUBSTRING_BONUS;
        }
        score.min(1.0)
    }
}

fn snippet(doc: &IndexedDoc, query: &ParsedQuery) -> String {
    let anchor = query
        .terms
        .iter()
        .filter_map(|t| doc.lowered.find(t.as_str()))
        .min()
        .or_else(|| doc.lowered.find(query.phrase.as_str()))
        .unwrap_or(0);

    // Byte offsets in `lowered` line up with `content` only for ASCII text.
    let start_byte = if doc.lowered.len() == doc.content.len() { anchor } else { 0 };
    let start_char = doc.content[..floor_char_boundary(&doc.content, start_byte)]
        .chars()
        .count()
        .saturating_sub(SNIPPET_CHARS / 4);
    doc.content
        .chars()
        .skip(start_char)
        .take(SNIPPET_CHARS)
        .collect()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(entries: &[(&str, &str)]) -> LexicalIndex {
        let mut index = LexicalIndex::new();
        for (id, content) in entries {
            index.index(DocKey::river(*id), id, content);
        }
        index
    }

    #[test]
    fn tokenize_drops_stopwords_and_short_tokens() {
        assert_eq!(tokenize("The cat is on a Mat!"), vec!["cat", "mat"]);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let index = index_with(&[("m1", "rust borrow checker")]);
        assert!(index.search("", 5).is_empty());
        assert!(index.search("   ", 5).is_empty());
    }

    #[test]
    fn more_overlap_ranks_higher() {
        let index = index_with(&[
            ("m1", "planning a trip to lisbon in spring"),
            ("m2", "lisbon trip budget and lisbon hotels"),
            ("m3", "unrelated note about groceries"),
        ]);
        let hits = index.search("lisbon trip", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "m2");
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));
    }

    #[test]
    fn reindex_replaces_terms_and_remove_forgets() {
        let mut index = index_with(&[("m1", "old words")]);
        index.index(DocKey::river("m1"), "m1", "fresh content");
        assert!(index.search("old", 5).is_empty());
        assert_eq!(index.search("fresh", 5).len(), 1);

        index.remove(&DocKey::river("m1"));
        assert!(index.search("fresh", 5).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn substring_match_without_token_overlap() {
        let index = index_with(&[("m1", "kubernetes cluster upgrade")]);
        let hits = index.search("netes clu", 5);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - SUBSTRING_BONUS).abs() < 1e-9);
    }

    #[test]
    fn hits_report_their_tier() {
        let mut index = index_with(&[("m1", "coffee habits")]);
        index.index(DocKey::encoding("e1"), "m1", "coffee habits");
        let mut kinds: Vec<DocKind> = index.search("coffee", 5).iter().map(|h| h.kind).collect();
        kinds.sort();
        assert_eq!(kinds, vec![DocKind::River, DocKind::Encoding]);
    }
}
