//! Surface-pattern entity and relation extraction
//!
//! Deterministic heuristics only: capitalized runs, `#tags` and `@handles`
//! become entities; a handful of connective phrases between two entities in
//! the same sentence become typed relations, any other pair `co_occurs`.

use serde::Serialize;

/// Longest capitalized run kept as one entity
const MAX_RUN_WORDS: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "was", "are", "were", "be", "been", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "it", "its", "this", "that",
    "these", "those", "i", "im", "i'm", "we", "you", "he", "she", "they", "my", "our", "your",
    "his", "her", "their", "what", "which", "who", "how", "when", "where", "why", "if", "for",
    "but", "and", "or", "not", "no", "so", "than", "just", "about", "with", "from", "into", "to",
    "of", "in", "on", "at", "by", "yes", "ok", "okay", "hi", "hello", "hey", "thanks", "please",
    "maybe", "also", "then", "however", "today", "yesterday", "tomorrow", "sure", "well", "let",
    "lets", "there", "here",
];

const CONNECTORS: &[&str] = &["of", "de", "van", "von", "da", "di"];

/// Entity-type labels produced by the extractor
pub const TYPE_PROPER: &str = "proper";
pub const TYPE_TAG: &str = "tag";
pub const TYPE_PERSON: &str = "person";

/// Relation-type label for entities mentioned together without a known connective
pub const CO_OCCURS: &str = "co_occurs";

const RELATION_PATTERNS: &[(&str, &[&str])] = &[
    ("is_a", &["is", "is a", "is an", "is the", "are", "are the", "was a", "was the"]),
    ("works_at", &["works at", "works for", "work at", "work for", "worked at", "is at"]),
    ("lives_in", &["lives in", "live in", "lived in", "moved to"]),
    ("likes", &["likes", "loves", "like", "love", "enjoys"]),
];

/// One entity mention found in text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMention {
    /// Normalized key
    pub value: String,
    /// Text as written
    pub surface: String,
    pub entity_type: &'static str,
}

/// One directed relation found in text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationMention {
    pub from: String,
    pub to: String,
    pub relation_type: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub entities: Vec<EntityMention>,
    pub relations: Vec<RelationMention>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Canonical key for an entity value: lowercase, single-spaced
pub fn normalize_entity(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Mention found within one sentence, with its word span
struct Span {
    mention: EntityMention,
    start: usize,
    end: usize,
}

/// Extract entities and relations from free text
pub fn extract(text: &str) -> Extraction {
    let mut out = Extraction::default();

    for sentence in text.split(['.', '!', '?', ';', '\n']) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let spans = sentence_spans(&words);

        for span in &spans {
            if !out.entities.iter().any(|e| e.value == span.mention.value) {
                out.entities.push(span.mention.clone());
            }
        }

        for (i, a) in spans.iter().enumerate() {
            for (j, b) in spans.iter().enumerate().skip(i + 1) {
                if a.mention.value == b.mention.value {
                    continue;
                }
                let relation_type = if j == i + 1 {
                    classify_between(&words[a.end..b.start])
                } else {
                    CO_OCCURS
                };
                let relation = RelationMention {
                    from: a.mention.value.clone(),
                    to: b.mention.value.clone(),
                    relation_type,
                };
                if !out.relations.contains(&relation) {
                    out.relations.push(relation);
                }
            }
        }
    }

    out
}

fn sentence_spans(words: &[&str]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut i = 0;

    while i < words.len() {
        let raw = words[i];
        let lead = raw.trim_start_matches(|c: char| !c.is_alphanumeric() && c != '#' && c != '@');

        if let Some(rest) = lead.strip_prefix('#').or_else(|| lead.strip_prefix('@')) {
            let value = normalize_entity(rest);
            if !value.is_empty() {
                let entity_type = if lead.starts_with('#') { TYPE_TAG } else { TYPE_PERSON };
                spans.push(Span {
                    mention: EntityMention {
                        value,
                        surface: lead.to_string(),
                        entity_type,
                    },
                    start: i,
                    end: i + 1,
                });
            }
            i += 1;
            continue;
        }

        let clean = clean_word(raw);
        if is_capitalized(clean) && !is_stop_word(clean) {
            let mut run = vec![clean];
            let mut j = i + 1;
            // A run never continues past a word ending a clause ("Bob, Carol").
            while j < words.len() && run.len() < MAX_RUN_WORDS && !ends_clause(words[j - 1]) {
                let next = clean_word(words[j]);
                let connector_then_cap = CONNECTORS.contains(&next.to_lowercase().as_str())
                    && words.get(j + 1).is_some_and(|w| is_capitalized(clean_word(w)));
                if (is_capitalized(next) && !is_stop_word(next)) || connector_then_cap {
                    run.push(next);
                    j += 1;
                } else {
                    break;
                }
            }
            let surface = run.join(" ");
            spans.push(Span {
                mention: EntityMention {
                    value: normalize_entity(&surface),
                    surface,
                    entity_type: TYPE_PROPER,
                },
                start: i,
                end: j,
            });
            i = j;
            continue;
        }

        i += 1;
    }

    spans
}

fn classify_between(words: &[&str]) -> &'static str {
    let between = words
        .iter()
        .map(|w| clean_word(w).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    RELATION_PATTERNS
        .iter()
        .find(|(_, phrases)| phrases.contains(&between.as_str()))
        .map(|(kind, _)| *kind)
        .unwrap_or(CO_OCCURS)
}

fn clean_word(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

fn ends_clause(word: &str) -> bool {
    word.ends_with(',') || word.ends_with(':') || word.ends_with(')')
}

fn is_capitalized(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.is_uppercase() && word.chars().count() >= 2,
        None => false,
    }
}

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word.to_lowercase().as_str())
}
