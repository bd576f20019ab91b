//! Shared identifiers and boundary enums

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of one conversation owning its own memory tiers
pub type ChatId = String;

/// Identifier of one conversational turn, supplied by the chat store
pub type MessageId = String;

/// A memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    /// River: raw recent turns
    L1,
    /// Affect ledger
    L2,
    /// Encoding store
    L3,
    /// Salience index
    L4,
    /// Relation graph
    L5,
}

impl Layer {
    pub const ALL: [Layer; 5] = [Layer::L1, Layer::L2, Layer::L3, Layer::L4, Layer::L5];

    /// Parse a list of layer names, rejecting anything unrecognized
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Layer>> {
        let mut layers = Vec::with_capacity(names.len());
        for name in names {
            let layer: Layer = name.as_ref().parse()?;
            if !layers.contains(&layer) {
                layers.push(layer);
            }
        }
        Ok(layers)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::L1 => write!(f, "L1"),
            Layer::L2 => write!(f, "L2"),
            Layer::L3 => write!(f, "L3"),
            Layer::L4 => write!(f, "L4"),
            Layer::L5 => write!(f, "L5"),
        }
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" | "river" => Ok(Layer::L1),
            "l2" | "affect" => Ok(Layer::L2),
            "l3" | "encoding" => Ok(Layer::L3),
            "l4" | "salience" => Ok(Layer::L4),
            "l5" | "graph" => Ok(Layer::L5),
            other => Err(Error::validation(format!("unknown layer: {other:?}"))),
        }
    }
}

/// Per-call reweighting of the fused retrieval score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalBias {
    Recent,
    Salient,
    #[default]
    Balanced,
}

/// What started a consolidation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationTrigger {
    Manual,
    Scheduled,
}

impl std::fmt::Display for ConsolidationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsolidationTrigger::Manual => write!(f, "manual"),
            ConsolidationTrigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Normalize an affect tag identifier: lowercase `[a-z0-9_-]`, 1..=64 chars
pub fn normalize_tag(raw: &str) -> Result<String> {
    let tag = raw.trim().to_lowercase();
    let valid = !tag.is_empty()
        && tag.len() <= 64
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(tag)
    } else {
        Err(Error::validation(format!("invalid affect tag: {raw:?}")))
    }
}
