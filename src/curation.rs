//! Curation actions: PIN, IMPORTANT, MUTE and AFFECT_TAG
//!
//! A message's curation state is never stored as such; it follows from tier
//! membership (pinned salience entry, boosted encoding, muted flags, affect
//! entries) and the flags compose freely. Each action is planned here as a
//! [`ChatChange`] against a snapshot of the chat and committed by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::affect::AffectEntry;
use crate::chat::{ChatChange, ChatMemory};
use crate::config::MemoryConfig;
use crate::encoding::EncodingEntry;
use crate::error::{Error, Result};
use crate::river::RiverEntry;
use crate::salience::{SalienceEntry, PINNED_SCORE};
use crate::types::{ChatId, Layer, MessageId};

/// A curation request as it arrives from callers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurateRequest {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub action: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub content: Option<String>,
}

/// A validated curation action
#[derive(Debug, Clone, PartialEq)]
pub enum CurationAction {
    Pin { content: String },
    /// `factor` of `None` means the configured default
    Important { factor: Option<f64> },
    Mute,
    AffectTag {
        tag: String,
        intensity: f64,
        reason: Option<String>,
    },
}

impl CurationAction {
    pub fn name(&self) -> &'static str {
        match self {
            CurationAction::Pin { .. } => "PIN",
            CurationAction::Important { .. } => "IMPORTANT",
            CurationAction::Mute => "MUTE",
            CurationAction::AffectTag { .. } => "AFFECT_TAG",
        }
    }
}

impl CurateRequest {
    pub fn validate(&self) -> Result<CurationAction> {
        if self.chat_id.trim().is_empty() || self.message_id.trim().is_empty() {
            return Err(Error::validation("chatId and messageId are required"));
        }
        let meta = self.metadata.as_ref();

        match self.action.trim().to_ascii_uppercase().as_str() {
            "PIN" => {
                let content = self
                    .content
                    .clone()
                    .or_else(|| text_field(meta, "content"))
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| Error::validation("PIN requires content"))?;
                Ok(CurationAction::Pin { content })
            }
            "IMPORTANT" => Ok(CurationAction::Important {
                factor: number_field(meta, "factor")?,
            }),
            "MUTE" => Ok(CurationAction::Mute),
            "AFFECT_TAG" => {
                let tag = text_field(meta, "tag")
                    .or_else(|| text_field(meta, "category"))
                    .ok_or_else(|| Error::validation("AFFECT_TAG requires a tag"))?;
                let intensity = number_field(meta, "intensity")?
                    .ok_or_else(|| Error::validation("AFFECT_TAG requires an intensity"))?;
                Ok(CurationAction::AffectTag {
                    tag,
                    intensity,
                    reason: text_field(meta, "reason"),
                })
            }
            other => Err(Error::validation(format!("unknown curation action: {other:?}"))),
        }
    }
}

fn text_field(meta: Option<&Value>, key: &str) -> Option<String> {
    meta?.get(key)?.as_str().map(str::to_string)
}

fn number_field(meta: Option<&Value>, key: &str) -> Result<Option<f64>> {
    match meta.and_then(|m| m.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::validation(format!("{key} must be a number"))),
    }
}

/// Record produced by a successful action
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CuratedEntry {
    Salience(SalienceEntry),
    Encoding(EncodingEntry),
    Affect(AffectEntry),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<CuratedEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_layers: Option<Vec<Layer>>,
}

impl CurationOutcome {
    pub fn entry(entry: CuratedEntry) -> Self {
        Self {
            success: true,
            entry: Some(entry),
            affected_layers: None,
        }
    }

    pub fn layers(layers: Vec<Layer>) -> Self {
        Self {
            success: true,
            entry: None,
            affected_layers: Some(layers),
        }
    }
}

/// Create or refresh the pinned salience entry of a message
pub fn plan_pin(
    chat: &ChatMemory,
    chat_id: &str,
    message_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<(ChatChange, SalienceEntry)> {
    let content = require_pin_content(content)?;

    let entry = match chat.salience.get(message_id) {
        Some(existing) => SalienceEntry {
            pinned: true,
            score: PINNED_SCORE,
            content: content.to_string(),
            updated_at: now,
            ..existing.clone()
        },
        None => SalienceEntry {
            encoding_id: chat.encoding.by_source(message_id).map(|e| e.id),
            ..SalienceEntry::pinned(chat_id, message_id, content, now)
        },
    };
    let entry = SalienceEntry {
        suppressed: entry.suppressed || chat.is_muted(message_id),
        ..entry
    };

    let change = ChatChange {
        salience: vec![entry.clone()],
        ..Default::default()
    };
    Ok((change, entry))
}

/// The trimmed content a PIN stores; blank content is rejected
pub fn require_pin_content(content: &str) -> Result<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::validation("PIN requires content"));
    }
    Ok(content)
}

/// IMPORTANT boost factors must be finite and positive
pub fn require_boost_factor(factor: f64) -> Result<()> {
    if !factor.is_finite() || factor <= 0.0 {
        return Err(Error::validation("boost factor must be a finite number > 0"));
    }
    Ok(())
}

/// Content the chat itself can still see for a message, without asking outside
pub fn local_content(chat: &ChatMemory, message_id: &str) -> Option<String> {
    if let Some(entry) = chat.river.get(message_id).filter(|e| !e.muted) {
        return Some(entry.content.clone());
    }
    chat.salience
        .get(message_id)
        .filter(|e| !e.suppressed)
        .map(|e| e.content.clone())
}

/// Boost the encoding of a message, encoding it first when needed.
///
/// `fallback_content` is consulted only when the message has no encoding and
/// the chat holds no visible content for it.
pub fn plan_important(
    chat: &ChatMemory,
    chat_id: &str,
    message_id: &str,
    factor: f64,
    fallback_content: Option<String>,
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> Result<(ChatChange, EncodingEntry)> {
    let mut entry = match chat.encoding.by_source(message_id) {
        Some(existing) => existing.clone(),
        None => {
            let content = local_content(chat, message_id)
                .or(fallback_content)
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    Error::not_found(format!("no encodable content for message {message_id}"))
                })?;
            EncodingEntry {
                suppressed: chat.is_muted(message_id),
                ..EncodingEntry::new(chat_id, message_id, &content, now)
            }
        }
    };
    entry.boost(factor, now, config)?;

    let mut change = ChatChange {
        encodings: vec![entry.clone()],
        ..Default::default()
    };
    if let Some(salience) = chat.salience.get(message_id) {
        if salience.encoding_id != Some(entry.id) {
            change.salience.push(SalienceEntry {
                encoding_id: Some(entry.id),
                updated_at: now,
                ..salience.clone()
            });
        }
    }
    Ok((change, entry))
}

/// Suppress a message in every tier that still shows it.
///
/// Returns the layers that actually changed; a repeat mute changes nothing.
pub fn plan_mute(chat: &ChatMemory, message_id: &str) -> (ChatChange, Vec<Layer>) {
    let mut change = ChatChange::default();
    let mut layers = Vec::new();

    if let Some(entry) = chat.river.get(message_id).filter(|e| !e.muted) {
        change.river.push(RiverEntry {
            muted: true,
            ..entry.clone()
        });
        layers.push(Layer::L1);
    }
    if let Some(entry) = chat.encoding.by_source(message_id).filter(|e| !e.suppressed) {
        change.encodings.push(EncodingEntry {
            suppressed: true,
            ..entry.clone()
        });
        layers.push(Layer::L3);
    }
    if let Some(entry) = chat.salience.get(message_id).filter(|e| !e.suppressed) {
        change.salience.push(SalienceEntry {
            suppressed: true,
            ..entry.clone()
        });
        layers.push(Layer::L4);
    }
    if !chat.is_muted(message_id) {
        change.muted.push(message_id.to_string());
    }

    (change, layers)
}

/// Append a new affect annotation
pub fn plan_affect_tag(
    chat_id: &str,
    message_id: &str,
    tag: &str,
    intensity: f64,
    reason: Option<String>,
) -> Result<(ChatChange, AffectEntry)> {
    let entry = AffectEntry::new(chat_id, message_id, tag, intensity, reason)?;
    let change = ChatChange {
        affect: vec![entry.clone()],
        ..Default::default()
    };
    Ok((change, entry))
}
