//! # M3A Memory
//!
//! A multi-layer memory engine for conversational agents.
//!
//! ## Architecture
//!
//! Each chat owns its own tiers:
//! - **L1 River** - recency-ordered raw turns
//! - **L2 Affect** - append-only emotional annotations
//! - **L3 Encoding** - long-term entries with a decaying strength
//! - **L4 Salience** - importance ranking with sticky pins
//!
//! plus a shared **L5 Relation Graph** of extracted entities. Retrieval fuses
//! lexical, salience, recency and affect signals across the tiers; curation
//! and consolidation move content between them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use m3a_memory::{ConsolidationTrigger, IngestRequest, MemoryStore, RetrievalQuery};
//!
//! let store = MemoryStore::open(Config::default())?;
//!
//! // Record a turn
//! store.ingest("chat-1", IngestRequest::new("Alice works at Acme")).await?;
//!
//! // Promote it into the long-term tiers
//! store.consolidate("chat-1", ConsolidationTrigger::Manual).await?;
//!
//! // Retrieve memories for a prompt
//! let result = store.retrieve(&RetrievalQuery::new("chat-1", "where does alice work"))?;
//! println!("{}", result.format_for_prompt());
//! ```

pub mod affect;
pub mod chat;
pub mod config;
pub mod consolidation;
pub mod curation;
pub mod encoding;
pub mod error;
pub mod events;
pub mod extract;
pub mod graph;
pub mod lexical;
pub mod memory;
pub mod retrieval;
pub mod river;
pub mod salience;
pub mod storage;
pub mod types;

pub use affect::{AffectEntry, AffectQuery};
pub use chat::MemoryStats;
pub use config::{Config, DecayFunction, MemoryConfig};
pub use consolidation::ConsolidationRun;
pub use curation::{CurateRequest, CuratedEntry, CurationOutcome};
pub use encoding::EncodingEntry;
pub use error::{Error, ErrorKind, Result};
pub use events::{Envelope, MemoryEvent};
pub use graph::RelatedEntity;
pub use lexical::LexicalHit;
pub use memory::{IngestRequest, MemoryStore, MessageSource};
pub use retrieval::{RankedCandidate, RetrievalQuery, RetrievalResult};
pub use river::{RiverEntry, RiverStats, Role};
pub use salience::{SalienceEntry, SalienceQuery};
pub use types::{ConsolidationTrigger, Layer, TemporalBias};
