//! Configuration for m3a-memory
//!
//! [`Config`] is fixed at startup. [`MemoryConfig`] holds the weights,
//! thresholds and windows that retrieval and consolidation read on every
//! call; it is runtime-mutable through partial patches.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Startup configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// HTTP server port
    pub server_port: u16,

    /// Buffered events per subscriber before slow listeners start lagging
    pub event_capacity: usize,

    /// Seconds between scheduled consolidation sweeps (0 disables the scheduler)
    pub consolidation_interval_secs: u64,

    /// Tuning values used when no persisted memory config exists yet
    pub memory: MemoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("m3a-memory");

        Self {
            data_dir,
            server_port: 8421,
            event_capacity: 256,
            consolidation_interval_secs: 900,
            memory: MemoryConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `M3A_DATA_DIR`, `M3A_PORT` and `M3A_CONSOLIDATE_EVERY_SECS`
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment-like lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("M3A_DATA_DIR").filter(|d| !d.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("M3A_PORT") {
            self.server_port = port
                .parse()
                .map_err(|_| Error::validation(format!("M3A_PORT is not a port: {port:?}")))?;
        }
        if let Some(secs) = lookup("M3A_CONSOLIDATE_EVERY_SECS") {
            self.consolidation_interval_secs = secs.parse().map_err(|_| {
                Error::validation(format!("M3A_CONSOLIDATE_EVERY_SECS is not a number: {secs:?}"))
            })?;
        }
        Ok(self)
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Directory holding the per-chat consolidation run logs
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// Get the path to the consolidation run log for a chat
    pub fn runs_log_path(&self, chat_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{}.jsonl", encode_file_stem(chat_id)))
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.runs_dir())?;
        Ok(())
    }
}

/// Injective, case-insensitive-safe file stem: lowercase ASCII letters,
/// digits and `-` pass through, every other byte becomes `_xx`
fn encode_file_stem(raw: &str) -> String {
    let mut stem = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => stem.push(char::from(byte)),
            _ => stem.push_str(&format!("_{byte:02x}")),
        }
    }
    stem
}

/// Shape of the encoding-strength decay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayFunction {
    /// `s · e^(−rate · days)`
    Exponential,
    /// `max(0, s − rate · days)`
    Linear,
}

/// Runtime-tunable weights, thresholds and windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    pub lexical_weight: f64,
    pub affect_weight: f64,
    pub salience_weight: f64,
    pub recency_weight: f64,
    pub decay_function: DecayFunction,
    /// Decay per day of elapsed time since the last boost
    pub decay_rate: f64,
    pub promotion_threshold: f64,
    pub salience_threshold: f64,
    pub river_retention_secs: i64,
    pub consolidation_grace_secs: i64,
    pub default_boost_factor: f64,
    pub default_top_k: usize,
    pub overfetch_factor: usize,
    pub graph_hop_limit: usize,
    pub recency_half_life_hours: f64,
    pub temporal_bias_factor: f64,
    /// Number of most recent river entries retrieval looks at
    pub river_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.5,
            affect_weight: 0.5,
            salience_weight: 0.3,
            recency_weight: 0.2,
            decay_function: DecayFunction::Exponential,
            decay_rate: 0.1,
            promotion_threshold: 0.35,
            salience_threshold: 0.6,
            river_retention_secs: 7 * 24 * 3600,
            consolidation_grace_secs: 60,
            default_boost_factor: 2.0,
            default_top_k: 10,
            overfetch_factor: 3,
            graph_hop_limit: 2,
            recency_half_life_hours: 24.0,
            temporal_bias_factor: 2.0,
            river_window: 200,
        }
    }
}

/// Partial update to [`MemoryConfig`]; only present fields change
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoryConfigPatch {
    pub lexical_weight: Option<f64>,
    pub affect_weight: Option<f64>,
    pub salience_weight: Option<f64>,
    pub recency_weight: Option<f64>,
    pub decay_function: Option<DecayFunction>,
    pub decay_rate: Option<f64>,
    pub promotion_threshold: Option<f64>,
    pub salience_threshold: Option<f64>,
    pub river_retention_secs: Option<i64>,
    pub consolidation_grace_secs: Option<i64>,
    pub default_boost_factor: Option<f64>,
    pub default_top_k: Option<usize>,
    pub overfetch_factor: Option<usize>,
    pub graph_hop_limit: Option<usize>,
    pub recency_half_life_hours: Option<f64>,
    pub temporal_bias_factor: Option<f64>,
    pub river_window: Option<usize>,
}

impl MemoryConfigPatch {
    /// Parse a loosely-typed JSON patch, rejecting unknown keys and bad types
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::validation("config patch must be a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| Error::validation(e.to_string()))
    }
}

macro_rules! merge {
    ($target:ident, $patch:ident, $($field:ident),+ $(,)?) => {
        $( if let Some(v) = $patch.$field { $target.$field = v; } )+
    };
}

impl MemoryConfig {
    /// Return a copy of this config with `patch` merged in and validated
    pub fn merged(&self, patch: MemoryConfigPatch) -> Result<Self> {
        let mut next = self.clone();
        merge!(
            next,
            patch,
            lexical_weight,
            affect_weight,
            salience_weight,
            recency_weight,
            decay_function,
            decay_rate,
            promotion_threshold,
            salience_threshold,
            river_retention_secs,
            consolidation_grace_secs,
            default_boost_factor,
            default_top_k,
            overfetch_factor,
            graph_hop_limit,
            recency_half_life_hours,
            temporal_bias_factor,
            river_window,
        );
        next.validate()?;
        Ok(next)
    }

    /// Check every field is inside its legal range
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("lexicalWeight", self.lexical_weight),
            ("affectWeight", self.affect_weight),
            ("salienceWeight", self.salience_weight),
            ("recencyWeight", self.recency_weight),
            ("decayRate", self.decay_rate),
            ("temporalBiasFactor", self.temporal_bias_factor),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::validation(format!("{name} must be a finite number >= 0")));
            }
        }
        for (name, value) in [
            ("promotionThreshold", self.promotion_threshold),
            ("salienceThreshold", self.salience_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::validation(format!("{name} must be within [0, 1]")));
            }
        }
        if self.salience_threshold < self.promotion_threshold {
            return Err(Error::validation("salienceThreshold must be >= promotionThreshold"));
        }
        if !self.default_boost_factor.is_finite() || self.default_boost_factor <= 0.0 {
            return Err(Error::validation("defaultBoostFactor must be > 0"));
        }
        if !self.recency_half_life_hours.is_finite() || self.recency_half_life_hours <= 0.0 {
            return Err(Error::validation("recencyHalfLifeHours must be > 0"));
        }
        if self.river_retention_secs <= 0 || self.consolidation_grace_secs < 0 {
            return Err(Error::validation(
                "riverRetentionSecs must be > 0 and consolidationGraceSecs >= 0",
            ));
        }
        if self.default_top_k == 0 || self.overfetch_factor == 0 || self.river_window == 0 {
            return Err(Error::validation(
                "defaultTopK, overfetchFactor and riverWindow must be >= 1",
            ));
        }
        Ok(())
    }
}
