//! Engine configuration
//!
//! Loaded from `reflex.toml` in the reflex config directory. Every section
//! and field has a default, so an empty or missing file yields a working
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReflexError, Result};
use crate::telemetry::LoggingConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflexConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ReflexConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| ReflexError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when no
    /// file exists
    pub fn load_default() -> Result<Self> {
        let path = reflex_paths::config_file();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        for (name, value) in [
            ("gate.base_threshold", gate.base_threshold),
            ("gate.threshold_reduction", gate.threshold_reduction),
            ("gate.min_threshold", gate.min_threshold),
            ("gate.max_threshold", gate.max_threshold),
            ("gate.similarity_floor", gate.similarity_floor),
            ("matching.tie_epsilon", self.matching.tie_epsilon),
            ("bootstrap.endorsement_threshold", self.bootstrap.endorsement_threshold),
            ("bootstrap.unendorsed_penalty", self.bootstrap.unendorsed_penalty),
            ("learning.dedup_threshold", self.learning.dedup_threshold),
        ] {
            unit_interval(name, value)?;
        }
        if gate.min_threshold > gate.max_threshold {
            return Err(ReflexError::Config(format!(
                "gate.min_threshold ({}) exceeds gate.max_threshold ({})",
                gate.min_threshold, gate.max_threshold
            )));
        }
        let weight = self.bootstrap.endorsement_weight;
        if !(weight.is_finite() && weight > 0.0 && weight <= 1.0) {
            return Err(ReflexError::Config(format!(
                "bootstrap.endorsement_weight must be in (0, 1], got {weight}"
            )));
        }
        for (name, value) in [
            ("matching.max_candidates", self.matching.max_candidates),
            ("cache.capacity", self.cache.capacity),
            ("cache.query_capacity", self.cache.query_capacity),
            ("limiter.max_concurrent", self.limiter.max_concurrent),
        ] {
            if value == 0 {
                return Err(ReflexError::Config(format!("{name} must be at least 1")));
            }
        }
        // a zero TTL would expire every cache entry on arrival
        for (name, value) in [
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("limiter.reasoner_timeout_ms", self.limiter.reasoner_timeout_ms),
        ] {
            if value == 0 {
                return Err(ReflexError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ReflexError::Config(format!("{name} must be in [0, 1], got {value}")))
    }
}

/// Which backend holds the heuristics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    #[default]
    Cozo,
}

/// Durable storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database directory for the Cozo backend
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    reflex_paths::heuristics_db_dir()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_db_path(),
        }
    }
}

/// Fire/defer thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub base_threshold: f64,
    /// Subtracted from the base threshold at urgency 1.0
    pub threshold_reduction: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// Minimum similarity of the best candidate for it to fire at all
    pub similarity_floor: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_threshold: 0.7,
            threshold_reduction: 0.2,
            min_threshold: 0.5,
            max_threshold: 0.95,
            similarity_floor: 0.8,
        }
    }
}

/// Candidate retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub max_candidates: usize,
    /// Similarities closer than this are ranked by confidence
    pub tie_epsilon: f64,
    /// Nearest neighbours fetched from the store before ranking; never
    /// fewer than `max_candidates`
    pub search_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_candidates: 5,
            tie_epsilon: 0.01,
            search_limit: 10,
        }
    }
}

/// Fast-path cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Rule entries held
    pub capacity: usize,
    /// Query result sets held
    pub query_capacity: usize,
    pub ttl_secs: u64,
    /// Rules loaded per domain by `warm_cache`
    pub warm_limit: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            query_capacity: 4096,
            ttl_secs: 300,
            warm_limit: 100,
        }
    }
}

/// Post-answer endorsement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub enabled: bool,
    pub endorsement_threshold: f64,
    pub endorsement_weight: f64,
    /// Same-domain rules searched by action similarity besides the shown
    /// candidates
    pub broad_search_limit: usize,
    /// Negative magnitude applied to shown candidates the answer did not
    /// endorse; 0 disables it
    pub unendorsed_penalty: f64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endorsement_threshold: 0.75,
            endorsement_weight: 0.5,
            broad_search_limit: 10,
            unendorsed_penalty: 0.0,
        }
    }
}

/// Reasoner concurrency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_reasoner_timeout_ms")]
    pub reasoner_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_reasoner_timeout_ms() -> u64 {
    30_000
}

impl LimiterConfig {
    pub fn reasoner_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoner_timeout_ms)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            reasoner_timeout_ms: default_reasoner_timeout_ms(),
        }
    }
}

/// Rule creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Condition similarity at which a new rule with the same action is
    /// treated as a duplicate
    pub dedup_threshold: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.95,
        }
    }
}
