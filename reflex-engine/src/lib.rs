//! reflex-engine - Adaptive heuristic confidence engine
//!
//! Stores learned condition→action rules, matches incoming situations
//! against them by embedding similarity and either acts on a trusted rule
//! directly or defers to an expensive reasoner. Every rule carries Beta
//! pseudo-count evidence that moves with explicit feedback, evaluator
//! verdicts and reasoner endorsements.

pub mod bootstrap;
pub mod cache;
pub mod confidence;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod matching;
pub mod reasoner;
pub mod store;
pub mod telemetry;
pub mod types;

pub use bootstrap::{BootstrapEvaluator, BootstrapJob, BootstrapWorker};
pub use cache::{CacheError, CacheStats, CachedRule, FastPathCache, WarmToken};
pub use confidence::{
    ConfidenceChange, ConfidenceUpdate, Evidence, FeedbackSource, Magnitude, PRIOR_PSEUDO_COUNT,
};
pub use config::{BackendKind, ReflexConfig};
pub use embedding::{EMBEDDING_DIM, Embedder, EmbedderError, EmbedderResult, cosine_similarity};
pub use engine::{Decision, DecisionPath, ReflexEngine, ReflexEngineBuilder};
pub use error::{ReflexError, Result};
pub use gate::{DecisionGate, GateDecision};
pub use limiter::{ConcurrencyLimiter, LimiterStats};
pub use matching::MatchEngine;
pub use reasoner::{DomainEvaluator, Exemplar, Reasoner, ReasonerError, ReasoningRequest};
pub use store::{
    ChangeType, ConditionStore, CozoBackend, HeuristicBackend, Invalidation, InvalidationSink,
    MemoryBackend,
};
pub use telemetry::{LogFormat, LoggingConfig, TelemetryError, init_tracing};
pub use types::*;
