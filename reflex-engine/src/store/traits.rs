//! Storage traits for the heuristic engine

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::CacheError;
use crate::error::Result;
use crate::types::{Domain, FireId, FireRecord, Heuristic, HeuristicId};

/// Durable persistence for heuristics and fire records
///
/// Backends store what they are given; validation, versioning and write
/// serialization happen in [`super::ConditionStore`].
#[async_trait]
pub trait HeuristicBackend: Send + Sync {
    /// Insert or replace a heuristic (including its embeddings)
    async fn put_heuristic(&self, heuristic: &Heuristic) -> Result<()>;

    /// Retrieve a heuristic by ID
    async fn get_heuristic(&self, id: HeuristicId) -> Result<Option<Heuristic>>;

    /// Delete a heuristic, returning whether it existed
    async fn delete_heuristic(&self, id: HeuristicId) -> Result<bool>;

    /// Nearest active heuristics in `domain` by condition embedding
    ///
    /// Returns cosine similarity, highest first. Rules from other domains
    /// must never be returned.
    async fn search_conditions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>>;

    /// Nearest active heuristics in `domain` by action embedding
    async fn search_actions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>>;

    /// All active heuristics in a domain
    async fn list_domain(&self, domain: &Domain) -> Result<Vec<Heuristic>>;

    /// Insert or replace a fire record
    async fn put_fire(&self, fire: &FireRecord) -> Result<()>;

    /// Retrieve a fire record by ID
    async fn get_fire(&self, id: FireId) -> Result<Option<FireRecord>>;

    /// Most recent fire records of a heuristic, newest first
    async fn fires_for(&self, heuristic_id: HeuristicId, limit: usize) -> Result<Vec<FireRecord>>;

    /// Count stored heuristics (for stats)
    async fn count(&self) -> Result<u64>;
}

/// Kind of write that happened to a heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    ConfidenceUpdated,
    Deactivated,
    Deleted,
    /// Only fire/success counters moved
    CountersUpdated,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::ConfidenceUpdated => "confidence_updated",
            Self::Deactivated => "deactivated",
            Self::Deleted => "deleted",
            Self::CountersUpdated => "counters_updated",
        }
    }

    /// Whether the write changes anything the fast-path cache mirrors.
    ///
    /// The cache holds text, embeddings, confidence and the active flag;
    /// counters are not mirrored.
    pub fn affects_cached_view(&self) -> bool {
        !matches!(self, Self::CountersUpdated)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message sent after every successful store write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub heuristic_id: HeuristicId,
    pub domain: Domain,
    pub change: ChangeType,
}

/// Receiver of store write notifications
///
/// Failures are reported to the caller, which logs them and carries on:
/// a missed invalidation only delays learning until eviction or expiry.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, invalidation: &Invalidation) -> std::result::Result<(), CacheError>;
}
