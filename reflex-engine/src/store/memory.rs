//! In-process heuristic backend
//!
//! Keeps everything in hash maps and answers similarity queries with an exact
//! cosine scan over the requested domain. Suitable for embedded deployments
//! with a few thousand rules and for tests.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{ReflexError, Result};
use crate::types::{Domain, FireId, FireRecord, Heuristic, HeuristicId};

use super::traits::HeuristicBackend;

/// Hash-map backed [`HeuristicBackend`]
#[derive(Debug, Default)]
pub struct MemoryBackend {
    heuristics: RwLock<HashMap<HeuristicId, Heuristic>>,
    fires: RwLock<HashMap<FireId, FireRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ReflexError {
        ReflexError::Unavailable("memory backend lock poisoned".into())
    }

    fn rank<F>(&self, domain: &Domain, limit: usize, score: F) -> Result<Vec<(Heuristic, f64)>>
    where
        F: Fn(&Heuristic) -> Option<f64>,
    {
        let heuristics = self.heuristics.read().map_err(|_| Self::poisoned())?;
        let mut scored: Vec<(Heuristic, f64)> = heuristics
            .values()
            .filter(|h| h.active && &h.domain == domain)
            .filter_map(|h| score(h).map(|s| (h.clone(), s)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[async_trait]
impl HeuristicBackend for MemoryBackend {
    async fn put_heuristic(&self, heuristic: &Heuristic) -> Result<()> {
        self.heuristics
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(heuristic.id, heuristic.clone());
        Ok(())
    }

    async fn get_heuristic(&self, id: HeuristicId) -> Result<Option<Heuristic>> {
        Ok(self
            .heuristics
            .read()
            .map_err(|_| Self::poisoned())?
            .get(&id)
            .cloned())
    }

    async fn delete_heuristic(&self, id: HeuristicId) -> Result<bool> {
        Ok(self
            .heuristics
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(&id)
            .is_some())
    }

    async fn search_conditions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        self.rank(domain, limit, |h| {
            Some(cosine_similarity(embedding, &h.condition_embedding))
        })
    }

    async fn search_actions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        self.rank(domain, limit, |h| {
            h.action_embedding
                .as_deref()
                .map(|action| cosine_similarity(embedding, action))
        })
    }

    async fn list_domain(&self, domain: &Domain) -> Result<Vec<Heuristic>> {
        Ok(self
            .heuristics
            .read()
            .map_err(|_| Self::poisoned())?
            .values()
            .filter(|h| h.active && &h.domain == domain)
            .cloned()
            .collect())
    }

    async fn put_fire(&self, fire: &FireRecord) -> Result<()> {
        self.fires
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(fire.id, fire.clone());
        Ok(())
    }

    async fn get_fire(&self, id: FireId) -> Result<Option<FireRecord>> {
        Ok(self
            .fires
            .read()
            .map_err(|_| Self::poisoned())?
            .get(&id)
            .cloned())
    }

    async fn fires_for(&self, heuristic_id: HeuristicId, limit: usize) -> Result<Vec<FireRecord>> {
        let fires = self.fires.read().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<FireRecord> = fires
            .values()
            .filter(|f| f.heuristic_id == heuristic_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.fired_at.cmp(&a.fired_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.heuristics.read().map_err(|_| Self::poisoned())?.len() as u64)
    }
}
