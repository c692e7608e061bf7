//! Fast-path cache: a bounded, read-through view of the condition store
//!
//! Two LRU tiers share one lock:
//!
//! - **rule tier**: versioned read-only copies of heuristics (text, domain,
//!   confidence)
//! - **query tier**: result sets keyed by `(domain, embedding fingerprint)`
//!   that reference rule entries by id
//!
//! A query hit is assembled from the rule tier, so invalidating one rule
//! turns every result set that mentions it into a miss. Every invalidation
//! bumps a generation counter; a store result fetched before an invalidation
//! is discarded instead of being populated, so an acknowledged invalidation
//! is never undone by a slow reader.
//!
//! The cache never writes back to the store and is never authoritative.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::embedding::fingerprint;
use crate::error::ReflexError;
use crate::store::{ChangeType, Invalidation, InvalidationSink};
use crate::types::{Candidate, Domain, Heuristic, HeuristicId};

/// Errors from cache operations; never fatal to the decision path
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheError> for ReflexError {
    fn from(err: CacheError) -> Self {
        ReflexError::Unavailable(err.to_string())
    }
}

type CacheResult<T> = std::result::Result<T, CacheError>;

/// Read-only copy of the fields the fast path needs from a heuristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRule {
    pub heuristic_id: HeuristicId,
    pub domain: Domain,
    pub condition: String,
    pub action: String,
    pub confidence: f64,
    pub version: u64,
}

impl From<&Heuristic> for CachedRule {
    fn from(h: &Heuristic) -> Self {
        Self {
            heuristic_id: h.id,
            domain: h.domain.clone(),
            condition: h.condition.clone(),
            action: h.action.clone(),
            confidence: h.confidence(),
            version: h.version,
        }
    }
}

/// Observability counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Rule entries currently held
    pub size: usize,
    pub capacity: usize,
    /// Query result sets currently held
    pub query_size: usize,
    pub query_capacity: usize,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub queries: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
}

/// Proof of a miss, handed back to [`FastPathCache::populate`]
#[derive(Debug, Clone)]
pub struct MissToken {
    key: QueryKey,
    generation: u64,
}

/// Generation observed before reading rules to preload
#[derive(Debug, Clone, Copy)]
pub struct WarmToken {
    generation: u64,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Vec<Candidate>),
    Miss(MissToken),
}

type QueryKey = (Domain, String);

#[derive(Debug)]
struct RuleEntry {
    rule: CachedRule,
    cached_at: Instant,
}

#[derive(Debug)]
struct QueryEntry {
    results: Vec<(HeuristicId, f64)>,
    cached_at: Instant,
}

#[derive(Debug)]
struct Inner {
    rules: LruCache<HeuristicId, RuleEntry>,
    queries: LruCache<QueryKey, QueryEntry>,
    generation: u64,
    hits: u64,
    misses: u64,
    queries_seen: u64,
    evictions: u64,
    invalidations: u64,
    expirations: u64,
}

impl Inner {
    /// Insert unless a newer version is already cached
    fn put_rule(&mut self, rule: CachedRule, now: Instant) {
        if let Some(existing) = self.rules.peek(&rule.heuristic_id)
            && existing.rule.version > rule.version
        {
            return;
        }
        let id = rule.heuristic_id;
        if let Some((evicted, _)) = self.rules.push(id, RuleEntry { rule, cached_at: now })
            && evicted != id
        {
            self.evictions += 1;
        }
    }

    fn drop_domain_queries(&mut self, domain: &Domain) -> usize {
        let keys: Vec<QueryKey> = self
            .queries
            .iter()
            .filter(|(key, _)| &key.0 == domain)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.queries.pop(key);
        }
        keys.len()
    }
}

/// Bounded LRU/TTL mirror of the condition store
#[derive(Debug)]
pub struct FastPathCache {
    inner: Mutex<Inner>,
    capacity: NonZeroUsize,
    query_capacity: NonZeroUsize,
    ttl: Duration,
}

impl FastPathCache {
    /// Create a cache; zero capacities are raised to one
    pub fn new(capacity: usize, query_capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let query_capacity = NonZeroUsize::new(query_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                rules: LruCache::new(capacity),
                queries: LruCache::new(query_capacity),
                generation: 0,
                hits: 0,
                misses: 0,
                queries_seen: 0,
                evictions: 0,
                invalidations: 0,
                expirations: 0,
            }),
            capacity,
            query_capacity,
            ttl,
        }
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }

    fn expired(&self, cached_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(cached_at) >= self.ttl
    }

    /// Look up the candidates for a situation embedding in a domain
    pub fn lookup(&self, embedding: &[f32], domain: &Domain) -> CacheResult<CacheLookup> {
        let key: QueryKey = (domain.clone(), fingerprint(embedding));
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.queries_seen += 1;

        if let Some(candidates) = self.assemble(&mut inner, &key, now) {
            inner.hits += 1;
            trace!(domain = %domain, candidates = candidates.len(), "cache hit");
            return Ok(CacheLookup::Hit(candidates));
        }

        inner.misses += 1;
        trace!(domain = %domain, "cache miss");
        Ok(CacheLookup::Miss(MissToken {
            key,
            generation: inner.generation,
        }))
    }

    /// Build a hit from the query tier, dropping anything stale on the way
    fn assemble(&self, inner: &mut Inner, key: &QueryKey, now: Instant) -> Option<Vec<Candidate>> {
        let (results, query_cached_at) = {
            let entry = inner.queries.get(key)?;
            (entry.results.clone(), entry.cached_at)
        };
        if self.expired(query_cached_at, now) {
            inner.queries.pop(key);
            inner.expirations += 1;
            return None;
        }

        let mut candidates = Vec::with_capacity(results.len());
        for (id, similarity) in results {
            let (fresh, expired) = match inner.rules.get(&id) {
                Some(entry) if entry.rule.domain != key.0 => (None, false),
                Some(entry) if self.expired(entry.cached_at, now) => (None, true),
                Some(entry) => (
                    Some(Candidate {
                        heuristic_id: id,
                        condition_text: entry.rule.condition.clone(),
                        action_text: entry.rule.action.clone(),
                        confidence: entry.rule.confidence,
                        similarity,
                    }),
                    false,
                ),
                None => (None, false),
            };
            if expired {
                inner.rules.pop(&id);
                inner.expirations += 1;
            }
            let Some(candidate) = fresh else {
                inner.queries.pop(key);
                return None;
            };
            candidates.push(candidate);
        }
        Some(candidates)
    }

    /// Store the result of a store search that followed a miss
    ///
    /// Returns `false` when the result was discarded because an invalidation
    /// happened after the miss was observed.
    pub fn populate(&self, token: MissToken, results: &[(Heuristic, f64)]) -> CacheResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.generation != token.generation {
            debug!(
                domain = %token.key.0,
                observed = token.generation,
                current = inner.generation,
                "discarding cache population that raced an invalidation"
            );
            return Ok(false);
        }

        for (heuristic, _) in results {
            inner.put_rule(CachedRule::from(heuristic), now);
        }
        let entry = QueryEntry {
            results: results.iter().map(|(h, sim)| (h.id, *sim)).collect(),
            cached_at: now,
        };
        let key = token.key;
        if let Some((evicted, _)) = inner.queries.push(key.clone(), entry)
            && evicted != key
        {
            inner.evictions += 1;
        }
        Ok(true)
    }

    /// Drop a rule entry; result sets referencing it become misses
    pub fn invalidate(&self, heuristic_id: HeuristicId) -> CacheResult<bool> {
        let mut inner = self.lock()?;
        inner.generation += 1;
        inner.invalidations += 1;
        let removed = inner.rules.pop(&heuristic_id).is_some();
        debug!(heuristic_id = %heuristic_id, removed, "invalidated cache entry");
        Ok(removed)
    }

    /// Drop every query result set of a domain
    pub fn invalidate_domain(&self, domain: &Domain) -> CacheResult<usize> {
        let mut inner = self.lock()?;
        inner.generation += 1;
        inner.invalidations += 1;
        let dropped = inner.drop_domain_queries(domain);
        debug!(domain = %domain, dropped, "invalidated domain result sets");
        Ok(dropped)
    }

    /// Take before reading the rules handed to [`FastPathCache::warm`]
    pub fn warm_token(&self) -> CacheResult<WarmToken> {
        let inner = self.lock()?;
        Ok(WarmToken {
            generation: inner.generation,
        })
    }

    /// Preload the rule tier with active rules
    ///
    /// Returns how many rules were loaded. Nothing is loaded when an
    /// invalidation happened after the token was taken, since the rules may
    /// predate it.
    pub fn warm(&self, token: WarmToken, heuristics: &[Heuristic]) -> CacheResult<usize> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.generation != token.generation {
            debug!(
                observed = token.generation,
                current = inner.generation,
                "discarding cache warm that raced an invalidation"
            );
            return Ok(0);
        }

        let mut loaded = 0;
        for heuristic in heuristics.iter().filter(|h| h.active) {
            inner.put_rule(CachedRule::from(heuristic), now);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Snapshot of the rule tier, most recently used first
    pub fn list(&self) -> CacheResult<Vec<CachedRule>> {
        let inner = self.lock()?;
        Ok(inner.rules.iter().map(|(_, entry)| entry.rule.clone()).collect())
    }

    /// Empty both tiers; counters are kept
    pub fn flush(&self) -> CacheResult<()> {
        let mut inner = self.lock()?;
        inner.generation += 1;
        inner.rules.clear();
        inner.queries.clear();
        debug!("flushed fast-path cache");
        Ok(())
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let inner = self.lock()?;
        let lookups = inner.hits + inner.misses;
        Ok(CacheStats {
            size: inner.rules.len(),
            capacity: self.capacity.get(),
            query_size: inner.queries.len(),
            query_capacity: self.query_capacity.get(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            hits: inner.hits,
            misses: inner.misses,
            queries: inner.queries_seen,
            evictions: inner.evictions,
            invalidations: inner.invalidations,
            expirations: inner.expirations,
        })
    }
}

impl InvalidationSink for FastPathCache {
    fn invalidate(&self, invalidation: &Invalidation) -> CacheResult<()> {
        if !invalidation.change.affects_cached_view() {
            return Ok(());
        }
        // new or edited rules may belong in result sets they are not in yet
        if matches!(invalidation.change, ChangeType::Created | ChangeType::Updated) {
            self.invalidate_domain(&invalidation.domain)?;
        }
        FastPathCache::invalidate(self, invalidation.heuristic_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Evidence;
    use crate::embedding::EMBEDDING_DIM;
    use crate::types::Origin;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    fn rule(domain: &str) -> Heuristic {
        let mut h = Heuristic::new("cond", axis(0), "act", domain, Origin::Seeded);
        h.version = 1;
        h
    }

    fn cache() -> FastPathCache {
        FastPathCache::new(8, 8, Duration::from_secs(60))
    }

    fn miss(lookup: CacheLookup) -> MissToken {
        match lookup {
            CacheLookup::Miss(token) => token,
            CacheLookup::Hit(_) => panic!("expected miss"),
        }
    }

    fn hit(lookup: CacheLookup) -> Vec<Candidate> {
        match lookup {
            CacheLookup::Hit(candidates) => candidates,
            CacheLookup::Miss(_) => panic!("expected hit"),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = cache();
        let domain = Domain::new("home");
        let h = rule("home");

        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        assert!(cache.populate(token, &[(h.clone(), 0.93)]).unwrap());

        let candidates = hit(cache.lookup(&axis(0), &domain).unwrap());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].heuristic_id, h.id);
        assert!((candidates[0].similarity - 0.93).abs() < 1e-12);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.queries, 2);
        assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_result_set_is_cached() {
        let cache = cache();
        let domain = Domain::new("home");
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[]).unwrap();
        assert!(hit(cache.lookup(&axis(0), &domain).unwrap()).is_empty());
    }

    #[test]
    fn test_query_keys_are_domain_scoped() {
        let cache = cache();
        let token = miss(cache.lookup(&axis(0), &Domain::new("home")).unwrap());
        cache.populate(token, &[(rule("home"), 0.9)]).unwrap();

        miss(cache.lookup(&axis(0), &Domain::new("garage")).unwrap());
    }

    #[test]
    fn test_invalidate_turns_hit_into_miss() {
        let cache = cache();
        let domain = Domain::new("home");
        let h = rule("home");
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[(h.clone(), 0.9)]).unwrap();

        assert!(cache.invalidate(h.id).unwrap());
        miss(cache.lookup(&axis(0), &domain).unwrap());
        assert_eq!(cache.stats().unwrap().invalidations, 1);
    }

    #[test]
    fn test_populate_after_invalidation_is_discarded() {
        let cache = cache();
        let domain = Domain::new("home");
        let stale = rule("home");

        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.invalidate(stale.id).unwrap();
        assert!(!cache.populate(token, &[(stale, 0.9)]).unwrap());
        miss(cache.lookup(&axis(0), &domain).unwrap());
    }

    #[test]
    fn test_populate_never_downgrades_version() {
        let cache = cache();
        let domain = Domain::new("home");
        let mut newer = rule("home").with_evidence(Evidence::new(3.0, 1.0).unwrap());
        newer.version = 5;
        let mut older = newer.clone().with_evidence(Evidence::uniform());
        older.version = 4;

        cache
            .warm(cache.warm_token().unwrap(), &[newer.clone()])
            .unwrap();
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[(older, 0.9)]).unwrap();

        let candidates = hit(cache.lookup(&axis(0), &domain).unwrap());
        assert!((candidates[0].confidence - 0.75).abs() < 1e-12);
        assert_eq!(cache.list().unwrap()[0].version, 5);
    }

    #[test]
    fn test_lru_eviction_counts() {
        let cache = FastPathCache::new(2, 8, Duration::from_secs(60));
        let rules: Vec<_> = (0..3).map(|_| rule("home")).collect();
        cache.warm(cache.warm_token().unwrap(), &rules).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_warm_skips_inactive() {
        let cache = cache();
        let mut inactive = rule("home");
        inactive.active = false;
        let token = cache.warm_token().unwrap();
        assert_eq!(cache.warm(token, &[rule("home"), inactive]).unwrap(), 1);
    }

    #[test]
    fn test_warm_after_invalidation_is_discarded() {
        let cache = cache();
        let domain = Domain::new("home");
        let stale = rule("home");

        let warm = cache.warm_token().unwrap();
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[(stale.clone(), 0.9)]).unwrap();

        // an update lands between reading the rules and warming with them
        cache.invalidate(stale.id).unwrap();
        assert_eq!(cache.warm(warm, &[stale.clone()]).unwrap(), 0);

        assert!(cache.list().unwrap().is_empty());
        miss(cache.lookup(&axis(0), &domain).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = FastPathCache::new(8, 8, Duration::from_secs(10));
        let domain = Domain::new("home");
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[(rule("home"), 0.9)]).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        miss(cache.lookup(&axis(0), &domain).unwrap());
        assert!(cache.stats().unwrap().expirations >= 1);
    }

    #[test]
    fn test_sink_ignores_counter_writes() {
        let cache = cache();
        let h = rule("home");
        cache.warm(cache.warm_token().unwrap(), &[h.clone()]).unwrap();

        let invalidation = Invalidation {
            heuristic_id: h.id,
            domain: h.domain.clone(),
            change: ChangeType::CountersUpdated,
        };
        InvalidationSink::invalidate(&cache, &invalidation).unwrap();
        assert_eq!(cache.stats().unwrap().size, 1);
        assert_eq!(cache.stats().unwrap().invalidations, 0);
    }

    #[test]
    fn test_sink_created_drops_domain_result_sets() {
        let cache = cache();
        let domain = Domain::new("home");
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[]).unwrap();

        let newcomer = rule("home");
        let invalidation = Invalidation {
            heuristic_id: newcomer.id,
            domain: domain.clone(),
            change: ChangeType::Created,
        };
        InvalidationSink::invalidate(&cache, &invalidation).unwrap();
        miss(cache.lookup(&axis(0), &domain).unwrap());
    }

    #[test]
    fn test_flush_empties_both_tiers() {
        let cache = cache();
        let domain = Domain::new("home");
        let token = miss(cache.lookup(&axis(0), &domain).unwrap());
        cache.populate(token, &[(rule("home"), 0.9)]).unwrap();

        cache.flush().unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.query_size, 0);
        assert!(cache.list().unwrap().is_empty());
    }
}
