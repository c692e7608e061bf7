//! Condition store: the only writer of heuristic state
//!
//! Validates every write at the boundary, serializes writes per rule, bumps
//! the rule's version and notifies the invalidation sink after each
//! successful write. Reads go straight to the backend.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::confidence::{ConfidenceChange, ConfidenceUpdate, FeedbackSource, Magnitude};
use crate::embedding::validate_embedding;
use crate::error::{ReflexError, Result};
use crate::types::{
    Candidate, Domain, FireId, FireOutcome, FireRecord, Heuristic, HeuristicId, SituationId,
};

use super::traits::{ChangeType, HeuristicBackend, Invalidation, InvalidationSink};

/// Number of lock stripes guarding per-rule writes
const LOCK_STRIPES: usize = 64;

/// Durable rule storage and sole source of truth for confidence
pub struct ConditionStore {
    backend: Arc<dyn HeuristicBackend>,
    sink: Option<Arc<dyn InvalidationSink>>,
    stripes: Vec<Mutex<()>>,
}

impl ConditionStore {
    pub fn new(backend: Arc<dyn HeuristicBackend>) -> Self {
        Self {
            backend,
            sink: None,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Register the receiver of write notifications (normally the cache)
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn stripe(&self, id: Uuid) -> usize {
        (id.as_u128() % self.stripes.len() as u128) as usize
    }

    async fn lock(&self, id: Uuid) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(id)].lock().await
    }

    /// Lock two ids at once, taking stripes in index order
    async fn lock_pair(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (i, j) = (self.stripe(a), self.stripe(b));
        if i == j {
            return (self.stripes[i].lock().await, None);
        }
        let (low, high) = (i.min(j), i.max(j));
        let first = self.stripes[low].lock().await;
        let second = self.stripes[high].lock().await;
        (first, Some(second))
    }

    fn notify(&self, heuristic: &Heuristic, change: ChangeType) {
        let Some(sink) = &self.sink else {
            return;
        };
        let invalidation = Invalidation {
            heuristic_id: heuristic.id,
            domain: heuristic.domain.clone(),
            change,
        };
        if let Err(e) = sink.invalidate(&invalidation) {
            warn!(
                heuristic_id = %heuristic.id,
                change = %change,
                error = %e,
                "cache invalidation failed; entry stays until eviction or expiry"
            );
        }
    }

    async fn load(&self, id: HeuristicId) -> Result<Heuristic> {
        self.backend
            .get_heuristic(id)
            .await?
            .ok_or_else(|| ReflexError::heuristic_not_found(id))
    }

    async fn save(&self, mut heuristic: Heuristic, change: ChangeType) -> Result<Heuristic> {
        heuristic.version += 1;
        heuristic.updated_at = Utc::now();
        self.backend.put_heuristic(&heuristic).await?;
        self.notify(&heuristic, change);
        Ok(heuristic)
    }

    /// Insert a new rule or replace the text, embeddings and flags of an
    /// existing one.
    ///
    /// Evidence, counters and creation time of an existing rule are kept;
    /// confidence only moves through [`ConditionStore::apply_update`].
    pub async fn upsert(&self, heuristic: Heuristic) -> Result<HeuristicId> {
        validate_heuristic(&heuristic)?;

        let _guard = self.lock(heuristic.id).await;
        let (stored, change) = match self.backend.get_heuristic(heuristic.id).await? {
            Some(existing) => (
                Heuristic {
                    evidence: existing.evidence,
                    fire_count: existing.fire_count,
                    success_count: existing.success_count,
                    version: existing.version,
                    created_at: existing.created_at,
                    ..heuristic
                },
                ChangeType::Updated,
            ),
            None => (
                Heuristic {
                    version: 0,
                    ..heuristic
                },
                ChangeType::Created,
            ),
        };

        let saved = self.save(stored, change).await?;
        info!(
            heuristic_id = %saved.id,
            domain = %saved.domain,
            change = %change,
            version = saved.version,
            "stored heuristic"
        );
        Ok(saved.id)
    }

    /// Retrieve a rule, failing with `NotFound` for unknown ids
    pub async fn get(&self, id: HeuristicId) -> Result<Heuristic> {
        self.load(id).await
    }

    pub async fn find(&self, id: HeuristicId) -> Result<Option<Heuristic>> {
        self.backend.get_heuristic(id).await
    }

    /// Active same-domain rules nearest to `embedding`, with similarity
    pub async fn search(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        validate_embedding(embedding)?;
        domain.validate()?;

        let mut results = self.backend.search_conditions(embedding, domain, limit).await?;
        // the backend is trusted to filter, but the partition is enforced here too
        results.retain(|(h, _)| h.active && &h.domain == domain);
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    /// Candidates for a situation, ranked by similarity descending
    pub async fn find_matches(
        &self,
        embedding: &[f32],
        domain: &Domain,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        Ok(self
            .search(embedding, domain, limit)
            .await?
            .into_iter()
            .filter(|(h, _)| h.confidence() >= min_confidence)
            .map(|(h, similarity)| to_candidate(&h, similarity))
            .collect())
    }

    /// Active same-domain rules whose action resembles `embedding`
    pub async fn find_by_action(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<(Heuristic, f64)>> {
        validate_embedding(embedding)?;
        domain.validate()?;

        let mut results = self.backend.search_actions(embedding, domain, limit).await?;
        results.retain(|(h, _)| h.active && &h.domain == domain);
        Ok(results)
    }

    /// Highest-confidence active rules of a domain
    pub async fn top_by_confidence(&self, domain: &Domain, limit: usize) -> Result<Vec<Heuristic>> {
        let mut rules = self.backend.list_domain(domain).await?;
        rules.sort_by(|a, b| {
            b.confidence()
                .partial_cmp(&a.confidence())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rules.truncate(limit);
        Ok(rules)
    }

    /// Validate and apply a raw feedback signal
    pub async fn apply_feedback(
        &self,
        id: HeuristicId,
        positive: bool,
        magnitude: f64,
        source: FeedbackSource,
    ) -> Result<ConfidenceChange> {
        let magnitude = Magnitude::new(magnitude)?;
        self.apply_update(ConfidenceUpdate {
            heuristic_id: id,
            positive,
            magnitude,
            source,
        })
        .await
    }

    /// Apply a confidence update atomically and notify the sink
    pub async fn apply_update(&self, update: ConfidenceUpdate) -> Result<ConfidenceChange> {
        let _guard = self.lock(update.heuristic_id).await;
        let mut heuristic = self.load(update.heuristic_id).await?;

        let old_confidence = heuristic.confidence();
        heuristic.evidence = heuristic.evidence.apply(update.positive, update.magnitude);
        let saved = self.save(heuristic, ChangeType::ConfidenceUpdated).await?;

        let change = ConfidenceChange {
            heuristic_id: saved.id,
            old_confidence,
            new_confidence: saved.confidence(),
        };
        debug!(
            heuristic_id = %saved.id,
            positive = update.positive,
            magnitude = update.magnitude.get(),
            source = %update.source,
            old = change.old_confidence,
            new = change.new_confidence,
            "applied confidence update"
        );
        Ok(change)
    }

    /// Count an independently confirmed success; confidence is untouched
    pub async fn confirm_success(&self, id: HeuristicId) -> Result<()> {
        let _guard = self.lock(id).await;
        let mut heuristic = self.load(id).await?;
        heuristic.success_count += 1;
        self.save(heuristic, ChangeType::CountersUpdated).await?;
        Ok(())
    }

    /// Append a fire record and bump `fire_count`
    ///
    /// The counter is saved first. If the fire record cannot be written the
    /// counter is put back, so it never counts a fire that was not recorded.
    pub async fn record_fire(
        &self,
        heuristic_id: HeuristicId,
        situation_id: SituationId,
    ) -> Result<FireRecord> {
        let _guard = self.lock(heuristic_id).await;
        let mut heuristic = self.load(heuristic_id).await?;
        let fire_count = heuristic.fire_count;

        heuristic.fire_count += 1;
        let saved = self.save(heuristic, ChangeType::CountersUpdated).await?;

        let fire = FireRecord::new(heuristic_id, situation_id);
        if let Err(e) = self.backend.put_fire(&fire).await {
            let reverted = Heuristic {
                fire_count,
                ..saved
            };
            self.restore(reverted, ChangeType::CountersUpdated).await;
            return Err(e);
        }
        Ok(fire)
    }

    /// Resolve a pending fire record exactly once
    pub async fn resolve_fire(
        &self,
        fire_id: FireId,
        outcome: FireOutcome,
        source: FeedbackSource,
    ) -> Result<FireRecord> {
        let _guard = self.lock(fire_id).await;
        let mut fire = self.get_fire(fire_id).await?;

        fire.resolve(outcome, source)?;
        self.backend.put_fire(&fire).await?;
        debug!(fire_id = %fire.id, outcome = %outcome, source = %source, "resolved fire");
        Ok(fire)
    }

    /// Resolve a fire with a verdict and feed it back into the rule
    ///
    /// A second verdict for the same fire fails with `FireAlreadyResolved`
    /// before any confidence moves. The evidence and the success counter
    /// land in one rule write, and the fire is only marked resolved after
    /// that write. If marking the fire fails the rule write is undone and
    /// the fire stays pending, so the verdict can be sent again.
    pub async fn apply_outcome(
        &self,
        fire_id: FireId,
        positive: bool,
        magnitude: f64,
        source: FeedbackSource,
    ) -> Result<ConfidenceChange> {
        let magnitude = Magnitude::new(magnitude)?;
        // a fire never changes rule, so the id is safe to read unlocked
        let heuristic_id = self.get_fire(fire_id).await?.heuristic_id;
        let _guards = self.lock_pair(fire_id, heuristic_id).await;

        let mut fire = self.get_fire(fire_id).await?;
        fire.resolve(FireOutcome::from_positive(positive), source)?;

        let previous = self.load(heuristic_id).await?;
        let old_confidence = previous.confidence();
        let mut heuristic = previous.clone();
        heuristic.evidence = heuristic.evidence.apply(positive, magnitude);
        if positive && source.confirms_correctness() {
            heuristic.success_count += 1;
        }
        let saved = self.save(heuristic, ChangeType::ConfidenceUpdated).await?;

        if let Err(e) = self.backend.put_fire(&fire).await {
            let reverted = Heuristic {
                evidence: previous.evidence,
                success_count: previous.success_count,
                ..saved
            };
            self.restore(reverted, ChangeType::ConfidenceUpdated).await;
            return Err(e);
        }

        let change = ConfidenceChange {
            heuristic_id,
            old_confidence,
            new_confidence: saved.confidence(),
        };
        debug!(
            fire_id = %fire_id,
            heuristic_id = %heuristic_id,
            outcome = %fire.outcome,
            source = %source,
            old = change.old_confidence,
            new = change.new_confidence,
            "applied fire outcome"
        );
        Ok(change)
    }

    /// Undo a rule write whose companion fire write failed
    async fn restore(&self, heuristic: Heuristic, change: ChangeType) {
        let id = heuristic.id;
        if let Err(e) = self.save(heuristic, change).await {
            warn!(
                heuristic_id = %id,
                error = %e,
                "could not undo rule write after fire write failed"
            );
        }
    }

    pub async fn get_fire(&self, fire_id: FireId) -> Result<FireRecord> {
        self.backend
            .get_fire(fire_id)
            .await?
            .ok_or_else(|| ReflexError::fire_not_found(fire_id))
    }

    pub async fn fires_for(&self, heuristic_id: HeuristicId, limit: usize) -> Result<Vec<FireRecord>> {
        self.backend.fires_for(heuristic_id, limit).await
    }

    /// Enable or disable a rule; inactive rules never match
    pub async fn set_active(&self, id: HeuristicId, active: bool) -> Result<Heuristic> {
        let _guard = self.lock(id).await;
        let mut heuristic = self.load(id).await?;
        heuristic.active = active;
        let change = if active {
            ChangeType::Updated
        } else {
            ChangeType::Deactivated
        };
        self.save(heuristic, change).await
    }

    pub async fn delete(&self, id: HeuristicId) -> Result<()> {
        let _guard = self.lock(id).await;
        let heuristic = self.load(id).await?;
        self.backend.delete_heuristic(id).await?;
        self.notify(&heuristic, ChangeType::Deleted);
        info!(heuristic_id = %id, "deleted heuristic");
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        self.backend.count().await
    }
}

pub(crate) fn to_candidate(heuristic: &Heuristic, similarity: f64) -> Candidate {
    Candidate {
        heuristic_id: heuristic.id,
        condition_text: heuristic.condition.clone(),
        action_text: heuristic.action.clone(),
        confidence: heuristic.confidence(),
        similarity,
    }
}

fn validate_heuristic(heuristic: &Heuristic) -> Result<()> {
    if heuristic.condition.trim().is_empty() {
        return Err(ReflexError::InvalidArgument("condition must not be empty".into()));
    }
    if heuristic.action.trim().is_empty() {
        return Err(ReflexError::InvalidArgument("action must not be empty".into()));
    }
    heuristic.domain.validate()?;
    validate_embedding(&heuristic.condition_embedding)?;
    if let Some(action_embedding) = &heuristic.action_embedding {
        validate_embedding(action_embedding)?;
    }
    heuristic.evidence.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::confidence::Evidence;
    use crate::embedding::EMBEDDING_DIM;
    use crate::store::MemoryBackend;
    use crate::types::Origin;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: StdMutex<Vec<Invalidation>>,
        fail: bool,
    }

    impl InvalidationSink for RecordingSink {
        fn invalidate(&self, invalidation: &Invalidation) -> std::result::Result<(), CacheError> {
            self.seen.lock().unwrap().push(invalidation.clone());
            if self.fail {
                Err(CacheError::Unavailable("sink down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    fn rule(domain: &str) -> Heuristic {
        Heuristic::new("smoke detected", axis(0), "open window", domain, Origin::Seeded)
    }

    fn store_with_sink() -> (ConditionStore, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let store = ConditionStore::new(Arc::new(MemoryBackend::new())).with_sink(sink.clone());
        (store, sink)
    }

    #[tokio::test]
    async fn test_upsert_creates_with_version_one() {
        let (store, sink) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.version, 1);
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].change, ChangeType::Created);
    }

    #[tokio::test]
    async fn test_upsert_existing_keeps_evidence_and_counters() {
        let (store, _) = store_with_sink();
        let h = rule("home");
        let id = store.upsert(h.clone()).await.unwrap();
        store
            .apply_feedback(id, true, 1.0, FeedbackSource::Explicit)
            .await
            .unwrap();
        store.record_fire(id, SituationId::from("s")).await.unwrap();

        let mut edited = h.clone();
        edited.action = "open all windows".into();
        edited.evidence = Evidence::new(50.0, 1.0).unwrap();
        store.upsert(edited).await.unwrap();

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.action, "open all windows");
        assert!((stored.evidence.alpha - 2.0).abs() < 1e-12);
        assert_eq!(stored.fire_count, 1);
        assert_eq!(stored.version, 4);
    }

    #[tokio::test]
    async fn test_upsert_rejects_malformed_input() {
        let (store, sink) = store_with_sink();

        let mut bad_dim = rule("home");
        bad_dim.condition_embedding = vec![1.0; 12];
        assert!(matches!(
            store.upsert(bad_dim).await,
            Err(ReflexError::InvalidArgument(_))
        ));

        let mut nan_action = rule("home");
        let mut emb = axis(1);
        emb[3] = f32::NAN;
        nan_action.action_embedding = Some(emb);
        assert!(store.upsert(nan_action).await.is_err());

        assert!(store.upsert(rule("")).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_feedback_moves_confidence() {
        let (store, sink) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();

        let up = store
            .apply_feedback(id, true, 0.41, FeedbackSource::Endorsement)
            .await
            .unwrap();
        assert!((up.old_confidence - 0.5).abs() < 1e-12);
        assert!((up.new_confidence - 1.41 / 2.41).abs() < 1e-9);

        let down = store
            .apply_feedback(id, false, 0.2, FeedbackSource::Explicit)
            .await
            .unwrap();
        assert!(down.delta() < 0.0);

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().change, ChangeType::ConfidenceUpdated);
    }

    #[tokio::test]
    async fn test_apply_feedback_rejects_bad_magnitude_without_writing() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();

        for magnitude in [0.0, -0.5, 1.5, f64::NAN] {
            let err = store
                .apply_feedback(id, true, magnitude, FeedbackSource::Explicit)
                .await
                .unwrap_err();
            assert!(matches!(err, ReflexError::InvalidArgument(_)));
        }
        assert_eq!(store.get(id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (store, _) = store_with_sink();
        let missing = Uuid::now_v7();
        assert!(matches!(
            store.get(missing).await,
            Err(ReflexError::NotFound { .. })
        ));
        assert!(matches!(
            store
                .apply_feedback(missing, true, 1.0, FeedbackSource::Explicit)
                .await,
            Err(ReflexError::NotFound { .. })
        ));
        assert!(matches!(
            store
                .resolve_fire(missing, FireOutcome::Success, FeedbackSource::Explicit)
                .await,
            Err(ReflexError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_fire_leaves_confidence_alone() {
        let (store, sink) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();
        let before = store.get(id).await.unwrap().confidence();

        let fire = store.record_fire(id, SituationId::from("s-1")).await.unwrap();
        assert!(fire.is_pending());

        let after = store.get(id).await.unwrap();
        assert_eq!(after.fire_count, 1);
        assert_eq!(after.success_count, 0);
        assert_eq!(after.confidence(), before);
        assert_eq!(
            sink.seen.lock().unwrap().last().unwrap().change,
            ChangeType::CountersUpdated
        );
    }

    #[tokio::test]
    async fn test_resolve_fire_only_once() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();
        let fire = store.record_fire(id, SituationId::from("s-1")).await.unwrap();

        let resolved = store
            .resolve_fire(fire.id, FireOutcome::Success, FeedbackSource::Explicit)
            .await
            .unwrap();
        assert_eq!(resolved.outcome, FireOutcome::Success);

        let err = store
            .resolve_fire(fire.id, FireOutcome::Failure, FeedbackSource::Explicit)
            .await
            .unwrap_err();
        assert!(matches!(err, ReflexError::FireAlreadyResolved(_)));
        assert_eq!(store.get_fire(fire.id).await.unwrap().outcome, FireOutcome::Success);
    }

    #[tokio::test]
    async fn test_apply_outcome_counts_confirmed_success() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();
        let fire = store.record_fire(id, SituationId::from("s-1")).await.unwrap();

        let change = store
            .apply_outcome(fire.id, true, 1.0, FeedbackSource::Explicit)
            .await
            .unwrap();
        assert!(change.delta() > 0.0);

        let h = store.get(id).await.unwrap();
        assert_eq!(h.success_count, 1);
        assert_eq!(
            store.get_fire(fire.id).await.unwrap().feedback_source,
            Some(FeedbackSource::Explicit)
        );

        let err = store
            .apply_outcome(fire.id, true, 1.0, FeedbackSource::Explicit)
            .await
            .unwrap_err();
        assert!(matches!(err, ReflexError::FireAlreadyResolved(_)));
        assert_eq!(store.get(id).await.unwrap().evidence, h.evidence);
    }

    #[tokio::test]
    async fn test_apply_outcome_negative_or_endorsed_does_not_count_success() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();

        let wrong = store.record_fire(id, SituationId::from("s-1")).await.unwrap();
        store
            .apply_outcome(wrong.id, false, 1.0, FeedbackSource::Implicit)
            .await
            .unwrap();
        let agreed = store.record_fire(id, SituationId::from("s-2")).await.unwrap();
        store
            .apply_outcome(agreed.id, true, 0.4, FeedbackSource::Endorsement)
            .await
            .unwrap();

        let h = store.get(id).await.unwrap();
        assert_eq!(h.success_count, 0);
        assert_eq!(h.fire_count, 2);
        assert_eq!(
            store.get_fire(wrong.id).await.unwrap().outcome,
            FireOutcome::Failure
        );
    }

    #[tokio::test]
    async fn test_apply_outcome_bad_magnitude_leaves_fire_pending() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();
        let fire = store.record_fire(id, SituationId::from("s-1")).await.unwrap();

        assert!(store
            .apply_outcome(fire.id, true, 2.0, FeedbackSource::Explicit)
            .await
            .is_err());
        assert!(store.get_fire(fire.id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_confirm_success_only_touches_counter() {
        let (store, _) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();
        store.confirm_success(id).await.unwrap();

        let h = store.get(id).await.unwrap();
        assert_eq!(h.success_count, 1);
        assert_eq!(h.evidence, Evidence::uniform());
    }

    #[tokio::test]
    async fn test_find_matches_filters_domain_and_confidence() {
        let (store, _) = store_with_sink();
        let home = store.upsert(rule("home")).await.unwrap();
        store.upsert(rule("garage")).await.unwrap();

        let found = store
            .find_matches(&axis(0), &Domain::new("home"), 0.0, 5)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].heuristic_id, home);

        let strict = store
            .find_matches(&axis(0), &Domain::new("home"), 0.9, 5)
            .await
            .unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn test_set_active_and_delete() {
        let (store, sink) = store_with_sink();
        let id = store.upsert(rule("home")).await.unwrap();

        store.set_active(id, false).await.unwrap();
        assert!(store
            .find_matches(&axis(0), &Domain::new("home"), 0.0, 5)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            sink.seen.lock().unwrap().last().unwrap().change,
            ChangeType::Deactivated
        );

        store.delete(id).await.unwrap();
        assert!(store.find(id).await.unwrap().is_none());
        assert!(matches!(store.delete(id).await, Err(ReflexError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_top_by_confidence_orders_domain_rules() {
        let (store, _) = store_with_sink();
        let low = store.upsert(rule("home")).await.unwrap();
        let high = store
            .upsert(rule("home").with_evidence(Evidence::new(9.0, 1.0).unwrap()))
            .await
            .unwrap();

        let top = store.top_by_confidence(&Domain::new("home"), 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, high);
        assert_ne!(top[0].id, low);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_write() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let store = ConditionStore::new(Arc::new(MemoryBackend::new())).with_sink(sink.clone());

        let id = store.upsert(rule("home")).await.unwrap();
        store
            .apply_feedback(id, true, 1.0, FeedbackSource::Explicit)
            .await
            .unwrap();
        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_land() {
        let store = Arc::new(ConditionStore::new(Arc::new(MemoryBackend::new())));
        let id = store.upsert(rule("home")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply_feedback(id, true, 0.5, FeedbackSource::Endorsement)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let h = store.get(id).await.unwrap();
        assert!((h.evidence.alpha - 11.0).abs() < 1e-9);
        assert_eq!(h.version, 21);
    }
}
