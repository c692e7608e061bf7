//! Shared fakes for engine integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reflex_engine::{
    Domain, EMBEDDING_DIM, Embedder, EmbedderResult, FireId, FireRecord, Heuristic,
    HeuristicBackend, HeuristicId, MemoryBackend, Reasoner, ReasonerError, ReasoningRequest,
    ReflexError,
};
use tokio::sync::Semaphore;

/// Unit vector along one axis
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[i] = 1.0;
    v
}

/// Unit vector whose cosine with `axis(a)` is `similarity`
pub fn mix(a: usize, b: usize, similarity: f32) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[a] = similarity;
    v[b] = (1.0 - similarity * similarity).sqrt();
    v
}

/// Embedder with a fixed phrase table
///
/// Unknown phrases land on axes 200 and up so they stay unrelated to the
/// table. A held phrase blocks until a permit is released.
#[derive(Default)]
pub struct ScriptedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    held: Option<(String, Arc<Semaphore>)>,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phrase(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    pub fn hold(mut self, text: &str, gate: Arc<Semaphore>) -> Self {
        self.held = Some((text.to_string(), gate));
        self
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        if let Some((held, gate)) = &self.held
            && held == text
        {
            let _permit = gate.acquire().await.ok();
        }
        Ok(match self.vectors.get(text) {
            Some(v) => v.clone(),
            None => axis(200 + text.bytes().map(usize::from).sum::<usize>() % 150),
        })
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Reasoner answering from a queue and recording what it was shown
pub struct QueueReasoner {
    answers: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<ReasoningRequest>>,
    pub calls: AtomicUsize,
    delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl QueueReasoner {
    pub fn new(answers: &[&str]) -> Arc<Self> {
        Self::with_delay(answers, Duration::ZERO)
    }

    pub fn with_delay(answers: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ReasoningRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Reasoner for QueueReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> Result<String, ReasonerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let answer = self.answers.lock().unwrap().pop_front();
        answer.ok_or_else(|| ReasonerError::Failed("out of answers".into()))
    }
}

/// Memory backend that counts similarity searches
#[derive(Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    pub condition_searches: AtomicUsize,
}

impl CountingBackend {
    pub fn searches(&self) -> usize {
        self.condition_searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeuristicBackend for CountingBackend {
    async fn put_heuristic(&self, heuristic: &Heuristic) -> reflex_engine::Result<()> {
        self.inner.put_heuristic(heuristic).await
    }

    async fn get_heuristic(&self, id: HeuristicId) -> reflex_engine::Result<Option<Heuristic>> {
        self.inner.get_heuristic(id).await
    }

    async fn delete_heuristic(&self, id: HeuristicId) -> reflex_engine::Result<bool> {
        self.inner.delete_heuristic(id).await
    }

    async fn search_conditions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> reflex_engine::Result<Vec<(Heuristic, f64)>> {
        self.condition_searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search_conditions(embedding, domain, limit).await
    }

    async fn search_actions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> reflex_engine::Result<Vec<(Heuristic, f64)>> {
        self.inner.search_actions(embedding, domain, limit).await
    }

    async fn list_domain(&self, domain: &Domain) -> reflex_engine::Result<Vec<Heuristic>> {
        self.inner.list_domain(domain).await
    }

    async fn put_fire(&self, fire: &FireRecord) -> reflex_engine::Result<()> {
        self.inner.put_fire(fire).await
    }

    async fn get_fire(&self, id: FireId) -> reflex_engine::Result<Option<FireRecord>> {
        self.inner.get_fire(id).await
    }

    async fn fires_for(
        &self,
        heuristic_id: HeuristicId,
        limit: usize,
    ) -> reflex_engine::Result<Vec<FireRecord>> {
        self.inner.fires_for(heuristic_id, limit).await
    }

    async fn count(&self) -> reflex_engine::Result<u64> {
        self.inner.count().await
    }
}

/// Memory backend whose writes and reads can be made to fail
///
/// Each counter is the number of upcoming calls of that kind that fail with
/// `Unavailable`; reads fail while `fail_reads` is set.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    pub failing_heuristic_writes: AtomicUsize,
    pub failing_fire_writes: AtomicUsize,
    pub fail_reads: AtomicBool,
}

impl FlakyBackend {
    pub fn fail_heuristic_writes(&self, n: usize) {
        self.failing_heuristic_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_fire_writes(&self, n: usize) {
        self.failing_fire_writes.store(n, Ordering::SeqCst);
    }

    pub fn set_reads_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> reflex_engine::Result<()> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(ReflexError::Unavailable("db down".into())),
            Err(_) => Ok(()),
        }
    }

    fn check_reads(&self) -> reflex_engine::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(ReflexError::Unavailable("db down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HeuristicBackend for FlakyBackend {
    async fn put_heuristic(&self, heuristic: &Heuristic) -> reflex_engine::Result<()> {
        Self::trip(&self.failing_heuristic_writes)?;
        self.inner.put_heuristic(heuristic).await
    }

    async fn get_heuristic(&self, id: HeuristicId) -> reflex_engine::Result<Option<Heuristic>> {
        self.check_reads()?;
        self.inner.get_heuristic(id).await
    }

    async fn delete_heuristic(&self, id: HeuristicId) -> reflex_engine::Result<bool> {
        self.inner.delete_heuristic(id).await
    }

    async fn search_conditions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> reflex_engine::Result<Vec<(Heuristic, f64)>> {
        self.check_reads()?;
        self.inner.search_conditions(embedding, domain, limit).await
    }

    async fn search_actions(
        &self,
        embedding: &[f32],
        domain: &Domain,
        limit: usize,
    ) -> reflex_engine::Result<Vec<(Heuristic, f64)>> {
        self.check_reads()?;
        self.inner.search_actions(embedding, domain, limit).await
    }

    async fn list_domain(&self, domain: &Domain) -> reflex_engine::Result<Vec<Heuristic>> {
        self.check_reads()?;
        self.inner.list_domain(domain).await
    }

    async fn put_fire(&self, fire: &FireRecord) -> reflex_engine::Result<()> {
        Self::trip(&self.failing_fire_writes)?;
        self.inner.put_fire(fire).await
    }

    async fn get_fire(&self, id: FireId) -> reflex_engine::Result<Option<FireRecord>> {
        self.check_reads()?;
        self.inner.get_fire(id).await
    }

    async fn fires_for(
        &self,
        heuristic_id: HeuristicId,
        limit: usize,
    ) -> reflex_engine::Result<Vec<FireRecord>> {
        self.check_reads()?;
        self.inner.fires_for(heuristic_id, limit).await
    }

    async fn count(&self) -> reflex_engine::Result<u64> {
        self.inner.count().await
    }
}
