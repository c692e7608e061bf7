//! Post-answer learning: endorsements and fired-rule verification
//!
//! After a deferred situation has been answered, the reasoner's answer is
//! compared with the action of every candidate that was shown and of the
//! nearest same-domain rules by action similarity. Close matches earn a weak
//! positive update. A reasoner that happens to phrase things differently is
//! not evidence against a rule, so nothing is penalized unless
//! `unendorsed_penalty` is configured.
//!
//! The same background worker runs domain-evaluator checks queued when a
//! rule fires. Jobs arrive over an unbounded channel so the decision path
//! never waits on this work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::confidence::{ConfidenceChange, ConfidenceUpdate, FeedbackSource, Magnitude};
use crate::config::BootstrapConfig;
use crate::embedding::{Embedder, cosine_similarity, validate_embedding};
use crate::error::{ReflexError, Result};
use crate::reasoner::DomainEvaluator;
use crate::store::ConditionStore;
use crate::types::{Candidate, Domain, FireId, FireOutcome, Heuristic, HeuristicId};

/// Work handed to the background worker
pub enum BootstrapJob {
    /// Compare a reasoner answer with candidate actions
    Endorse {
        domain: Domain,
        answer: String,
        shown: Vec<Candidate>,
    },
    /// Ask a domain evaluator whether a fired action was correct
    Verify {
        fire_id: FireId,
        situation: String,
        action: String,
        evaluator: Arc<dyn DomainEvaluator>,
    },
}

impl BootstrapJob {
    fn kind(&self) -> &'static str {
        match self {
            Self::Endorse { .. } => "endorse",
            Self::Verify { .. } => "verify",
        }
    }
}

/// Turns reasoner answers and evaluator verdicts into confidence updates
pub struct BootstrapEvaluator {
    store: Arc<ConditionStore>,
    embedder: Arc<dyn Embedder>,
    config: BootstrapConfig,
}

impl BootstrapEvaluator {
    pub fn new(
        store: Arc<ConditionStore>,
        embedder: Arc<dyn Embedder>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn run(&self, job: BootstrapJob) -> Result<()> {
        match job {
            BootstrapJob::Endorse {
                domain,
                answer,
                shown,
            } => {
                self.endorse(&domain, &answer, &shown).await?;
            }
            BootstrapJob::Verify {
                fire_id,
                situation,
                action,
                evaluator,
            } => {
                self.verify(fire_id, &situation, &action, evaluator.as_ref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Compare `answer` with the shown candidates and the nearest
    /// same-domain actions, applying endorsements
    pub async fn endorse(
        &self,
        domain: &Domain,
        answer: &str,
        shown: &[Candidate],
    ) -> Result<Vec<ConfidenceChange>> {
        let answer_embedding = self.embedder.embed(answer).await?;
        validate_embedding(&answer_embedding)?;

        // heuristic id -> (similarity to the answer, was it shown)
        let mut targets: HashMap<HeuristicId, (f64, bool)> = HashMap::new();

        if self.config.broad_search_limit > 0 {
            for (heuristic, similarity) in self
                .store
                .find_by_action(&answer_embedding, domain, self.config.broad_search_limit)
                .await?
            {
                targets.insert(heuristic.id, (similarity, false));
            }
        }

        for candidate in shown {
            if let Some(target) = targets.get_mut(&candidate.heuristic_id) {
                target.1 = true;
                continue;
            }
            let Some(heuristic) = self.store.find(candidate.heuristic_id).await? else {
                continue;
            };
            if !heuristic.active || &heuristic.domain != domain {
                continue;
            }
            match self.action_similarity(&heuristic, &answer_embedding).await {
                Ok(similarity) => {
                    targets.insert(heuristic.id, (similarity, true));
                }
                Err(e) => {
                    warn!(heuristic_id = %heuristic.id, error = %e, "could not embed action");
                }
            }
        }

        let mut changes = Vec::new();
        for (heuristic_id, (similarity, was_shown)) in targets {
            let update = if similarity >= self.config.endorsement_threshold {
                Magnitude::saturating(self.config.endorsement_weight * similarity).map(|m| {
                    ConfidenceUpdate::positive(heuristic_id, m, FeedbackSource::Endorsement)
                })
            } else if was_shown && self.config.unendorsed_penalty > 0.0 {
                Magnitude::saturating(self.config.unendorsed_penalty).map(|m| {
                    ConfidenceUpdate::negative(heuristic_id, m, FeedbackSource::Endorsement)
                })
            } else {
                None
            };
            let Some(update) = update else {
                continue;
            };

            match self.store.apply_update(update).await {
                Ok(change) => {
                    info!(
                        heuristic_id = %heuristic_id,
                        similarity,
                        positive = update.positive,
                        old = change.old_confidence,
                        new = change.new_confidence,
                        "applied endorsement"
                    );
                    changes.push(change);
                }
                // deleted between search and update
                Err(ReflexError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(heuristic_id = %heuristic_id, error = %e, "endorsement update failed");
                }
            }
        }

        Ok(changes)
    }

    async fn action_similarity(&self, heuristic: &Heuristic, answer: &[f32]) -> Result<f64> {
        let action_embedding = match &heuristic.action_embedding {
            Some(embedding) => embedding.clone(),
            None => self.embedder.embed(&heuristic.action).await?,
        };
        Ok(cosine_similarity(answer, &action_embedding))
    }

    /// Resolve a fire with the evaluator's verdict
    pub async fn verify(
        &self,
        fire_id: FireId,
        situation: &str,
        action: &str,
        evaluator: &dyn DomainEvaluator,
    ) -> Result<()> {
        let verdict = evaluator.verify(situation, action).await;
        let result = match verdict {
            Some(correct) => self
                .store
                .apply_outcome(fire_id, correct, Magnitude::FULL.get(), FeedbackSource::Implicit)
                .await
                .map(|_| ()),
            None => self
                .store
                .resolve_fire(fire_id, FireOutcome::Unknown, FeedbackSource::Implicit)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                debug!(fire_id = %fire_id, ?verdict, "verified fire");
                Ok(())
            }
            // explicit feedback got there first
            Err(ReflexError::FireAlreadyResolved(_)) => {
                debug!(fire_id = %fire_id, "fire already resolved, verdict dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Count of queued or running jobs with an idle signal
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to the detached bootstrap worker
pub struct BootstrapWorker {
    tx: mpsc::UnboundedSender<BootstrapJob>,
    pending: Arc<Pending>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapWorker {
    /// Spawn the worker on the current runtime
    pub fn spawn(evaluator: Arc<BootstrapEvaluator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker_loop(
            rx,
            evaluator,
            pending.clone(),
            shutdown.clone(),
        ));

        Self {
            tx,
            pending,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a job; never blocks
    pub fn submit(&self, job: BootstrapJob) {
        let kind = job.kind();
        self.pending.add();
        if self.tx.send(job).is_err() {
            self.pending.done();
            warn!(kind, "bootstrap worker stopped, job dropped");
        }
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Resolve once every submitted job has finished
    pub async fn wait_idle(&self) {
        self.pending.wait().await;
    }

    /// Stop after the queued jobs have run
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "bootstrap worker panicked");
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<BootstrapJob>,
    evaluator: Arc<BootstrapEvaluator>,
    pending: Arc<Pending>,
    shutdown: CancellationToken,
) {
    debug!("bootstrap worker starting");

    loop {
        tokio::select! {
            biased;

            job = rx.recv() => match job {
                Some(job) => process(&evaluator, &pending, job).await,
                None => break,
            },

            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    process(&evaluator, &pending, job).await;
                }
                break;
            }
        }
    }

    debug!("bootstrap worker stopped");
}

async fn process(evaluator: &BootstrapEvaluator, pending: &Pending, job: BootstrapJob) {
    let kind = job.kind();
    if let Err(e) = evaluator.run(job).await {
        warn!(kind, error = %e, "bootstrap job failed");
    }
    pending.done();
}
