//! Engine behavior when the backend fails partway through a write

mod common;

use std::sync::Arc;

use common::{FlakyBackend, ScriptedEmbedder, axis};
use reflex_engine::{
    ChangeType, DecisionPath, Domain, Evidence, FeedbackSource, FireOutcome, HeuristicId,
    NewHeuristic, ReflexEngine, Situation,
};

async fn setup() -> (ReflexEngine, Arc<FlakyBackend>, HeuristicId) {
    let backend = Arc::new(FlakyBackend::default());
    let embedder = ScriptedEmbedder::new()
        .phrase("kitchen smoke", axis(0))
        .phrase("smoke in the kitchen", axis(0))
        .phrase("open the window", axis(1));
    let engine = ReflexEngine::builder(Arc::new(embedder))
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let id = engine
        .learn(
            NewHeuristic::new("kitchen smoke", "open the window", "home")
                .with_evidence(Evidence::new(9.0, 1.0).unwrap()),
        )
        .await
        .unwrap();
    (engine, backend, id)
}

fn kitchen() -> Situation {
    Situation::new("smoke in the kitchen", "home")
}

#[tokio::test]
async fn test_failed_rule_write_keeps_fire_open_for_retry() {
    let (engine, backend, id) = setup().await;
    let fire_id = engine.evaluate(&kitchen()).await.unwrap().fire_id.unwrap();

    backend.fail_heuristic_writes(1);
    let err = engine.record_explicit_feedback(fire_id, true).await.unwrap_err();
    assert!(err.is_unavailable());

    assert!(engine.store().get_fire(fire_id).await.unwrap().is_pending());
    let rule = engine.get_heuristic(id).await.unwrap();
    assert!((rule.evidence.alpha - 9.0).abs() < 1e-9);
    assert_eq!(rule.success_count, 0);

    engine.record_explicit_feedback(fire_id, true).await.unwrap();
    let rule = engine.get_heuristic(id).await.unwrap();
    assert!((rule.evidence.alpha - 10.0).abs() < 1e-9);
    assert_eq!(rule.success_count, 1);
    let fire = engine.store().get_fire(fire_id).await.unwrap();
    assert_eq!(fire.outcome, FireOutcome::Success);
    assert_eq!(fire.feedback_source, Some(FeedbackSource::Explicit));
}

#[tokio::test]
async fn test_failed_fire_write_undoes_rule_update() {
    let (engine, backend, id) = setup().await;
    let fire_id = engine.evaluate(&kitchen()).await.unwrap().fire_id.unwrap();

    backend.fail_fire_writes(1);
    assert!(engine.record_explicit_feedback(fire_id, false).await.is_err());

    let rule = engine.get_heuristic(id).await.unwrap();
    assert!((rule.evidence.alpha - 9.0).abs() < 1e-9);
    assert!((rule.evidence.beta - 1.0).abs() < 1e-9);
    assert!(engine.store().get_fire(fire_id).await.unwrap().is_pending());

    engine.record_explicit_feedback(fire_id, false).await.unwrap();
    let rule = engine.get_heuristic(id).await.unwrap();
    assert!((rule.evidence.beta - 2.0).abs() < 1e-9);
    assert_eq!(
        engine.store().get_fire(fire_id).await.unwrap().outcome,
        FireOutcome::Failure
    );
}

#[tokio::test]
async fn test_unrecorded_fire_leaves_no_count_behind() {
    let (engine, backend, id) = setup().await;

    backend.fail_fire_writes(1);
    let decision = engine.evaluate(&kitchen()).await.unwrap();
    // no reasoner to defer to
    assert_eq!(decision.path, DecisionPath::Rejected);
    assert_eq!(engine.get_heuristic(id).await.unwrap().fire_count, 0);
    assert!(engine.fires_for(id, 10).await.unwrap().is_empty());

    assert!(engine.evaluate(&kitchen()).await.unwrap().is_fired());
    assert_eq!(engine.get_heuristic(id).await.unwrap().fire_count, 1);
}

#[tokio::test]
async fn test_invalidation_does_not_need_the_store() {
    let (engine, backend, id) = setup().await;
    assert_eq!(engine.warm_cache(&Domain::new("home")).await.unwrap(), 1);
    assert_eq!(engine.list_cached().unwrap().len(), 1);

    backend.set_reads_failing(true);
    engine
        .invalidate_cache(id, ChangeType::ConfidenceUpdated)
        .await
        .unwrap();
    assert!(engine.list_cached().unwrap().is_empty());

    backend.set_reads_failing(false);
    assert!(engine.evaluate(&kitchen()).await.unwrap().is_fired());
}
