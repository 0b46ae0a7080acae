//! At-most-once posting per correlation id.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, request, secs, Harness, Scripts};
use revo_core::agents::fakes::{sample_metadata, ScriptedRepository, Step};
use revo_core::supervisor::Admission;
use revo_core::{
    idempotency_token, ConsolidatedReview, CorrelationId, DeliveryGate, DeliverySettings,
    Locator, ReviewComment, Severity, StageKind,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn review(id: &str) -> ConsolidatedReview {
    ConsolidatedReview {
        correlation_id: id.into(),
        repository: common::REPO.into(),
        change_id: common::CHANGE.into(),
        title: Some("Add cache".into()),
        comments: vec![],
        summary: "0 code finding(s)".into(),
        degraded_stages: vec![],
    }
}

fn far() -> Instant {
    Instant::now() + secs(3600)
}

#[tokio::test(start_paused = true)]
async fn test_two_deliveries_post_once_and_return_identical_acks() {
    let repo = Arc::new(ScriptedRepository::new(sample_metadata(common::REPO, common::CHANGE)));
    let gate = DeliveryGate::new(repo.clone(), DeliverySettings::default(), secs(3600));
    let id = CorrelationId::from("corr-twice");
    let cancel = CancellationToken::new();

    let first = gate.deliver(&id, &review("corr-twice"), far(), &cancel).await.unwrap();
    let second = gate.deliver(&id, &review("corr-twice"), far(), &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(repo.post_calls(), 1);
    assert_eq!(first.idempotency_token, idempotency_token(&id));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicate_deliveries_post_once() {
    let repo = Arc::new(
        ScriptedRepository::new(sample_metadata(common::REPO, common::CHANGE))
            .with_post_script(vec![Step::ok("receipt-slow".to_string()).after(secs(1))]),
    );
    let gate = Arc::new(DeliveryGate::new(
        repo.clone(),
        DeliverySettings::default(),
        secs(3600),
    ));
    let id = CorrelationId::from("corr-race");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let id = id.clone();
            tokio::spawn(async move {
                gate.deliver(&id, &review("corr-race"), far(), &CancellationToken::new())
                    .await
            })
        })
        .collect();

    let mut acks = Vec::new();
    for h in handles {
        acks.push(h.await.unwrap().unwrap());
    }
    assert_eq!(repo.post_calls(), 1);
    assert!(acks.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(acks[0].receipt_id, "receipt-slow");
}

#[tokio::test(start_paused = true)]
async fn test_second_delivery_with_different_review_returns_first_ack() {
    let repo = Arc::new(ScriptedRepository::new(sample_metadata(common::REPO, common::CHANGE)));
    let gate = DeliveryGate::new(repo.clone(), DeliverySettings::default(), secs(3600));
    let id = CorrelationId::from("corr-changed");
    let original = review("corr-changed");
    let mut revised = review("corr-changed");
    revised.summary = "1 code finding(s)".into();
    revised.comments.push(ReviewComment {
        position: 1,
        source: StageKind::AnalyzeCode,
        locator: Some(Locator::new("src/cache.rs", 3)),
        severity: Some(Severity::Warning),
        body: "unbounded growth".into(),
        supplements: None,
    });
    assert_ne!(original.digest(), revised.digest());

    let first = gate
        .deliver(&id, &original, far(), &CancellationToken::new())
        .await
        .unwrap();
    let second = gate
        .deliver(&id, &revised, far(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(repo.post_calls(), 1);
    assert_eq!(first, second);
    assert_eq!(second.review_digest, original.digest());
    assert_eq!(repo.accepted_posts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_correlation_ids_post_separately() {
    let repo = Arc::new(ScriptedRepository::new(sample_metadata(common::REPO, common::CHANGE)));
    let gate = DeliveryGate::new(repo.clone(), DeliverySettings::default(), secs(3600));

    let a = gate
        .deliver(&"corr-a".into(), &review("corr-a"), far(), &CancellationToken::new())
        .await
        .unwrap();
    let b = gate
        .deliver(&"corr-b".into(), &review("corr-b"), far(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(repo.post_calls(), 2);
    assert_ne!(a.idempotency_token, b.idempotency_token);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transient_failures_keep_one_token() {
    let repo = Arc::new(
        ScriptedRepository::new(sample_metadata(common::REPO, common::CHANGE)).with_post_script(
            vec![Step::err(revo_core::AgentError::Timeout { elapsed_ms: 100 })],
        ),
    );
    let settings = DeliverySettings {
        max_attempts: 4,
        backoff_base_ms: 10,
        backoff_ceiling_ms: 40,
        ..DeliverySettings::default()
    };
    let gate = DeliveryGate::new(repo.clone(), settings, secs(3600));

    let err = gate
        .deliver(
            &"corr-flaky".into(),
            &review("corr-flaky"),
            far(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        revo_core::OrchestratorError::DeliveryFailure { attempts: 4, .. }
    ));
    assert_eq!(repo.post_calls(), 4);
    assert!(repo.accepted_posts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_review_of_finished_request_does_not_repost() {
    let harness = Harness::new(Scripts::default());
    let sup = harness.supervisor(config());

    let first = sup.review(request("corr-again")).await.unwrap();
    let acceptance = sup.submit(request("corr-again")).unwrap();
    assert_eq!(acceptance.admission, Admission::Finished);
    let second = sup.review(request("corr-again")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.repo.post_calls(), 1);
    assert_eq!(harness.analyzer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_retries_do_not_cause_extra_posts() {
    let harness = Harness::new(Scripts {
        analyzer: vec![
            Step::err(common::unreachable()),
            Step::err(common::unreachable()),
            Step::ok(common::report(1)),
        ],
        posts: vec![
            Step::err(common::unreachable()).after(Duration::from_millis(10)),
            Step::ok("receipt-7".into()),
        ],
        ..Scripts::default()
    });
    let sup = harness.supervisor(config());

    let outcome = sup.review(request("corr-retry")).await.unwrap();

    assert_eq!(harness.analyzer.calls(), 3);
    assert_eq!(harness.repo.post_calls(), 2);
    let accepted = harness.repo.accepted_posts();
    assert_eq!(accepted.len(), 1);
    let ack = outcome.ack.unwrap();
    assert_eq!(ack.receipt_id, "receipt-7");
    assert_eq!(ack.review_digest, outcome.review.digest());
    assert_eq!(accepted[0].idempotency_token, ack.idempotency_token);
}
