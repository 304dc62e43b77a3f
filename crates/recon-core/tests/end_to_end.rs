mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use common::*;
use recon_core::store::{Layer, Record, Store};
use recon_core::{ActionType, OutcomeKind, ProviderError, ProviderErrorKind, SkipCause, SkipReason};

#[tokio::test]
async fn seeded_wallet_emits_once_then_rests() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let feed = TransferFeed::new(12);
    let r = reconciler(&store, wallet_config(&["W"]), feed.clone());

    let first = r.run_cycle(t0()).await;
    assert_eq!(first.action_type, Some(ActionType::WalletRecon));
    assert_eq!(first.target.as_deref(), Some("W"));
    assert_eq!(first.outcome, OutcomeKind::Success);
    assert!(first.emitted);
    assert_eq!(first.event_count, 12);

    let artifact_id = first.artifact_id.clone().unwrap();
    let artifact = match store.get(Layer::Artifacts, &artifact_id).unwrap() {
        Some(Record::Artifact(a)) => a,
        other => panic!("artifact missing: {other:?}"),
    };
    assert_eq!(artifact.event_count, 12);
    assert_eq!(artifact.source_ids.len(), 12);
    assert!((artifact.signals["activity_score"] - 0.8).abs() < 1e-9);
    assert_eq!(store.cursor("wallet_recon", "W").unwrap(), Some(t0()));

    let second = r.run_cycle(t0() + Duration::hours(1)).await;
    assert_eq!(
        second.outcome,
        OutcomeKind::Skipped {
            reason: SkipCause::NoTargets
        }
    );
    assert!(!second.emitted);
    assert_eq!(store.cursor("wallet_recon", "W").unwrap(), Some(t0()));
    assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_invocation_at_same_instant_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(12));
    r.run_cycle(t0()).await;
    let before = store.status().unwrap();
    let again = r.run_cycle(t0()).await;
    assert_eq!(
        again.outcome,
        OutcomeKind::Skipped {
            reason: SkipCause::NoTargets
        }
    );
    let after = store.status().unwrap();
    assert_eq!(before.scratch, after.scratch);
    assert_eq!(before.events, after.events);
    assert_eq!(before.artifacts, after.artifacts);
}

#[tokio::test]
async fn cooldown_blocks_second_brief_but_cursor_still_moves() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(12));
    assert!(r.run_cycle(t0()).await.emitted);

    let later = t0() + Duration::hours(3);
    let out = r.run_cycle(later).await;
    assert_eq!(out.outcome, OutcomeKind::Success);
    assert!(!out.emitted);
    assert!(matches!(out.gate, Some(SkipReason::CoolingDown { .. })));
    assert_eq!(out.event_count, 24);
    assert_eq!(store.cursor("wallet_recon", "W").unwrap(), Some(later));
    assert_eq!(store.status().unwrap().artifacts, 1);

    let much_later = t0() + Duration::hours(7);
    let out = r.run_cycle(much_later).await;
    assert!(out.emitted);
    assert_eq!(store.status().unwrap().artifacts, 2);
}

#[tokio::test]
async fn exhausted_chain_degrades_and_keeps_target_stale() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(
        &store,
        wallet_config(&["W"]),
        Arc::new(DownFeed(ProviderError::NotFound("no such wallet".into()))),
    );
    let out = r.run_cycle(t0()).await;
    assert_eq!(
        out.outcome,
        OutcomeKind::Degraded {
            attempted_providers: vec!["down".to_string()],
            last_error_kind: Some(ProviderErrorKind::NotFound),
        }
    );
    assert!(!out.emitted);
    assert!(store.cursor("wallet_recon", "W").unwrap().is_none());
    assert_eq!(store.status().unwrap().scratch, 0);

    let cap = r.config().budget.daily_cap_micros();
    let ledger = store.ledger(t0().date_naive(), cap).unwrap();
    assert_eq!(ledger.spent, 0);
    assert_eq!(ledger.reserved, 0);

    // still stale: the next cycle picks the same target again
    let retry = r.run_cycle(t0() + Duration::minutes(5)).await;
    assert_eq!(retry.target.as_deref(), Some("W"));
}
