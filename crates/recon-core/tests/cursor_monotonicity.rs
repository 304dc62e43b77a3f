mod common;

use chrono::Duration;
use common::*;
use recon_core::store::Store;
use recon_core::{OutcomeKind, Stage};

fn fail_artifact_writes(store: &Store, on: bool) {
    let conn = rusqlite::Connection::open(store.db_path()).unwrap();
    if on {
        conn.execute_batch(
            "CREATE TRIGGER fail_artifacts BEFORE INSERT ON artifacts \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
    } else {
        conn.execute_batch("DROP TRIGGER fail_artifacts;").unwrap();
    }
}

#[tokio::test]
async fn storage_failure_leaves_cursor_exactly_as_it_was() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(12));

    fail_artifact_writes(&store, true);
    let first = r.run_cycle(t0()).await;
    assert!(
        matches!(
            first.outcome,
            OutcomeKind::Failed {
                stage: Stage::Memory,
                ..
            }
        ),
        "{:?}",
        first.outcome
    );
    assert!(!first.emitted);
    assert!(store.cursor("wallet_recon", "W").unwrap().is_none());
    // scratch and events from the failed cycle may persist; they are idempotent
    let partial = store.status().unwrap();
    assert_eq!(partial.scratch, 1);
    assert_eq!(partial.events, 12);

    fail_artifact_writes(&store, false);
    let retry = r.run_cycle(t0()).await;
    assert_eq!(retry.outcome, OutcomeKind::Success);
    assert!(retry.emitted);
    assert_eq!(store.cursor("wallet_recon", "W").unwrap(), Some(t0()));
    let after = store.status().unwrap();
    assert_eq!(after.scratch, 1);
    assert_eq!(after.events, 12);
}

#[tokio::test]
async fn cursor_is_non_decreasing_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(3));

    let mut seen = Vec::new();
    for step in [0, 1, 3, 3, 5, 2, 9] {
        r.run_cycle(t0() + Duration::hours(step)).await;
        seen.push(store.cursor("wallet_recon", "W").unwrap());
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last().copied().flatten(), Some(t0() + Duration::hours(9)));

    // a direct backward move is refused
    store
        .advance_cursor("wallet_recon", "W", t0())
        .unwrap();
    assert_eq!(
        store.cursor("wallet_recon", "W").unwrap(),
        Some(t0() + Duration::hours(9))
    );
}
