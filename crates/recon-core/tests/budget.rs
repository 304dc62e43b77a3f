mod common;

use std::sync::Arc;

use common::*;
use recon_core::store::Store;
use recon_core::{MockProvider, OutcomeKind, SkipCause};

const COST: i64 = 50_000;

fn capped(wallets: &[&str], k: i64) -> recon_core::ReconConfig {
    let mut cfg = wallet_config(wallets);
    cfg.budget.cost_usd.wallet_recon = COST as f64 / 1_000_000.0;
    cfg.budget.daily_cap_usd = (k * COST) as f64 / 1_000_000.0;
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cycles_never_overdraw_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let wallets = ["w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7"];
    let k = 3;
    let r = reconciler(&store, capped(&wallets, k), Arc::new(MockProvider::new(2)));

    let outcomes = r.run_batch(t0(), wallets.len()).await;
    assert_eq!(outcomes.len(), wallets.len());
    let succeeded = outcomes
        .iter()
        .filter(|o| o.outcome == OutcomeKind::Success)
        .count() as i64;
    assert!(succeeded >= 1 && succeeded <= k, "succeeded = {succeeded}");

    let mut targets: Vec<_> = outcomes
        .iter()
        .filter(|o| o.outcome == OutcomeKind::Success)
        .filter_map(|o| o.target.clone())
        .collect();
    targets.sort();
    targets.dedup();
    assert_eq!(targets.len() as i64, succeeded, "each target worked once");

    let ledger = store.ledger(t0().date_naive(), k * COST).unwrap();
    assert!(ledger.spent <= k * COST);
    assert_eq!(ledger.spent, succeeded * COST);
    assert_eq!(ledger.reserved, 0);
}

#[tokio::test]
async fn sequential_cycles_stop_at_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let wallets = ["w0", "w1", "w2", "w3", "w4"];
    let k = 3;
    let r = reconciler(&store, capped(&wallets, k), Arc::new(MockProvider::new(2)));

    let mut outcomes = Vec::new();
    for _ in 0..wallets.len() {
        outcomes.push(r.run_cycle(t0()).await.outcome);
    }
    let exceeded = OutcomeKind::Skipped {
        reason: SkipCause::BudgetExceeded,
    };
    assert_eq!(
        outcomes,
        vec![
            OutcomeKind::Success,
            OutcomeKind::Success,
            OutcomeKind::Success,
            exceeded.clone(),
            exceeded,
        ]
    );
    let ledger = store.ledger(t0().date_naive(), k * COST).unwrap();
    assert_eq!(ledger.spent, k * COST);
    assert_eq!(ledger.headroom(), 0);

    // a new day brings fresh headroom
    let tomorrow = t0() + chrono::Duration::days(1);
    assert_eq!(r.run_cycle(tomorrow).await.outcome, OutcomeKind::Success);
}
