mod common;

use chrono::Duration;
use common::*;
use recon_core::store::{Layer, Store};

#[tokio::test]
async fn emitted_brief_traces_back_to_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(12));
    let out = r.run_cycle(t0()).await;
    let artifact_id = out.artifact_id.expect("brief emitted");

    let report = store.provenance(&artifact_id).unwrap().unwrap();
    assert!(report.is_closed(), "{report:?}");
    assert_eq!(report.events.len(), report.artifact.source_ids.len());
    assert_eq!(report.scratch.len(), 1);
    assert_eq!(report.scratch[0].target, "W");
    assert_eq!(report.scratch[0].provenance["provider"], "fixture");
    assert!(report
        .events
        .iter()
        .all(|ev| ev.source_id == report.scratch[0].id));

    assert!(store.provenance("missing").unwrap().is_none());
}

#[tokio::test]
async fn purged_layers_show_up_as_dangling_references() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let r = reconciler(&store, wallet_config(&["W"]), TransferFeed::new(12));
    let artifact_id = r.run_cycle(t0()).await.artifact_id.unwrap();

    let cutoff = t0() + Duration::seconds(1);
    assert_eq!(store.purge(Layer::Scratch, cutoff).unwrap(), 1);
    let report = store.provenance(&artifact_id).unwrap().unwrap();
    assert!(!report.is_closed());
    assert!(report.dangling_events.is_empty());
    assert_eq!(report.dangling_scratch.len(), 1);

    assert_eq!(store.purge(Layer::Events, cutoff).unwrap(), 12);
    let report = store.provenance(&artifact_id).unwrap().unwrap();
    assert_eq!(report.dangling_events.len(), 12);
    assert!(report.events.is_empty());
    // nothing left to name a scratch id
    assert!(report.dangling_scratch.is_empty());
}
