use std::collections::BTreeSet;

use anyhow::Result;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::{
    artifact_from_row, event_from_row, scratch_from_row, Artifact, NormalizedEvent, ScratchRecord,
    Store, ARTIFACT_COLUMNS, EVENT_COLUMNS, SCRATCH_COLUMNS,
};

/// Trail from an artifact back to the events and scratch records it was built from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvenanceReport {
    pub artifact: Artifact,
    pub events: Vec<NormalizedEvent>,
    pub scratch: Vec<ScratchRecord>,
    /// Source ids the artifact names that no longer resolve to an event.
    pub dangling_events: Vec<String>,
    /// Scratch ids referenced by events that no longer resolve.
    pub dangling_scratch: Vec<String>,
}

impl ProvenanceReport {
    pub fn is_closed(&self) -> bool {
        self.dangling_events.is_empty() && self.dangling_scratch.is_empty()
    }
}

impl Store {
    pub fn provenance(&self, artifact_id: &str) -> Result<Option<ProvenanceReport>> {
        let conn = self.conn()?;
        let artifact = conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE artifact_id=?1"),
                [artifact_id],
                artifact_from_row,
            )
            .optional()?;
        let Some(artifact) = artifact else {
            return Ok(None);
        };

        let mut event_stmt =
            conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id=?1"))?;
        let mut events = Vec::new();
        let mut dangling_events = Vec::new();
        for id in &artifact.source_ids {
            match event_stmt
                .query_row([id], event_from_row)
                .optional()?
            {
                Some(ev) => events.push(ev),
                None => dangling_events.push(id.clone()),
            }
        }

        let scratch_ids: BTreeSet<&str> = events.iter().map(|e| e.source_id.as_str()).collect();
        let mut scratch_stmt =
            conn.prepare(&format!("SELECT {SCRATCH_COLUMNS} FROM scratch WHERE id=?1"))?;
        let mut scratch = Vec::new();
        let mut dangling_scratch = Vec::new();
        for id in scratch_ids {
            match scratch_stmt
                .query_row([id], scratch_from_row)
                .optional()?
            {
                Some(rec) => scratch.push(rec),
                None => dangling_scratch.push(id.to_string()),
            }
        }

        Ok(Some(ProvenanceReport {
            artifact,
            events,
            scratch,
            dangling_events,
            dangling_scratch,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_fixtures::*;
    use crate::{Layer, Store};

    #[test]
    fn provenance_resolves_and_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .upsert_many(&[
                scratch("s1", "0xw", 100).into(),
                event("e1", "0xw", "s1", 110).into(),
                event("e2", "0xw", "s-gone", 120).into(),
                artifact("a1", "0xw", 200, &["e1", "e2", "e-gone"]).into(),
            ])
            .unwrap();
        let report = store.provenance("a1").unwrap().unwrap();
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.scratch.len(), 1);
        assert_eq!(report.dangling_events, vec!["e-gone".to_string()]);
        assert_eq!(report.dangling_scratch, vec!["s-gone".to_string()]);
        assert!(!report.is_closed());
        assert!(store.provenance("nope").unwrap().is_none());

        store.purge(Layer::Events, ts(1_000)).unwrap();
        let after = store.provenance("a1").unwrap().unwrap();
        assert_eq!(after.dangling_events.len(), 3);
    }

    #[test]
    fn closed_trail_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .upsert_many(&[
                scratch("s1", "0xw", 100).into(),
                event("e1", "0xw", "s1", 110).into(),
                artifact("a1", "0xw", 200, &["e1"]).into(),
            ])
            .unwrap();
        assert!(store.provenance("a1").unwrap().unwrap().is_closed());
    }
}
