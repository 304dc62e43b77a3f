use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use recon_store::{CursorAdvance, CursorRow, Store};

use crate::action::ActionType;

/// How far past its threshold a target is. An unseeded target sorts above any finite lag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Overdue {
    By(Duration),
    Unseeded,
}

/// Point-in-time copy of the cursor table the planner can reason over without touching storage.
#[derive(Clone, Debug, Default)]
pub struct CursorSnapshot {
    cursors: HashMap<(ActionType, String), DateTime<Utc>>,
}

impl CursorSnapshot {
    pub fn from_rows(rows: &[CursorRow]) -> Self {
        let mut cursors = HashMap::new();
        for row in rows {
            match ActionType::from_slug(&row.action_type) {
                Some(action) => {
                    cursors.insert((action, row.target.clone()), row.last_success_at);
                }
                None => tracing::debug!(
                    target: "recon::cursor",
                    action_type = %row.action_type,
                    "ignoring cursor for unknown action type"
                ),
            }
        }
        Self { cursors }
    }

    pub fn set(&mut self, action: ActionType, target: &str, at: DateTime<Utc>) {
        self.cursors.insert((action, target.to_string()), at);
    }

    pub fn last_success(&self, action: ActionType, target: &str) -> Option<DateTime<Utc>> {
        self.cursors.get(&(action, target.to_string())).copied()
    }

    pub fn is_stale(&self, action: ActionType, target: &str, now: DateTime<Utc>) -> bool {
        match self.last_success(action, target) {
            None => true,
            Some(last) => now - last > action.staleness_threshold(),
        }
    }

    /// `None` while the target is still fresh.
    pub fn overdue_by(&self, action: ActionType, target: &str, now: DateTime<Utc>) -> Option<Overdue> {
        match self.last_success(action, target) {
            None => Some(Overdue::Unseeded),
            Some(last) => {
                let lag = (now - last) - action.staleness_threshold();
                (lag > Duration::zero()).then_some(Overdue::By(lag))
            }
        }
    }
}

/// Store-backed cursor reads for the planner.
#[derive(Clone)]
pub struct CursorTracker {
    store: Store,
}

impl CursorTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<CursorSnapshot> {
        let rows = self.store.cursors_async().await?;
        Ok(CursorSnapshot::from_rows(&rows))
    }
}

/// Log a committed cursor move. Returns `true` when the stored watermark now equals
/// `watermark`; a refused backward move is a warning, never an error.
pub fn log_advance(
    action: ActionType,
    target: &str,
    watermark: DateTime<Utc>,
    result: &CursorAdvance,
) -> bool {
    match result {
        CursorAdvance::Advanced { previous } => {
            tracing::debug!(
                target: "recon::cursor",
                action = %action,
                target_id = %target,
                previous = ?previous,
                watermark = %watermark,
                "cursor advanced"
            );
            true
        }
        CursorAdvance::RejectedBackward { current } => {
            tracing::warn!(
                target: "recon::cursor",
                action = %action,
                target_id = %target,
                current = %current,
                watermark = %watermark,
                "refusing to move cursor backward"
            );
            false
        }
    }
}
