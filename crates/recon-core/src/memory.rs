use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use recon_store::{Artifact, CursorMove, PurgeReport, Store, UpsertOutcome};

use crate::action::ActionType;
use crate::staleness::log_advance;

#[derive(Clone, Debug, Default)]
pub struct CommitReport {
    pub artifact: Option<UpsertOutcome>,
    pub purged: PurgeReport,
    pub cursor_advanced: bool,
}

/// Final stage of a cycle. The artifact and the cursor move commit in one transaction, so
/// the cursor never moves without the artifact and a failure leaves both untouched.
/// Writes are never raced against the deadline: a commit that would land late is rolled
/// back and reported as [`recon_store::DeadlineExceeded`].
#[derive(Clone)]
pub struct Memory {
    store: Store,
}

impl Memory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn commit(
        &self,
        action: ActionType,
        target: &str,
        artifact: Option<&Artifact>,
        advance_to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<CommitReport> {
        let cursor = advance_to.map(|watermark| CursorMove {
            action_type: action.as_str().to_string(),
            target: target.to_string(),
            watermark,
        });
        let committed = self
            .store
            .commit_cycle_async(artifact.cloned().map(Into::into), cursor, Some(deadline))
            .await?;
        let mut report = CommitReport {
            artifact: committed.artifact,
            ..CommitReport::default()
        };
        if let (Some(watermark), Some(result)) = (advance_to, committed.cursor.as_ref()) {
            report.cursor_advanced = log_advance(action, target, watermark, result);
        }

        // Retention runs after the cycle's output is durable; a slow or failed sweep is
        // retried next cycle and never changes the outcome.
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.store.purge_expired_async(now)).await {
            Ok(Ok(purged)) => report.purged = purged,
            Ok(Err(err)) => tracing::warn!(
                target: "recon::memory",
                error = %err,
                "retention purge failed"
            ),
            Err(_) => tracing::warn!(
                target: "recon::memory",
                "retention purge did not finish before the stage deadline"
            ),
        }

        tracing::debug!(
            target: "recon::memory",
            action = %action,
            target_id = %target,
            artifact = ?report.artifact,
            purged = report.purged.total(),
            cursor_advanced = report.cursor_advanced,
            "cycle committed"
        );
        Ok(report)
    }
}
