use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use recon_store::{ScratchRecord, Store, UpsertOutcome};
use serde_json::json;

use crate::action::ActionType;
use crate::config::WorkerConfig;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::provider::{FetchRequest, ProviderChains};

#[derive(Clone, Debug)]
pub enum FetchResult {
    /// A provider answered and its payload is durable in the scratch layer.
    Success {
        record: ScratchRecord,
        stored: UpsertOutcome,
    },
    /// Every provider in the chain failed; the cycle continues on zero new events.
    Exhausted {
        attempted_providers: Vec<String>,
        last_error_kind: Option<ProviderErrorKind>,
    },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success { .. })
    }

    pub fn record(&self) -> Option<&ScratchRecord> {
        match self {
            FetchResult::Success { record, .. } => Some(record),
            FetchResult::Exhausted { .. } => None,
        }
    }
}

/// Longest pause between two attempts on one provider.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Walks the provider chain for an action, retrying transient failures per provider.
///
/// The caller's deadline covers the whole chain. Each provider gets an even share of the
/// time left when it starts, so a hanging primary cannot starve the fallbacks behind it.
#[derive(Clone)]
pub struct Worker {
    store: Store,
    chains: ProviderChains,
    max_attempts: u32,
    backoff: Duration,
}

impl Worker {
    pub fn new(store: Store, chains: ProviderChains, cfg: &WorkerConfig) -> Self {
        Self {
            store,
            chains,
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.backoff
            .checked_mul(factor)
            .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }

    /// Provider outcomes are folded into [`FetchResult`]; only a failed scratch write is an
    /// error. Running out of time counts as a `TransientNetwork` failure.
    pub async fn fetch(
        &self,
        action: ActionType,
        target: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<FetchResult> {
        let request = FetchRequest {
            action,
            target: target.to_string(),
            since,
            until,
        };
        let chain = self.chains.chain(action);
        let mut attempted = Vec::with_capacity(chain.len());
        let mut last_error_kind = None;

        for (position, provider) in chain.iter().enumerate() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                last_error_kind = Some(ProviderErrorKind::TransientNetwork);
                break;
            }
            let share = left / (chain.len() - position) as u32;
            let slice_end = Instant::now() + share;
            let name = provider.name().to_string();
            attempted.push(name.clone());
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let budget = slice_end.saturating_duration_since(Instant::now());
                let answer = match tokio::time::timeout(budget, provider.fetch(&request)).await {
                    Ok(answer) => answer,
                    Err(_) => Err(ProviderError::TransientNetwork(format!(
                        "no answer within {}ms",
                        budget.as_millis()
                    ))),
                };
                match answer {
                    Ok(response) => {
                        let record = ScratchRecord {
                            id: ScratchRecord::derive_id(&name, target, since, until),
                            source: name.clone(),
                            target: target.to_string(),
                            fetched_at: until,
                            raw_payload: response.payload,
                            provenance: json!({
                                "provider": name,
                                "chain_position": position,
                                "attempt": attempt,
                                "action": action.as_str(),
                                "since": since.timestamp(),
                                "until": until.timestamp(),
                                "fell_through": &attempted[..attempted.len() - 1],
                                "params": response.params,
                            }),
                        };
                        let stored = self.store.upsert_async(record.clone().into()).await?;
                        tracing::info!(
                            target: "recon::worker",
                            action = %action,
                            target_id = %target,
                            provider = %name,
                            attempt,
                            stored = stored.as_str(),
                            "fetch succeeded"
                        );
                        return Ok(FetchResult::Success { record, stored });
                    }
                    Err(err) => {
                        let kind = err.kind();
                        last_error_kind = Some(kind);
                        tracing::warn!(
                            target: "recon::worker",
                            action = %action,
                            target_id = %target,
                            provider = %name,
                            attempt,
                            kind = kind.as_str(),
                            error = %err,
                            "provider attempt failed"
                        );
                        if !kind.is_retryable() || attempt >= self.max_attempts {
                            break;
                        }
                        let pause = self.backoff_for(attempt);
                        if Instant::now() + pause >= slice_end {
                            break;
                        }
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        tracing::warn!(
            target: "recon::worker",
            action = %action,
            target_id = %target,
            attempted = ?attempted,
            last_error = last_error_kind.map(|k| k.as_str()),
            "provider chain exhausted"
        );
        Ok(FetchResult::Exhausted {
            attempted_providers: attempted,
            last_error_kind,
        })
    }
}
