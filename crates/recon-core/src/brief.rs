use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use recon_store::{Artifact, NormalizedEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::analyze::SignalSet;
use crate::config::{GateConfig, InputPolicy, SummaryConfig};
use crate::error::SummarizeError;

const OUTLIER_Z: f64 = 2.0;

#[derive(Clone, Debug, PartialEq)]
pub struct GatePolicy {
    pub threshold_events: u64,
    pub threshold_signal: f64,
    pub cooldown: Duration,
}

impl From<&GateConfig> for GatePolicy {
    fn from(cfg: &GateConfig) -> Self {
        Self {
            threshold_events: cfg.threshold_events,
            threshold_signal: cfg.threshold_signal,
            cooldown: Duration::seconds(cfg.cooldown_secs as i64),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    TooFewEvents { count: u64, threshold: u64 },
    WeakSignal { score: f64, threshold: f64 },
    CoolingDown { remaining_secs: i64 },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooFewEvents { .. } => "too_few_events",
            SkipReason::WeakSignal { .. } => "weak_signal",
            SkipReason::CoolingDown { .. } => "cooling_down",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GateDecision {
    Emit,
    Skip(SkipReason),
}

impl GatePolicy {
    /// Emit only when every threshold holds. A target that never emitted has no cooldown.
    pub fn decide(
        &self,
        signals: &SignalSet,
        last_emitted_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if signals.event_count < self.threshold_events {
            return GateDecision::Skip(SkipReason::TooFewEvents {
                count: signals.event_count,
                threshold: self.threshold_events,
            });
        }
        if signals.activity_score < self.threshold_signal {
            return GateDecision::Skip(SkipReason::WeakSignal {
                score: signals.activity_score,
                threshold: self.threshold_signal,
            });
        }
        if let Some(last) = last_emitted_at {
            let since = now - last;
            if since < self.cooldown {
                return GateDecision::Skip(SkipReason::CoolingDown {
                    remaining_secs: (self.cooldown - since).num_seconds(),
                });
            }
        }
        GateDecision::Emit
    }

    /// Emission bucket used in the artifact id.
    pub fn bucket(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.cooldown.num_seconds().max(1))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub text: String,
    pub model: Option<String>,
    pub tokens: Option<u64>,
}

/// Prose enrichment for an artifact. Never decides whether one is emitted.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        target: &str,
        events: &[NormalizedEvent],
        signals: &SignalSet,
    ) -> Result<Summary, SummarizeError>;
}

/// Deterministic fallback used when no summarizer is configured or it fails.
#[derive(Clone, Debug, Default)]
pub struct TemplateSummarizer;

#[async_trait::async_trait]
impl Summarizer for TemplateSummarizer {
    async fn summarize(
        &self,
        target: &str,
        _events: &[NormalizedEvent],
        signals: &SignalSet,
    ) -> Result<Summary, SummarizeError> {
        Ok(Summary {
            text: template_summary(target, signals),
            model: None,
            tokens: None,
        })
    }
}

pub fn template_summary(target: &str, signals: &SignalSet) -> String {
    let mut kinds: Vec<String> = signals
        .counts_by_type
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if kinds.is_empty() {
        kinds.push("none".into());
    }
    let mut text = format!(
        "{target}: {} events ({}); activity {:.2}, churn {:.2}, net liquidity {:+.2}",
        signals.event_count,
        kinds.join(", "),
        signals.activity_score,
        signals.churn_ratio,
        signals.net_liquidity_delta,
    );
    if !signals.top_pools.is_empty() {
        text.push_str(&format!("; watch {}", signals.top_pools.join(", ")));
    }
    text
}

/// Rough prompt size: serialized chars / 3 plus a fixed prompt overhead.
pub fn estimate_tokens(events: &[NormalizedEvent], signals: &SignalSet) -> usize {
    let events_len = events
        .iter()
        .map(|e| {
            json!({
                "event_id": e.event_id,
                "wallet": e.wallet,
                "event_type": e.event_type.as_str(),
                "pool": e.pool,
                "value": e.value,
                "timestamp": e.timestamp.timestamp(),
            })
            .to_string()
            .len()
                + 1
        })
        .sum::<usize>()
        + 2;
    let signals_len = serde_json::to_string(&signals.to_score_map())
        .map(|s| s.len())
        .unwrap_or(0);
    (events_len + signals_len) / 3 + 100
}

/// Shrink the summarizer input to `token_cap`: keep first/last events per wallet and pool and
/// USD outliers, then fill by descending USD value. Output is in timestamp order.
pub fn reduce_events(
    events: &[NormalizedEvent],
    signals: &SignalSet,
    token_cap: usize,
) -> Vec<NormalizedEvent> {
    if events.is_empty() || estimate_tokens(events, signals) <= token_cap {
        return events.to_vec();
    }
    let mut ordered: Vec<&NormalizedEvent> = events.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id)));

    let mut keep: BTreeSet<&str> = BTreeSet::new();
    let mut first: BTreeMap<&str, &str> = BTreeMap::new();
    let mut last: BTreeMap<&str, &str> = BTreeMap::new();
    for e in &ordered {
        for key in [e.wallet.as_deref(), e.pool.as_deref()].into_iter().flatten() {
            first.entry(key).or_insert(e.event_id.as_str());
            last.insert(key, e.event_id.as_str());
        }
    }
    keep.extend(first.values().copied());
    keep.extend(last.values().copied());

    let usd: Vec<f64> = ordered.iter().map(|e| e.usd_value()).collect();
    if usd.len() >= 2 {
        let mean = usd.iter().sum::<f64>() / usd.len() as f64;
        let std = (usd.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / usd.len() as f64).sqrt();
        if std > 0.0 {
            for (e, v) in ordered.iter().zip(&usd) {
                if ((v - mean) / std).abs() > OUTLIER_Z {
                    keep.insert(e.event_id.as_str());
                }
            }
        }
    }

    let mut by_value = ordered.clone();
    by_value.sort_by(|a, b| {
        b.usd_value()
            .total_cmp(&a.usd_value())
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    let mut chosen: Vec<NormalizedEvent> = by_value
        .iter()
        .filter(|e| keep.contains(e.event_id.as_str()))
        .map(|e| (*e).clone())
        .collect();
    for e in by_value.iter().filter(|e| !keep.contains(e.event_id.as_str())) {
        chosen.push((*e).clone());
        if estimate_tokens(&chosen, signals) > token_cap {
            chosen.pop();
            break;
        }
    }
    chosen.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id)));
    chosen
}

/// Summarizer call wrapped with input budgeting, a deadline and the template fallback.
pub async fn compose_summary(
    summarizer: &dyn Summarizer,
    target: &str,
    events: &[NormalizedEvent],
    signals: &SignalSet,
    cfg: &SummaryConfig,
    deadline: StdDuration,
) -> Summary {
    let input = match cfg.input_policy {
        InputPolicy::Full => events.to_vec(),
        InputPolicy::Budgeted => reduce_events(events, signals, cfg.token_cap),
    };
    if input.len() != events.len() {
        tracing::debug!(
            target: "recon::brief",
            target_id = %target,
            original = events.len(),
            reduced = input.len(),
            "reduced summarizer input to fit token cap"
        );
    }
    let result = tokio::time::timeout(deadline, summarizer.summarize(target, &input, signals)).await;
    let failure = match result {
        Ok(Ok(summary)) if !summary.text.trim().is_empty() => return summary,
        Ok(Ok(_)) => SummarizeError::Empty.to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "summarizer timed out".to_string(),
    };
    tracing::warn!(
        target: "recon::brief",
        target_id = %target,
        error = %failure,
        "summarizer failed; using template"
    );
    Summary {
        text: template_summary(target, signals),
        model: None,
        tokens: None,
    }
}

/// `source_ids` is exactly the contributing event set.
pub fn build_artifact(
    policy: &GatePolicy,
    target: &str,
    signals: &SignalSet,
    summary: Summary,
    now: DateTime<Utc>,
) -> Artifact {
    Artifact {
        artifact_id: Artifact::derive_id(target, policy.bucket(now)),
        target: target.to_string(),
        created_at: now,
        summary_text: summary.text,
        signals: signals.to_score_map(),
        next_watchlist: signals.top_pools.clone(),
        source_ids: signals.contributing_ids.clone(),
        event_count: signals.event_count,
        summary_model: summary.model,
        summary_tokens: summary.tokens,
    }
}
