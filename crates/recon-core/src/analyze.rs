//! Layer 1 → Layer 2 normalisation and the rollup signals computed over a trailing window.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use recon_store::{trunc_secs, EventType, NormalizedEvent, ScratchRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::ActionType;
use crate::config::AnalyzeConfig;
use crate::error::ValidationError;

const DEFAULT_CHAIN: &str = "base";
const WATCHLIST_LEN: usize = 5;

/// Feed record with the alias families different providers use.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default, alias = "txHash", alias = "hash", alias = "transaction_hash")]
    tx: Option<String>,
    #[serde(default, alias = "logIndex")]
    log_index: Option<Value>,
    #[serde(default, rename = "type", alias = "kind", alias = "event_type")]
    kind: Option<String>,
    #[serde(default, alias = "address", alias = "from_address", alias = "account")]
    wallet: Option<String>,
    #[serde(default, alias = "ts", alias = "block_timestamp", alias = "time")]
    timestamp: Option<Value>,
    #[serde(default, alias = "network")]
    chain: Option<String>,
    #[serde(default, alias = "pool_address", alias = "liquidity_pool")]
    pool: Option<String>,
    #[serde(default, alias = "value", alias = "token_amounts")]
    amounts: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Outcome of normalising one scratch record.
#[derive(Clone, Debug, Default)]
pub struct Normalized {
    pub events: Vec<NormalizedEvent>,
    pub rejected: Vec<ValidationError>,
}

/// Pure transform; malformed sub-records are collected in `rejected` and skipped.
pub fn normalize(scratch: &ScratchRecord) -> Normalized {
    let mut out = Normalized::default();
    let items = match extract_items(&scratch.raw_payload) {
        Ok(items) => items,
        Err(reason) => {
            out.rejected.push(ValidationError { index: 0, reason });
            return out;
        }
    };
    let action = scratch
        .provenance
        .get("action")
        .and_then(Value::as_str)
        .and_then(ActionType::from_slug);
    let mut seen = BTreeSet::new();
    for (index, item) in items.into_iter().enumerate() {
        match normalize_item(scratch, action, item) {
            Ok(event) => {
                if seen.insert(event.event_id.clone()) {
                    out.events.push(event);
                }
            }
            Err(reason) => out.rejected.push(ValidationError { index, reason }),
        }
    }
    for err in &out.rejected {
        tracing::warn!(
            target: "recon::analyze",
            scratch_id = %scratch.id,
            error = %err,
            "skipping malformed record"
        );
    }
    out
}

fn extract_items(raw: &str) -> Result<Vec<Value>, String> {
    let parsed: Value = serde_json::from_str(raw).map_err(|e| format!("payload is not JSON: {e}"))?;
    match parsed {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            for key in ["events", "items"] {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return Ok(items);
                }
            }
            Err("payload object has no events array".into())
        }
        _ => Err("payload is neither an array nor an object".into()),
    }
}

fn normalize_item(
    scratch: &ScratchRecord,
    action: Option<ActionType>,
    item: Value,
) -> Result<NormalizedEvent, String> {
    let raw: RawEvent = serde_json::from_value(item).map_err(|e| e.to_string())?;
    let kind = raw.kind.as_deref().ok_or("missing event type")?;
    let event_type = EventType::from_slug(kind).ok_or_else(|| format!("unknown event type {kind:?}"))?;
    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(parse_timestamp)
        .ok_or("missing or unparseable timestamp")?;
    let wallet = non_empty(raw.wallet).or_else(|| {
        (action == Some(ActionType::WalletRecon)).then(|| scratch.target.clone())
    });
    let pool = non_empty(raw.pool).or_else(|| {
        matches!(action, Some(ActionType::LpRecon | ActionType::ExploreMetrics))
            .then(|| scratch.target.clone())
    });
    if event_type.is_liquidity() && pool.is_none() {
        return Err("liquidity event without pool".into());
    }
    let tx = non_empty(raw.tx);
    let identifier = match (&tx, &raw.log_index) {
        (Some(tx), Some(idx)) if !idx.is_null() => format!("{tx}:{}", scalar_text(idx)),
        (Some(tx), _) => tx.clone(),
        (None, _) => pool.clone().unwrap_or_else(|| "-".to_string()),
    };

    let mut value = raw.extra;
    if let Some(amounts) = raw.amounts {
        value.insert("amounts".into(), amounts);
    }
    if let Some(tx) = &tx {
        value.insert("tx".into(), Value::String(tx.clone()));
    }

    Ok(NormalizedEvent {
        event_id: NormalizedEvent::derive_id(wallet.as_deref(), &identifier, event_type, timestamp),
        wallet,
        event_type,
        pool,
        value: Value::Object(value),
        timestamp,
        source_id: scratch.id.clone(),
        chain: non_empty(raw.chain).unwrap_or_else(|| DEFAULT_CHAIN.to_string()),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integer/float seconds, numeric strings, or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    return DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|t| trunc_secs(t.with_timezone(&Utc)))
                }
            }
        }
        _ => None,
    }?;
    DateTime::from_timestamp(secs, 0)
}

/// Rollups over the events of one trailing window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    pub event_count: u64,
    pub counts_by_type: BTreeMap<String, u64>,
    /// Liquidity added minus liquidity removed.
    pub net_liquidity_delta: f64,
    pub distinct_wallets: u64,
    pub churn_ratio: f64,
    pub activity_score: f64,
    /// Pools by activity, busiest first.
    pub top_pools: Vec<String>,
    pub contributing_ids: BTreeSet<String>,
}

impl SignalSet {
    /// Flat numeric view persisted on the artifact.
    pub fn to_score_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("event_count".to_string(), self.event_count as f64);
        map.insert("net_liquidity_delta".to_string(), self.net_liquidity_delta);
        map.insert("distinct_wallets".to_string(), self.distinct_wallets as f64);
        map.insert("churn_ratio".to_string(), self.churn_ratio);
        map.insert("activity_score".to_string(), self.activity_score);
        for (kind, count) in &self.counts_by_type {
            map.insert(format!("count.{kind}"), *count as f64);
        }
        map
    }
}

/// Pure and order-independent: the input is de-duplicated by id and folded in id order.
pub fn compute_signals(
    events: &[NormalizedEvent],
    now: DateTime<Utc>,
    window: Duration,
    cfg: &AnalyzeConfig,
) -> SignalSet {
    let start = now - window;
    let in_window: BTreeMap<&str, &NormalizedEvent> = events
        .iter()
        .filter(|e| e.timestamp > start && e.timestamp <= now)
        .map(|e| (e.event_id.as_str(), e))
        .collect();

    let mut signals = SignalSet::default();
    let mut wallets: BTreeSet<&str> = BTreeSet::new();
    let mut pools: HashMap<&str, (u64, f64)> = HashMap::new();
    for (id, event) in &in_window {
        signals.contributing_ids.insert((*id).to_string());
        *signals
            .counts_by_type
            .entry(event.event_type.as_str().to_string())
            .or_default() += 1;
        match event.event_type {
            EventType::LpAdd => signals.net_liquidity_delta += event.magnitude(),
            EventType::LpRemove => signals.net_liquidity_delta -= event.magnitude(),
            _ => {}
        }
        if let Some(w) = event.wallet.as_deref() {
            wallets.insert(w);
        }
        if let Some(p) = event.pool.as_deref() {
            let slot = pools.entry(p).or_default();
            slot.0 += 1;
            slot.1 += event.magnitude();
        }
    }

    let count = in_window.len() as u64;
    signals.event_count = count;
    signals.distinct_wallets = wallets.len() as u64;
    signals.churn_ratio = if count == 0 {
        0.0
    } else {
        wallets.len() as f64 / count as f64
    };
    let count_part = (count as f64 / cfg.event_ceiling.max(1) as f64).min(1.0);
    let delta_part = if cfg.delta_ceiling > 0.0 {
        (signals.net_liquidity_delta.abs() / cfg.delta_ceiling).min(1.0)
    } else {
        0.0
    };
    signals.activity_score = count_part.max(delta_part).clamp(0.0, 1.0);

    let mut ranked: Vec<(&str, (u64, f64))> = pools.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1 .0
            .cmp(&a.1 .0)
            .then_with(|| b.1 .1.total_cmp(&a.1 .1))
            .then_with(|| a.0.cmp(b.0))
    });
    signals.top_pools = ranked
        .into_iter()
        .take(WATCHLIST_LEN)
        .map(|(p, _)| p.to_string())
        .collect();
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_store::from_unix;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn scratch(action: ActionType, payload: Value) -> ScratchRecord {
        ScratchRecord {
            id: "scratch-1".into(),
            source: "mock".into(),
            target: "0xtarget".into(),
            fetched_at: from_unix(NOW),
            raw_payload: payload.to_string(),
            provenance: json!({"action": action.as_str()}),
        }
    }

    fn ev(id: &str, kind: EventType, wallet: &str, pool: Option<&str>, usd: f64, at: i64) -> NormalizedEvent {
        NormalizedEvent {
            event_id: id.into(),
            wallet: Some(wallet.into()),
            event_type: kind,
            pool: pool.map(str::to_string),
            value: json!({"usd_value": usd}),
            timestamp: from_unix(at),
            source_id: "s".into(),
            chain: "base".into(),
        }
    }

    #[test]
    fn normalizes_aliases_and_skips_malformed() {
        let payload = json!({"events": [
            {"txHash": "0x1", "logIndex": 2, "kind": "token_transfer", "from_address": "0xa", "block_timestamp": "2023-11-14T22:13:20Z", "usd_value": 5},
            {"hash": "0x2", "type": "lp_add", "ts": NOW - 10, "pool_address": "WETH/USDC", "amounts": {"WETH": 1.0}},
            {"hash": "0x3", "type": "bridge", "ts": NOW},
            {"hash": "0x4", "type": "swap"},
            "not an object"
        ]});
        let out = normalize(&scratch(ActionType::WalletRecon, payload));
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.rejected.len(), 3);
        assert_eq!(
            out.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        let transfer = &out.events[0];
        assert_eq!(transfer.event_type, EventType::Transfer);
        assert_eq!(transfer.wallet.as_deref(), Some("0xa"));
        assert_eq!(transfer.timestamp, from_unix(NOW));
        assert_eq!(transfer.source_id, "scratch-1");
        assert_eq!(
            transfer.event_id,
            NormalizedEvent::derive_id(Some("0xa"), "0x1:2", EventType::Transfer, from_unix(NOW))
        );

        let lp = &out.events[1];
        // wallet recon falls back to the scratch target
        assert_eq!(lp.wallet.as_deref(), Some("0xtarget"));
        assert_eq!(lp.pool.as_deref(), Some("WETH/USDC"));
        assert_eq!(lp.value["amounts"]["WETH"], 1.0);
    }

    #[test]
    fn renormalizing_yields_identical_events() {
        let payload = json!([
            {"tx": "0x1", "type": "swap", "wallet": "0xa", "timestamp": NOW},
            {"tx": "0x1", "type": "swap", "wallet": "0xa", "timestamp": NOW},
            {"tx": "0x2", "type": "swap", "wallet": "0xb", "timestamp": NOW}
        ]);
        let s = scratch(ActionType::WalletRecon, payload);
        let a = normalize(&s);
        let b = normalize(&s);
        assert_eq!(a.events, b.events);
        assert_eq!(a.events.len(), 2);
    }

    #[test]
    fn unparseable_payload_is_one_rejection() {
        let mut s = scratch(ActionType::WalletRecon, json!(null));
        s.raw_payload = "<html>".into();
        let out = normalize(&s);
        assert!(out.events.is_empty());
        assert_eq!(out.rejected.len(), 1);
    }

    #[test]
    fn signals_over_window() {
        let cfg = AnalyzeConfig::default();
        let now = from_unix(NOW);
        let events = vec![
            ev("e1", EventType::LpAdd, "0xa", Some("P1"), 3_000.0, NOW - 100),
            ev("e2", EventType::LpRemove, "0xb", Some("P1"), 1_000.0, NOW - 200),
            ev("e3", EventType::Swap, "0xa", Some("P2"), 10.0, NOW - 300),
            ev("e4", EventType::Swap, "0xa", None, 10.0, NOW - 90_000),
        ];
        let s = compute_signals(&events, now, Duration::hours(24), &cfg);
        assert_eq!(s.event_count, 3);
        assert_eq!(s.counts_by_type["swap"], 1);
        assert_eq!(s.net_liquidity_delta, 2_000.0);
        assert_eq!(s.distinct_wallets, 2);
        assert!((s.churn_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!((s.activity_score - 0.2).abs() < 1e-9);
        assert_eq!(s.top_pools, vec!["P1", "P2"]);
        assert!(!s.contributing_ids.contains("e4"));
        assert_eq!(s.to_score_map()["count.lp_add"], 1.0);
    }

    #[test]
    fn signals_are_order_independent_and_deduplicated() {
        let cfg = AnalyzeConfig::default();
        let now = from_unix(NOW);
        let mut events: Vec<_> = (0..12)
            .map(|i| ev(&format!("e{i:02}"), EventType::Transfer, "0xw", None, 1.0, NOW - i * 60))
            .collect();
        let forward = compute_signals(&events, now, Duration::hours(24), &cfg);
        events.reverse();
        events.push(events[0].clone());
        let backward = compute_signals(&events, now, Duration::hours(24), &cfg);
        assert_eq!(forward, backward);
        assert_eq!(forward.event_count, 12);
        assert!((forward.activity_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn empty_window_is_quiet() {
        let s = compute_signals(&[], from_unix(NOW), Duration::hours(24), &AnalyzeConfig::default());
        assert_eq!(s.event_count, 0);
        assert_eq!(s.churn_ratio, 0.0);
        assert_eq!(s.activity_score, 0.0);
    }
}
