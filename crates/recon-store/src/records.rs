//! Row types for the three record layers and the deterministic ids that key them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const ID_SEPARATOR: &str = "\u{1f}";

/// Hex sha256 over `parts` joined with the ASCII unit separator.
pub fn digest_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update(ID_SEPARATOR.as_bytes());
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Convert stored unix seconds back into a UTC timestamp.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Drop sub-second precision so a record hashes the same before and after a round trip.
pub fn trunc_secs(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_unix(ts.timestamp())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Scratch,
    Events,
    Artifacts,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Scratch, Layer::Events, Layer::Artifacts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Scratch => "scratch",
            Layer::Events => "events",
            Layer::Artifacts => "artifacts",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scratch" | "l1" | "1" => Some(Layer::Scratch),
            "events" | "l2" | "2" => Some(Layer::Events),
            "artifacts" | "l3" | "3" => Some(Layer::Artifacts),
            _ => None,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        self.as_str()
    }

    pub(crate) fn id_column(&self) -> &'static str {
        match self {
            Layer::Scratch => "id",
            Layer::Events => "event_id",
            Layer::Artifacts => "artifact_id",
        }
    }

    pub(crate) fn time_column(&self) -> &'static str {
        match self {
            Layer::Scratch => "fetched_at",
            Layer::Events => "timestamp",
            Layer::Artifacts => "created_at",
        }
    }

    pub(crate) fn target_column(&self) -> &'static str {
        match self {
            Layer::Scratch => "target",
            Layer::Events => "wallet",
            Layer::Artifacts => "target",
        }
    }

    /// Fixed retention window; records older than `now - retention` are purged.
    pub fn retention(&self) -> Duration {
        match self {
            Layer::Scratch => Duration::days(7),
            Layer::Events => Duration::days(30),
            Layer::Artifacts => Duration::days(90),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Swap,
    LpAdd,
    LpRemove,
    Metrics,
    Transfer,
    ContractInteraction,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Swap => "swap",
            EventType::LpAdd => "lp_add",
            EventType::LpRemove => "lp_remove",
            EventType::Metrics => "metrics",
            EventType::Transfer => "transfer",
            EventType::ContractInteraction => "contract_interaction",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "swap" => Some(EventType::Swap),
            "lp_add" | "add_liquidity" | "mint" => Some(EventType::LpAdd),
            "lp_remove" | "remove_liquidity" | "burn" => Some(EventType::LpRemove),
            "metrics" => Some(EventType::Metrics),
            "transfer" | "token_transfer" => Some(EventType::Transfer),
            "contract_interaction" => Some(EventType::ContractInteraction),
            _ => None,
        }
    }

    pub fn is_liquidity(&self) -> bool {
        matches!(self, EventType::LpAdd | EventType::LpRemove)
    }
}

/// Layer 1: an opaque provider response plus the envelope describing where it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScratchRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_payload: String,
    pub provenance: Value,
}

impl ScratchRecord {
    pub fn derive_id(
        source: &str,
        target: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> String {
        digest_id(&[
            "scratch",
            source,
            target,
            &since.timestamp().to_string(),
            &until.timestamp().to_string(),
        ])
    }
}

/// Layer 2: one curated event derived from a scratch record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub wallet: Option<String>,
    pub event_type: EventType,
    pub pool: Option<String>,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub chain: String,
}

impl NormalizedEvent {
    /// `identifier` is the tx hash (optionally `hash:log_index`), else the pool, else `-`.
    pub fn derive_id(
        wallet: Option<&str>,
        identifier: &str,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> String {
        digest_id(&[
            wallet.unwrap_or(""),
            identifier,
            event_type.as_str(),
            &timestamp.timestamp().to_string(),
        ])
    }

    /// Numeric magnitude used by liquidity rollups: `usd_value`, else `amount`, else 1.
    pub fn magnitude(&self) -> f64 {
        ["usd_value", "amount"]
            .iter()
            .find_map(|key| self.value.get(*key).and_then(number_like))
            .map(f64::abs)
            .unwrap_or(1.0)
    }

    pub fn usd_value(&self) -> f64 {
        self.value
            .get("usd_value")
            .and_then(number_like)
            .unwrap_or(0.0)
    }
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Layer 3: a human-facing brief with a closed trail back to its events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub summary_text: String,
    pub signals: BTreeMap<String, f64>,
    pub next_watchlist: Vec<String>,
    pub source_ids: BTreeSet<String>,
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_tokens: Option<u64>,
}

impl Artifact {
    pub fn derive_id(target: &str, emission_bucket: i64) -> String {
        digest_id(&["artifact", target, &emission_bucket.to_string()])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum Record {
    Scratch(ScratchRecord),
    Event(NormalizedEvent),
    Artifact(Artifact),
}

impl Record {
    pub fn layer(&self) -> Layer {
        match self {
            Record::Scratch(_) => Layer::Scratch,
            Record::Event(_) => Layer::Events,
            Record::Artifact(_) => Layer::Artifacts,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Scratch(r) => &r.id,
            Record::Event(e) => &e.event_id,
            Record::Artifact(a) => &a.artifact_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Scratch(r) => r.fetched_at,
            Record::Event(e) => e.timestamp,
            Record::Artifact(a) => a.created_at,
        }
    }

    /// Hash of the logical content as stored (second-precision timestamps).
    pub fn content_hash(&self) -> String {
        let canonical = match self {
            Record::Scratch(r) => json!({
                "source": r.source,
                "target": r.target,
                "fetched_at": r.fetched_at.timestamp(),
                "raw_payload": r.raw_payload,
                "provenance": r.provenance,
            }),
            Record::Event(e) => json!({
                "wallet": e.wallet,
                "event_type": e.event_type.as_str(),
                "pool": e.pool,
                "value": e.value,
                "timestamp": e.timestamp.timestamp(),
                "source_id": e.source_id,
                "chain": e.chain,
            }),
            Record::Artifact(a) => json!({
                "target": a.target,
                "created_at": a.created_at.timestamp(),
                "summary_text": a.summary_text,
                "signals": a.signals,
                "next_watchlist": a.next_watchlist,
                "source_ids": a.source_ids,
                "event_count": a.event_count,
                "summary_model": a.summary_model,
                "summary_tokens": a.summary_tokens,
            }),
        };
        let mut hasher = Sha256::new();
        hasher.update(self.layer().as_str().as_bytes());
        if let Ok(bytes) = serde_json::to_vec(&canonical) {
            hasher.update(bytes);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn as_scratch(&self) -> Option<&ScratchRecord> {
        match self {
            Record::Scratch(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&NormalizedEvent> {
        match self {
            Record::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&Artifact> {
        match self {
            Record::Artifact(a) => Some(a),
            _ => None,
        }
    }
}

impl From<ScratchRecord> for Record {
    fn from(value: ScratchRecord) -> Self {
        Record::Scratch(value)
    }
}

impl From<NormalizedEvent> for Record {
    fn from(value: NormalizedEvent) -> Self {
        Record::Event(value)
    }
}

impl From<Artifact> for Record {
    fn from(value: Artifact) -> Self {
        Record::Artifact(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        }
    }
}

/// One append-only audit row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub layer: String,
    pub record_id: String,
    pub op: String,
    pub outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        from_unix(secs)
    }

    #[test]
    fn event_id_is_reproducible_and_field_sensitive() {
        let a = NormalizedEvent::derive_id(Some("0xabc"), "0xtx:1", EventType::Swap, ts(100));
        let b = NormalizedEvent::derive_id(Some("0xabc"), "0xtx:1", EventType::Swap, ts(100));
        assert_eq!(a, b);
        let other_type =
            NormalizedEvent::derive_id(Some("0xabc"), "0xtx:1", EventType::LpAdd, ts(100));
        let other_time =
            NormalizedEvent::derive_id(Some("0xabc"), "0xtx:1", EventType::Swap, ts(101));
        assert_ne!(a, other_type);
        assert_ne!(a, other_time);
    }

    #[test]
    fn id_parts_do_not_collide_across_boundaries() {
        assert_ne!(digest_id(&["ab", "c"]), digest_id(&["a", "bc"]));
    }

    #[test]
    fn content_hash_ignores_sub_second_precision() {
        let base = ts(1_700_000_000);
        let precise = base + Duration::milliseconds(250);
        let mk = |at: DateTime<Utc>| {
            Record::Scratch(ScratchRecord {
                id: "s1".into(),
                source: "mock".into(),
                target: "0xw".into(),
                fetched_at: at,
                raw_payload: "[]".into(),
                provenance: json!({}),
            })
        };
        assert_eq!(mk(base).content_hash(), mk(precise).content_hash());
        assert_eq!(trunc_secs(precise), base);
    }

    #[test]
    fn event_type_slugs_accept_feed_aliases() {
        assert_eq!(EventType::from_slug("token_transfer"), Some(EventType::Transfer));
        assert_eq!(EventType::from_slug(" LP_ADD "), Some(EventType::LpAdd));
        assert_eq!(EventType::from_slug("bridge"), None);
        assert!(EventType::LpRemove.is_liquidity());
        assert!(!EventType::Swap.is_liquidity());
    }

    #[test]
    fn magnitude_prefers_usd_value_then_amount() {
        let mut event = NormalizedEvent {
            event_id: "e".into(),
            wallet: None,
            event_type: EventType::LpAdd,
            pool: None,
            value: json!({"usd_value": "-250.5", "amount": 3}),
            timestamp: ts(0),
            source_id: "s".into(),
            chain: "base".into(),
        };
        assert_eq!(event.magnitude(), 250.5);
        event.value = json!({"amount": 3});
        assert_eq!(event.magnitude(), 3.0);
        event.value = json!({});
        assert_eq!(event.magnitude(), 1.0);
    }
}
