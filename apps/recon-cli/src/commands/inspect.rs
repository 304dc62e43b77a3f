use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use recon_core::config_schema_json;
use recon_core::store::{Layer, Store};
use serde_json::json;

#[derive(Subcommand, Clone)]
pub enum InspectCmd {
    /// Store counts, today's budget and cursors (JSON)
    Status(PrettyArgs),
    /// Trace an artifact back to its events and scratch records (JSON)
    Provenance(ProvenanceArgs),
    /// Apply retention, or drop one layer older than a cutoff
    Purge(PurgeArgs),
    /// Recent audit log entries (JSON)
    Audit(AuditArgs),
}

#[derive(Args, Clone)]
pub struct PrettyArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Clone)]
pub struct ProvenanceArgs {
    /// Artifact id
    pub artifact_id: String,
    #[command(flatten)]
    pub output: PrettyArgs,
}

#[derive(Args, Clone)]
pub struct PurgeArgs {
    /// Layer to purge (scratch|events|artifacts); all layers by retention when omitted
    #[arg(long, requires = "older_than_days")]
    pub layer: Option<String>,
    /// Drop records older than this many days
    #[arg(long)]
    pub older_than_days: Option<i64>,
}

#[derive(Args, Clone)]
pub struct AuditArgs {
    /// Maximum entries to print
    #[arg(long, default_value_t = 50)]
    pub limit: i64,
    /// Only entries after this sequence number
    #[arg(long)]
    pub after: Option<i64>,
    #[command(flatten)]
    pub output: PrettyArgs,
}

pub fn execute(config: Option<&Path>, cmd: InspectCmd) -> Result<()> {
    let cfg = super::load(config)?;
    let store = Store::open(&cfg.state_dir())?;
    match cmd {
        InspectCmd::Status(args) => {
            store.health_check()?;
            let today = Utc::now().date_naive();
            let ledger = store.ledger(today, cfg.budget.daily_cap_micros())?;
            let payload = json!({
                "db": store.db_path().display().to_string(),
                "store": store.status()?,
                "budget": {
                    "date": ledger.date,
                    "spent_usd": micros_to_usd(ledger.spent),
                    "reserved_usd": micros_to_usd(ledger.reserved),
                    "daily_cap_usd": micros_to_usd(ledger.daily_cap),
                    "headroom_usd": micros_to_usd(ledger.headroom()),
                },
                "cursors": store.cursors()?,
            });
            print_json(&payload, args.pretty)
        }
        InspectCmd::Provenance(args) => {
            let report = store
                .provenance(&args.artifact_id)?
                .ok_or_else(|| anyhow!("artifact {} not found", args.artifact_id))?;
            print_json(&serde_json::to_value(&report)?, args.output.pretty)
        }
        InspectCmd::Purge(args) => {
            let payload = match (args.layer, args.older_than_days) {
                (Some(layer), Some(days)) => {
                    let layer = Layer::from_slug(&layer)
                        .ok_or_else(|| anyhow!("unknown layer {layer}"))?;
                    let removed =
                        store.purge(layer, Utc::now() - chrono::Duration::days(days))?;
                    json!({ "layer": layer.as_str(), "removed": removed })
                }
                _ => serde_json::to_value(store.purge_expired(Utc::now())?)?,
            };
            print_json(&payload, false)
        }
        InspectCmd::Audit(args) => {
            let entries = store.audit_log(args.limit, args.after)?;
            print_json(&serde_json::to_value(&entries)?, args.output.pretty)
        }
    }
}

pub fn print_schema(pretty: bool) -> Result<()> {
    print_json(&config_schema_json(), pretty)
}

fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", rendered);
    Ok(())
}

fn micros_to_usd(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}
