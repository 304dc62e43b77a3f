use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Type, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

mod ledger;
mod provenance;
mod records;

pub use ledger::{LedgerEntry, Reservation};
pub use provenance::ProvenanceReport;
pub use records::{
    digest_id, from_unix, trunc_secs, Artifact, AuditEntry, EventType, Layer, NormalizedEvent,
    Record, ScratchRecord, UpsertOutcome,
};

const DB_FILE: &str = "recon.sqlite";

const SCRATCH_COLUMNS: &str = "id,source,target,fetched_at,raw_payload,provenance";
const EVENT_COLUMNS: &str = "event_id,wallet,event_type,pool,value,timestamp,source_id,chain";
const ARTIFACT_COLUMNS: &str = "artifact_id,target,created_at,summary_text,signals,next_watchlist,source_ids,event_count,summary_model,summary_tokens";

/// Clonable handle over the reconciliation database. Every call opens its own connection,
/// so handles can be moved freely into blocking tasks.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    /// Scratch/artifact target, or event wallet.
    pub target: Option<String>,
    /// Only meaningful for the events layer.
    pub source_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRow {
    pub action_type: String,
    pub target: String,
    pub last_success_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CursorAdvance {
    Advanced { previous: Option<DateTime<Utc>> },
    RejectedBackward { current: DateTime<Utc> },
}

/// A cursor move committed together with the cycle's artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorMove {
    pub action_type: String,
    pub target: String,
    pub watermark: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleCommit {
    pub artifact: Option<UpsertOutcome>,
    pub cursor: Option<CursorAdvance>,
}

/// The write reached its commit point after the caller's deadline and was rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadlineExceeded;

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("write missed its deadline and was rolled back")
    }
}

impl std::error::Error for DeadlineExceeded {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub scratch: usize,
    pub events: usize,
    pub artifacts: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.scratch + self.events + self.artifacts
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreStatus {
    pub scratch: i64,
    pub events: i64,
    pub artifacts: i64,
    pub cursors: i64,
    pub audit_entries: i64,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let store = Self { db_path };
        let conn = store.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scratch (
              id TEXT PRIMARY KEY,
              source TEXT NOT NULL,
              target TEXT NOT NULL,
              fetched_at INTEGER NOT NULL,
              raw_payload TEXT NOT NULL,
              provenance TEXT NOT NULL,
              content_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scratch_target ON scratch(target);
            CREATE INDEX IF NOT EXISTS idx_scratch_fetched ON scratch(fetched_at);

            CREATE TABLE IF NOT EXISTS events (
              event_id TEXT PRIMARY KEY,
              wallet TEXT,
              event_type TEXT NOT NULL,
              pool TEXT,
              value TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              source_id TEXT NOT NULL,
              chain TEXT NOT NULL,
              content_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_wallet ON events(wallet);
            CREATE INDEX IF NOT EXISTS idx_events_source ON events(source_id);
            CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);

            CREATE TABLE IF NOT EXISTS artifacts (
              artifact_id TEXT PRIMARY KEY,
              target TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              summary_text TEXT NOT NULL,
              signals TEXT NOT NULL,
              next_watchlist TEXT NOT NULL,
              source_ids TEXT NOT NULL,
              event_count INTEGER NOT NULL,
              summary_model TEXT,
              summary_tokens INTEGER,
              content_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_target ON artifacts(target, created_at);

            CREATE TABLE IF NOT EXISTS cursors (
              action_type TEXT NOT NULL,
              target TEXT NOT NULL,
              last_success_at INTEGER NOT NULL,
              updated TEXT NOT NULL,
              PRIMARY KEY(action_type, target)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              at TEXT NOT NULL,
              layer TEXT NOT NULL,
              record_id TEXT NOT NULL,
              op TEXT NOT NULL,
              outcome TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS budget_ledger (
              date TEXT PRIMARY KEY,
              spent INTEGER NOT NULL DEFAULT 0,
              reserved INTEGER NOT NULL DEFAULT 0,
              daily_cap INTEGER NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS budget_reservations (
              id TEXT PRIMARY KEY,
              date TEXT NOT NULL,
              amount INTEGER NOT NULL,
              state TEXT NOT NULL,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_state ON budget_reservations(state);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Busy timeout (default 5000ms; override with RECON_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("RECON_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        Ok(conn)
    }

    // ---------------- Record layers ----------------

    /// Idempotent write keyed by the record's id. A matching content hash is a no-op.
    pub fn upsert(&self, record: &Record) -> Result<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = upsert_in(&tx, record)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Upsert a batch in one transaction; either every record lands or none do.
    pub fn upsert_many(&self, records: &[Record]) -> Result<Vec<UpsertOutcome>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(upsert_in(&tx, record)?);
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn get(&self, layer: Layer, id: &str) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}=?1",
            columns_for(layer),
            layer.table(),
            layer.id_column()
        );
        let rec = conn
            .query_row(&sql, [id], |row| record_from_row(layer, row))
            .optional()?;
        Ok(rec)
    }

    /// Filtered read, newest first.
    pub fn query(&self, layer: Layer, filter: &RecordFilter) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(target) = &filter.target {
            args.push(target.clone().into());
            clauses.push(format!("{}=?{}", layer.target_column(), args.len()));
        }
        if let (Some(source_id), Layer::Events) = (&filter.source_id, layer) {
            args.push(source_id.clone().into());
            clauses.push(format!("source_id=?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(since.timestamp().into());
            clauses.push(format!("{}>=?{}", layer.time_column(), args.len()));
        }
        if let Some(until) = filter.until {
            args.push(until.timestamp().into());
            clauses.push(format!("{}<=?{}", layer.time_column(), args.len()));
        }
        let mut sql = format!("SELECT {} FROM {}", columns_for(layer), layer.table());
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} DESC, {} ASC",
            layer.time_column(),
            layer.id_column()
        ));
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit.max(0)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| record_from_row(layer, row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Events attributable to `target` in the half-open window `(since, until]`: rows whose wallet
    /// is the target, plus rows derived from scratch records fetched for it. Ordered by id.
    pub fn events_for_target(
        &self,
        target: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE timestamp > ?2 AND timestamp <= ?3 \
               AND (wallet = ?1 OR source_id IN (SELECT id FROM scratch WHERE target = ?1)) \
             ORDER BY event_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![target, since.timestamp(), until.timestamp()],
            event_from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn latest_artifact(&self, target: &str) -> Result<Option<Artifact>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE target=?1 \
             ORDER BY created_at DESC, artifact_id DESC LIMIT 1"
        );
        let artifact = conn
            .query_row(&sql, [target], artifact_from_row)
            .optional()?;
        Ok(artifact)
    }

    /// Delete every record in `layer` whose timestamp is strictly before `older_than`.
    pub fn purge(&self, layer: Layer, older_than: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = purge_in(&tx, layer, older_than)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Apply each layer's fixed retention window relative to `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = PurgeReport {
            scratch: purge_in(&tx, Layer::Scratch, now - Layer::Scratch.retention())?,
            events: purge_in(&tx, Layer::Events, now - Layer::Events.retention())?,
            artifacts: purge_in(&tx, Layer::Artifacts, now - Layer::Artifacts.retention())?,
        };
        tx.commit()?;
        if report.total() > 0 {
            tracing::info!(
                target: "recon::store",
                scratch = report.scratch,
                events = report.events,
                artifacts = report.artifacts,
                "retention purge removed records"
            );
        }
        Ok(report)
    }

    // ---------------- Cursors ----------------

    pub fn cursor(&self, action_type: &str, target: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let secs: Option<i64> = conn
            .query_row(
                "SELECT last_success_at FROM cursors WHERE action_type=?1 AND target=?2",
                params![action_type, target],
                |r| r.get(0),
            )
            .optional()?;
        Ok(secs.map(from_unix))
    }

    pub fn cursors(&self) -> Result<Vec<CursorRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT action_type,target,last_success_at FROM cursors ORDER BY action_type,target",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CursorRow {
                action_type: row.get(0)?,
                target: row.get(1)?,
                last_success_at: from_unix(row.get(2)?),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Move a cursor forward. A watermark earlier than the stored one is refused and the
    /// stored value is returned untouched.
    pub fn advance_cursor(
        &self,
        action_type: &str,
        target: &str,
        watermark: DateTime<Utc>,
    ) -> Result<CursorAdvance> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = advance_cursor_in(&tx, action_type, target, watermark)?;
        tx.commit()?;
        Ok(result)
    }

    /// Persist a cycle's output as one unit: the artifact first, then the cursor. If
    /// `deadline` has passed once both are staged, the transaction is rolled back and the
    /// error carries [`DeadlineExceeded`].
    pub fn commit_cycle(
        &self,
        artifact: Option<&Record>,
        cursor: Option<&CursorMove>,
        deadline: Option<Instant>,
    ) -> Result<CycleCommit> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut out = CycleCommit::default();
        if let Some(record) = artifact {
            out.artifact = Some(upsert_in(&tx, record)?);
        }
        if let Some(m) = cursor {
            out.cursor = Some(advance_cursor_in(&tx, &m.action_type, &m.target, m.watermark)?);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tx.rollback()?;
            tracing::warn!(
                target: "recon::store",
                cursor = ?cursor.map(|m| (&m.action_type, &m.target)),
                "cycle commit rolled back past its deadline"
            );
            return Err(DeadlineExceeded.into());
        }
        tx.commit()?;
        Ok(out)
    }

    // ---------------- Audit / health ----------------

    pub fn audit_log(&self, limit: i64, after_seq: Option<i64>) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq,at,layer,record_id,op,outcome FROM audit_log \
             WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_seq.unwrap_or(0), limit], |row| {
            let at: String = row.get(1)?;
            Ok(AuditEntry {
                seq: row.get(0)?,
                at: DateTime::parse_from_rfc3339(&at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
                layer: row.get(2)?,
                record_id: row.get(3)?,
                op: row.get(4)?,
                outcome: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        let verdict: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        if verdict.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(anyhow!("sqlite quick_check failed: {}", verdict))
        }
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
        };
        Ok(StoreStatus {
            scratch: count("scratch")?,
            events: count("events")?,
            artifacts: count("artifacts")?,
            cursors: count("cursors")?,
            audit_entries: count("audit_log")?,
        })
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Store) -> Result<T> + Send + 'static,
    {
        let s = self.clone();
        tokio::task::spawn_blocking(move || f(s))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn upsert_many_async(&self, records: Vec<Record>) -> Result<Vec<UpsertOutcome>> {
        self.blocking(move |s| s.upsert_many(&records)).await
    }

    pub async fn upsert_async(&self, record: Record) -> Result<UpsertOutcome> {
        self.blocking(move |s| s.upsert(&record)).await
    }

    pub async fn events_for_target_async(
        &self,
        target: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedEvent>> {
        let t = target.to_string();
        self.blocking(move |s| s.events_for_target(&t, since, until))
            .await
    }

    pub async fn latest_artifact_async(&self, target: &str) -> Result<Option<Artifact>> {
        let t = target.to_string();
        self.blocking(move |s| s.latest_artifact(&t)).await
    }

    pub async fn purge_expired_async(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        self.blocking(move |s| s.purge_expired(now)).await
    }

    pub async fn cursors_async(&self) -> Result<Vec<CursorRow>> {
        self.blocking(|s| s.cursors()).await
    }

    pub async fn cursor_async(
        &self,
        action_type: &str,
        target: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let a = action_type.to_string();
        let t = target.to_string();
        self.blocking(move |s| s.cursor(&a, &t)).await
    }

    pub async fn ledger_async(
        &self,
        date: chrono::NaiveDate,
        daily_cap: i64,
    ) -> Result<LedgerEntry> {
        self.blocking(move |s| s.ledger(date, daily_cap)).await
    }

    pub async fn commit_cycle_async(
        &self,
        artifact: Option<Record>,
        cursor: Option<CursorMove>,
        deadline: Option<Instant>,
    ) -> Result<CycleCommit> {
        self.blocking(move |s| s.commit_cycle(artifact.as_ref(), cursor.as_ref(), deadline))
            .await
    }

    pub async fn reserve_async(
        &self,
        date: chrono::NaiveDate,
        amount: i64,
        daily_cap: i64,
    ) -> Result<Option<Reservation>> {
        self.blocking(move |s| s.reserve(date, amount, daily_cap))
            .await
    }

    pub async fn commit_reservation_async(&self, reservation: Reservation) -> Result<()> {
        self.blocking(move |s| s.commit_reservation(&reservation))
            .await
    }

    pub async fn release_reservation_async(&self, reservation: Reservation) -> Result<()> {
        self.blocking(move |s| s.release_reservation(&reservation))
            .await
    }
}

pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn append_audit(
    conn: &Connection,
    layer: &str,
    record_id: &str,
    op: &str,
    outcome: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log(at,layer,record_id,op,outcome) VALUES(?1,?2,?3,?4,?5)",
        params![now_text(), layer, record_id, op, outcome],
    )?;
    Ok(())
}

fn advance_cursor_in(
    conn: &Connection,
    action_type: &str,
    target: &str,
    watermark: DateTime<Utc>,
) -> Result<CursorAdvance> {
    let previous: Option<i64> = conn
        .query_row(
            "SELECT last_success_at FROM cursors WHERE action_type=?1 AND target=?2",
            params![action_type, target],
            |r| r.get(0),
        )
        .optional()?;
    let changed = conn.execute(
        "INSERT INTO cursors(action_type,target,last_success_at,updated) VALUES(?1,?2,?3,?4) \
         ON CONFLICT(action_type,target) DO UPDATE SET \
           last_success_at=excluded.last_success_at, updated=excluded.updated \
         WHERE excluded.last_success_at >= cursors.last_success_at",
        params![action_type, target, watermark.timestamp(), now_text()],
    )?;
    let result = if changed > 0 {
        CursorAdvance::Advanced {
            previous: previous.map(from_unix),
        }
    } else {
        CursorAdvance::RejectedBackward {
            current: from_unix(previous.unwrap_or_default()),
        }
    };
    let outcome = match &result {
        CursorAdvance::Advanced { .. } => "advanced",
        CursorAdvance::RejectedBackward { .. } => "rejected_backward",
    };
    append_audit(
        conn,
        "cursors",
        &format!("{action_type}:{target}"),
        "advance",
        outcome,
    )?;
    Ok(result)
}

fn upsert_in(conn: &Connection, record: &Record) -> Result<UpsertOutcome> {
    let layer = record.layer();
    let id = record.id();
    let hash = record.content_hash();
    let existing: Option<String> = conn
        .query_row(
            &format!(
                "SELECT content_hash FROM {} WHERE {}=?1",
                layer.table(),
                layer.id_column()
            ),
            [id],
            |r| r.get(0),
        )
        .optional()?;
    let outcome = match existing {
        None => UpsertOutcome::Inserted,
        Some(h) if h == hash => UpsertOutcome::Unchanged,
        Some(_) => UpsertOutcome::Updated,
    };
    if outcome != UpsertOutcome::Unchanged {
        write_row(conn, record, &hash)?;
    }
    append_audit(conn, layer.as_str(), id, "upsert", outcome.as_str())?;
    Ok(outcome)
}

fn write_row(conn: &Connection, record: &Record, hash: &str) -> Result<()> {
    match record {
        Record::Scratch(r) => {
            conn.execute(
                "INSERT OR REPLACE INTO scratch(id,source,target,fetched_at,raw_payload,provenance,content_hash) \
                 VALUES(?1,?2,?3,?4,?5,?6,?7)",
                params![
                    r.id,
                    r.source,
                    r.target,
                    r.fetched_at.timestamp(),
                    r.raw_payload,
                    serde_json::to_string(&r.provenance)?,
                    hash
                ],
            )?;
        }
        Record::Event(e) => {
            conn.execute(
                "INSERT OR REPLACE INTO events(event_id,wallet,event_type,pool,value,timestamp,source_id,chain,content_hash) \
                 VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    e.event_id,
                    e.wallet,
                    e.event_type.as_str(),
                    e.pool,
                    serde_json::to_string(&e.value)?,
                    e.timestamp.timestamp(),
                    e.source_id,
                    e.chain,
                    hash
                ],
            )?;
        }
        Record::Artifact(a) => {
            conn.execute(
                "INSERT OR REPLACE INTO artifacts(artifact_id,target,created_at,summary_text,signals,next_watchlist,source_ids,event_count,summary_model,summary_tokens,content_hash) \
                 VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    a.artifact_id,
                    a.target,
                    a.created_at.timestamp(),
                    a.summary_text,
                    serde_json::to_string(&a.signals)?,
                    serde_json::to_string(&a.next_watchlist)?,
                    serde_json::to_string(&a.source_ids)?,
                    a.event_count as i64,
                    a.summary_model,
                    a.summary_tokens.map(|t| t as i64),
                    hash
                ],
            )?;
        }
    }
    Ok(())
}

fn purge_in(conn: &Connection, layer: Layer, older_than: DateTime<Utc>) -> Result<usize> {
    let removed = conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} < ?1",
            layer.table(),
            layer.time_column()
        ),
        [older_than.timestamp()],
    )?;
    append_audit(
        conn,
        layer.as_str(),
        "*",
        "purge",
        &format!("removed:{removed}"),
    )?;
    Ok(removed)
}

fn columns_for(layer: Layer) -> &'static str {
    match layer {
        Layer::Scratch => SCRATCH_COLUMNS,
        Layer::Events => EVENT_COLUMNS,
        Layer::Artifacts => ARTIFACT_COLUMNS,
    }
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(layer: Layer, row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(match layer {
        Layer::Scratch => Record::Scratch(scratch_from_row(row)?),
        Layer::Events => Record::Event(event_from_row(row)?),
        Layer::Artifacts => Record::Artifact(artifact_from_row(row)?),
    })
}

pub(crate) fn scratch_from_row(row: &Row<'_>) -> rusqlite::Result<ScratchRecord> {
    Ok(ScratchRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        target: row.get(2)?,
        fetched_at: from_unix(row.get(3)?),
        raw_payload: row.get(4)?,
        provenance: json_col(row, 5)?,
    })
}

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<NormalizedEvent> {
    let kind: String = row.get(2)?;
    let event_type = EventType::from_slug(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown event_type {kind}").into(),
        )
    })?;
    Ok(NormalizedEvent {
        event_id: row.get(0)?,
        wallet: row.get(1)?,
        event_type,
        pool: row.get(3)?,
        value: json_col(row, 4)?,
        timestamp: from_unix(row.get(5)?),
        source_id: row.get(6)?,
        chain: row.get(7)?,
    })
}

pub(crate) fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let count: i64 = row.get(7)?;
    let tokens: Option<i64> = row.get(9)?;
    Ok(Artifact {
        artifact_id: row.get(0)?,
        target: row.get(1)?,
        created_at: from_unix(row.get(2)?),
        summary_text: row.get(3)?,
        signals: json_col(row, 4)?,
        next_watchlist: json_col(row, 5)?,
        source_ids: json_col(row, 6)?,
        event_count: count.max(0) as u64,
        summary_model: row.get(8)?,
        summary_tokens: tokens.map(|t| t.max(0) as u64),
    })
}
