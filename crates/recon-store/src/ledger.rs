//! Daily spend ledger. Amounts are integer micro-USD.
//!
//! A cycle reserves its cost up front and later either commits it (moves it into `spent`) or
//! releases it. The reserve check runs inside an IMMEDIATE transaction so concurrent callers
//! serialize on the row and `spent + reserved` can never exceed the cap.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{append_audit, now_text, Store};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub spent: i64,
    pub reserved: i64,
    pub daily_cap: i64,
}

impl LedgerEntry {
    pub fn headroom(&self) -> i64 {
        (self.daily_cap - self.spent - self.reserved).max(0)
    }
}

/// Handle for an outstanding hold on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub date: NaiveDate,
    pub amount: i64,
}

const STATE_HELD: &str = "held";
const STATE_COMMITTED: &str = "committed";
const STATE_RELEASED: &str = "released";

impl Store {
    /// Current totals for `date`; a day with no activity reports zeroes against `daily_cap`.
    pub fn ledger(&self, date: NaiveDate, daily_cap: i64) -> Result<LedgerEntry> {
        let conn = self.conn()?;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT spent,reserved FROM budget_ledger WHERE date=?1",
                [date.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (spent, reserved) = row.unwrap_or((0, 0));
        Ok(LedgerEntry {
            date,
            spent,
            reserved,
            daily_cap,
        })
    }

    /// Hold `amount` against `date` if it fits under `daily_cap`. `None` means the day is exhausted.
    pub fn reserve(
        &self,
        date: NaiveDate,
        amount: i64,
        daily_cap: i64,
    ) -> Result<Option<Reservation>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let day = date.to_string();
        let now = now_text();
        tx.execute(
            "INSERT INTO budget_ledger(date,spent,reserved,daily_cap,updated) VALUES(?1,0,0,?2,?3) \
             ON CONFLICT(date) DO UPDATE SET daily_cap=excluded.daily_cap",
            params![day, daily_cap, now],
        )?;
        let (spent, reserved): (i64, i64) = tx.query_row(
            "SELECT spent,reserved FROM budget_ledger WHERE date=?1",
            [&day],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if amount < 0 || spent + reserved + amount > daily_cap {
            append_audit(&tx, "ledger", &day, "reserve", "exhausted")?;
            tx.commit()?;
            return Ok(None);
        }
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "UPDATE budget_ledger SET reserved=reserved+?2, updated=?3 WHERE date=?1",
            params![day, amount, now],
        )?;
        tx.execute(
            "INSERT INTO budget_reservations(id,date,amount,state,created,updated) VALUES(?1,?2,?3,?4,?5,?5)",
            params![id, day, amount, STATE_HELD, now],
        )?;
        append_audit(&tx, "ledger", &id, "reserve", STATE_HELD)?;
        tx.commit()?;
        Ok(Some(Reservation { id, date, amount }))
    }

    /// Convert a held reservation into spend. Settling twice is a no-op.
    pub fn commit_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.settle(reservation, STATE_COMMITTED)
    }

    /// Return a held reservation's amount to the day's headroom. Settling twice is a no-op.
    pub fn release_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.settle(reservation, STATE_RELEASED)
    }

    fn settle(&self, reservation: &Reservation, next: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_text();
        let flipped = tx.execute(
            "UPDATE budget_reservations SET state=?2, updated=?3 WHERE id=?1 AND state=?4",
            params![reservation.id, next, now, STATE_HELD],
        )?;
        if flipped == 0 {
            tx.commit()?;
            return Ok(());
        }
        let spent_delta = if next == STATE_COMMITTED {
            reservation.amount
        } else {
            0
        };
        tx.execute(
            "UPDATE budget_ledger SET reserved=MAX(reserved-?2,0), spent=spent+?3, updated=?4 WHERE date=?1",
            params![reservation.date.to_string(), reservation.amount, spent_delta, now],
        )?;
        append_audit(&tx, "ledger", &reservation.id, "settle", next)?;
        tx.commit()?;
        Ok(())
    }

    /// Release every reservation still held. Only safe when no cycle is in flight, i.e. at startup
    /// after an unclean shutdown.
    pub fn release_stale_reservations(&self) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id,date,amount FROM budget_reservations WHERE state=?1")?;
        let rows = stmt.query_map([STATE_HELD], |r| {
            let date: String = r.get(1)?;
            Ok((r.get::<_, String>(0)?, date, r.get::<_, i64>(2)?))
        })?;
        let mut held = Vec::new();
        for r in rows {
            let (id, date, amount) = r?;
            if let Ok(date) = date.parse::<NaiveDate>() {
                held.push(Reservation { id, date, amount });
            }
        }
        drop(stmt);
        drop(conn);
        for reservation in &held {
            self.release_reservation(reservation)?;
        }
        if !held.is_empty() {
            tracing::warn!(
                target: "recon::store",
                count = held.len(),
                "released budget reservations left over from a previous run"
            );
        }
        Ok(held.len())
    }
}
