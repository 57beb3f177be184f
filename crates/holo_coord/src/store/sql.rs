//! Relational backend on SQLite.
//!
//! Multi-row writes run inside `BEGIN IMMEDIATE` transactions, which take the
//! database write lock up front; this plays the role of `SELECT ... FOR UPDATE`
//! for the status checks that precede branch writes. Several processes (or
//! several stores in one process) may open the same file.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{check_finished, next_cron_time, GlobalField, StoreError, StoreResult, TransStore};
use crate::model::{
    unix_time_ms, BranchStatus, BranchStatusUpdate, TransBranch, TransGlobal, TransOptions,
    TransStatus,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trans_global (
    gid TEXT PRIMARY KEY,
    trans_type TEXT NOT NULL,
    status TEXT NOT NULL,
    protocol TEXT NOT NULL,
    query_prepared TEXT NOT NULL DEFAULT '',
    options TEXT NOT NULL DEFAULT '',
    custom_data TEXT NOT NULL DEFAULT '',
    next_cron_interval INTEGER NOT NULL,
    next_cron_time INTEGER NOT NULL,
    owner TEXT NOT NULL DEFAULT '',
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL,
    commit_time INTEGER,
    finish_time INTEGER,
    rollback_time INTEGER
);
CREATE INDEX IF NOT EXISTS idx_trans_global_due ON trans_global (status, next_cron_time);
CREATE INDEX IF NOT EXISTS idx_trans_global_owner ON trans_global (owner);
CREATE TABLE IF NOT EXISTS trans_branch_op (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL,
    branch_id TEXT NOT NULL,
    op TEXT NOT NULL,
    url TEXT NOT NULL,
    bin_data BLOB NOT NULL,
    status TEXT NOT NULL,
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL,
    finish_time INTEGER,
    UNIQUE (gid, branch_id, op)
);
";

const GLOBAL_COLUMNS: &str = "gid, trans_type, status, protocol, query_prepared, options, \
     custom_data, next_cron_interval, next_cron_time, owner, create_time, update_time, \
     commit_time, finish_time, rollback_time";

const BRANCH_COLUMNS: &str =
    "gid, branch_id, op, url, bin_data, status, create_time, update_time, finish_time";

const BRANCH_UPSERT: &str = "
INSERT INTO trans_branch_op
    (gid, branch_id, op, url, bin_data, status, create_time, update_time, finish_time)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT (gid, branch_id, op) DO UPDATE SET
    status = excluded.status,
    update_time = excluded.update_time,
    finish_time = excluded.finish_time
WHERE trans_branch_op.status = 'prepared'
";

pub struct SqlTransStore {
    conn: Mutex<Connection>,
}

impl SqlTransStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it cannot go through execute().
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Invariant("sql connection mutex poisoned".to_string()))
    }
}

impl TransStore for SqlTransStore {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn populate(&self, skip_drop: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        if !skip_drop {
            conn.execute_batch("DROP TABLE IF EXISTS trans_branch_op; DROP TABLE IF EXISTS trans_global;")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn save_new_trans(&self, global: &TransGlobal, branches: &[TransBranch]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO trans_global ({GLOBAL_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT (gid) DO NOTHING"
            ),
            params_from_iter(global_values(global)?),
        )?;
        if inserted == 0 {
            // Dropping the transaction rolls it back.
            return Err(StoreError::UniqueConflict);
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trans_branch_op \
                 (gid, branch_id, op, url, bin_data, status, create_time, update_time, finish_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (gid, branch_id, op) DO NOTHING",
            )?;
            for branch in branches {
                stmt.execute(params_from_iter(branch_values(branch)))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_trans_global(&self, gid: &str) -> StoreResult<TransGlobal> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {GLOBAL_COLUMNS} FROM trans_global WHERE gid = ?1"),
            params![gid],
            global_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    fn scan_trans_globals(
        &self,
        cursor: &mut Option<String>,
        limit: usize,
    ) -> StoreResult<Vec<TransGlobal>> {
        let conn = self.conn()?;
        let limit = limit.max(1) as i64;
        let after = cursor.clone().unwrap_or_default();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GLOBAL_COLUMNS} FROM trans_global WHERE gid > ?1 ORDER BY gid LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after, limit], global_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(last) = rows.last() {
            *cursor = Some(last.gid.clone());
        }
        Ok(rows)
    }

    fn get_branches(&self, gid: &str) -> StoreResult<Vec<TransBranch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BRANCH_COLUMNS} FROM trans_branch_op WHERE gid = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![gid], branch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_branch_statuses(&self, updates: &[BranchStatusUpdate]) -> StoreResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = to_sql_ms(unix_time_ms());
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE trans_branch_op SET status = ?1, finish_time = ?2, update_time = ?3 \
                 WHERE gid = ?4 AND branch_id = ?5 AND op = ?6 AND status = 'prepared'",
            )?;
            for update in updates {
                changed += stmt.execute(params![
                    update.status.as_str(),
                    to_sql_ms(update.finish_time),
                    now,
                    update.gid,
                    update.branch_id,
                    update.op.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        expected: TransStatus,
        branches: &[TransBranch],
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM trans_global WHERE gid = ?1",
                params![gid],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(expected.as_str()) {
            return Err(StoreError::NotFound);
        }
        {
            let mut stmt = tx.prepare(BRANCH_UPSERT)?;
            for branch in branches {
                stmt.execute(params_from_iter(branch_values(branch)))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn change_global_status(
        &self,
        global: &mut TransGlobal,
        new_status: TransStatus,
        fields: &[GlobalField],
        finished: bool,
    ) -> StoreResult<()> {
        // Terminal statuses fall outside the claim predicate, so `finished`
        // needs no bookkeeping beyond the check.
        check_finished(&global.gid, new_status, finished)?;
        let old_status = global.status;
        let now = unix_time_ms();

        let mut sets = vec!["status = ?", "update_time = ?"];
        let mut values = vec![
            Value::Text(new_status.as_str().to_string()),
            Value::Integer(to_sql_ms(now)),
        ];
        for field in fields {
            match field {
                GlobalField::NextCron => {
                    sets.push("next_cron_interval = ?");
                    values.push(Value::Integer(to_sql_ms(global.next_cron_interval)));
                    sets.push("next_cron_time = ?");
                    values.push(Value::Integer(to_sql_ms(global.next_cron_time)));
                }
                GlobalField::CommitTime => {
                    sets.push("commit_time = ?");
                    values.push(optional_ms(global.commit_time));
                }
                GlobalField::FinishTime => {
                    sets.push("finish_time = ?");
                    values.push(optional_ms(global.finish_time));
                }
                GlobalField::RollbackTime => {
                    sets.push("rollback_time = ?");
                    values.push(optional_ms(global.rollback_time));
                }
            }
        }
        values.push(Value::Text(global.gid.clone()));
        values.push(Value::Text(old_status.as_str().to_string()));

        let sql = format!(
            "UPDATE trans_global SET {} WHERE gid = ? AND status = ?",
            sets.join(", ")
        );
        let conn = self.conn()?;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        global.status = new_status;
        global.update_time = now;
        Ok(())
    }

    fn touch_cron_time(&self, global: &mut TransGlobal, next_interval: u64) -> StoreResult<()> {
        let now = unix_time_ms();
        let next_time = next_cron_time(now, next_interval);
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE trans_global SET next_cron_interval = ?1, next_cron_time = ?2, update_time = ?3 \
             WHERE gid = ?4 AND status = ?5",
            params![
                to_sql_ms(next_interval),
                to_sql_ms(next_time),
                to_sql_ms(now),
                global.gid,
                global.status.as_str(),
            ],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM trans_global WHERE gid = ?1",
                    params![global.gid],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => StoreError::NotFound,
                None => StoreError::Invariant(format!(
                    "cron touch hit no row for gid {}",
                    global.gid
                )),
            });
        }
        global.next_cron_interval = next_interval;
        global.next_cron_time = next_time;
        global.update_time = now;
        Ok(())
    }

    fn lock_one_global_trans(&self, visibility: Duration) -> StoreResult<TransGlobal> {
        let now = unix_time_ms();
        let touched_before = now.saturating_sub(visibility.as_millis().min(u128::from(u64::MAX)) as u64);
        let owner = uuid::Uuid::new_v4().simple().to_string();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx.execute(
            "UPDATE trans_global SET owner = ?1, update_time = ?2 \
             WHERE gid = ( \
                 SELECT gid FROM trans_global \
                 WHERE status IN ('prepared', 'submitted', 'aborting') \
                   AND next_cron_time <= ?2 AND update_time <= ?3 \
                 ORDER BY next_cron_time LIMIT 1 \
             ) AND update_time <= ?3",
            params![owner, to_sql_ms(now), to_sql_ms(touched_before)],
        )?;
        if claimed == 0 {
            return Err(StoreError::NotFound);
        }
        let global = tx
            .query_row(
                &format!("SELECT {GLOBAL_COLUMNS} FROM trans_global WHERE owner = ?1"),
                params![owner],
                global_from_row,
            )
            .optional()?;
        let Some(global) = global else {
            return Err(StoreError::Invariant(format!(
                "claimed row not readable by owner token {owner}"
            )));
        };
        tx.commit()?;
        Ok(global)
    }
}

fn to_sql_ms(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_ms(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn optional_ms(v: Option<u64>) -> Value {
    match v {
        Some(ms) => Value::Integer(to_sql_ms(ms)),
        None => Value::Null,
    }
}

fn global_values(global: &TransGlobal) -> StoreResult<Vec<Value>> {
    Ok(vec![
        Value::Text(global.gid.clone()),
        Value::Text(global.trans_type.as_str().to_string()),
        Value::Text(global.status.as_str().to_string()),
        Value::Text(global.protocol.as_str().to_string()),
        Value::Text(global.query_prepared.clone()),
        Value::Text(serde_json::to_string(&global.options)?),
        Value::Text(global.custom_data.clone()),
        Value::Integer(to_sql_ms(global.next_cron_interval)),
        Value::Integer(to_sql_ms(global.next_cron_time)),
        Value::Text(global.owner.clone()),
        Value::Integer(to_sql_ms(global.create_time)),
        Value::Integer(to_sql_ms(global.update_time)),
        optional_ms(global.commit_time),
        optional_ms(global.finish_time),
        optional_ms(global.rollback_time),
    ])
}

fn branch_values(branch: &TransBranch) -> Vec<Value> {
    vec![
        Value::Text(branch.gid.clone()),
        Value::Text(branch.branch_id.clone()),
        Value::Text(branch.op.as_str().to_string()),
        Value::Text(branch.url.clone()),
        Value::Blob(branch.bin_data.clone()),
        Value::Text(branch.status.as_str().to_string()),
        Value::Integer(to_sql_ms(branch.create_time)),
        Value::Integer(to_sql_ms(branch.update_time)),
        optional_ms(branch.finish_time),
    ]
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into()))
}

fn global_from_row(row: &Row<'_>) -> rusqlite::Result<TransGlobal> {
    let options_raw: String = row.get(5)?;
    let options = if options_raw.is_empty() {
        TransOptions::default()
    } else {
        serde_json::from_str(&options_raw)
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err)))?
    };
    Ok(TransGlobal {
        gid: row.get(0)?,
        trans_type: parse_text(row, 1)?,
        status: parse_text(row, 2)?,
        protocol: parse_text(row, 3)?,
        query_prepared: row.get(4)?,
        options,
        custom_data: row.get(6)?,
        next_cron_interval: from_sql_ms(row.get(7)?),
        next_cron_time: from_sql_ms(row.get(8)?),
        owner: row.get(9)?,
        create_time: from_sql_ms(row.get(10)?),
        update_time: from_sql_ms(row.get(11)?),
        commit_time: row.get::<_, Option<i64>>(12)?.map(from_sql_ms),
        finish_time: row.get::<_, Option<i64>>(13)?.map(from_sql_ms),
        rollback_time: row.get::<_, Option<i64>>(14)?.map(from_sql_ms),
    })
}

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<TransBranch> {
    let status: BranchStatus = parse_text(row, 5)?;
    Ok(TransBranch {
        gid: row.get(0)?,
        branch_id: row.get(1)?,
        op: parse_text(row, 2)?,
        url: row.get(3)?,
        bin_data: row.get(4)?,
        status,
        create_time: from_sql_ms(row.get(6)?),
        update_time: from_sql_ms(row.get(7)?),
        finish_time: row.get::<_, Option<i64>>(8)?.map(from_sql_ms),
    })
}
