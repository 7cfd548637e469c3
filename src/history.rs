use crate::job::{JobOutcome, StopReason, TerminalState};
use crate::registry::JobTallies;
use rusqlite::{params, Connection, Result};
use serde::Serialize;
use std::path::Path;

/// Opens (or creates) the job history database at the given path.
///
/// Creates the jobs table and indexes if they don't already exist.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    // Enable WAL mode for better concurrent read performance
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            category     TEXT NOT NULL,
            challenge    TEXT,
            program      TEXT NOT NULL,
            args         TEXT NOT NULL,
            started      TEXT NOT NULL,
            finished     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            state        TEXT NOT NULL,
            summary      TEXT NOT NULL,
            exit_code    INTEGER,
            duration_ms  INTEGER NOT NULL,
            stdout_bytes INTEGER NOT NULL,
            stderr_bytes INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
        CREATE INDEX IF NOT EXISTS idx_jobs_category ON jobs(category);
        CREATE INDEX IF NOT EXISTS idx_jobs_challenge ON jobs(challenge);",
    )?;
    Ok(())
}

/// Coarse state label stored in the `state` column.
fn state_label(outcome: &JobOutcome) -> &'static str {
    match &outcome.state {
        s if s.is_success() => "completed",
        TerminalState::Killed { reason } => match reason {
            StopReason::Timeout { .. } => "timed_out",
            StopReason::Cancelled => "cancelled",
            StopReason::Shutdown => "shutdown",
        },
        _ => "failed",
    }
}

/// Record a finished job. Returns the new row id.
pub fn record(conn: &Connection, outcome: &JobOutcome) -> Result<i64> {
    let exit_code = match outcome.state {
        TerminalState::Completed { exit_code } => Some(exit_code),
        _ => None,
    };
    let args = serde_json::to_string(&outcome.command.args)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO jobs (name, category, challenge, program, args, started, state, summary, exit_code, duration_ms, stdout_bytes, stderr_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            outcome.name,
            outcome.category.to_string(),
            outcome.challenge,
            outcome.command.program,
            args,
            outcome.started_at.to_rfc3339(),
            state_label(outcome),
            outcome.state.to_string(),
            exit_code,
            outcome.duration.as_millis() as i64,
            outcome.stdout.total_bytes as i64,
            outcome.stderr.total_bytes as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A row from the jobs table.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub challenge: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub started: String,
    pub finished: String,
    pub state: String,
    pub summary: String,
    pub exit_code: Option<i32>,
    pub duration_ms: i64,
}

/// Most recent jobs first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, category, challenge, program, args, started, finished, state, summary, exit_code, duration_ms
         FROM jobs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        let args: String = row.get(5)?;
        Ok(HistoryEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            challenge: row.get(3)?,
            program: row.get(4)?,
            args: serde_json::from_str(&args).unwrap_or_default(),
            started: row.get(6)?,
            finished: row.get(7)?,
            state: row.get(8)?,
            summary: row.get(9)?,
            exit_code: row.get(10)?,
            duration_ms: row.get(11)?,
        })
    })?;
    rows.collect()
}

/// Totals per terminal state across the whole history.
pub fn tally(conn: &Connection) -> Result<JobTallies> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
    let mut rows = stmt.query([])?;
    let mut tallies = JobTallies::default();
    while let Some(row) = rows.next()? {
        let state: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        let count = count as u64;
        match state.as_str() {
            "completed" => tallies.completed += count,
            "timed_out" => tallies.timed_out += count,
            "failed" => tallies.failed += count,
            "shutdown" => tallies.shutdown += count,
            _ => tallies.cancelled += count,
        }
    }
    Ok(tallies)
}
