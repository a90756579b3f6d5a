//! Export sinks for the final ledger.

use crate::effects::SinkError;
use rollcall_core::ExportRow;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Receives the ordered rows once the session is over.
pub trait ExportSink {
    fn name(&self) -> &'static str;

    /// Write the rows; returns how many were written.
    fn export(&mut self, rows: &[ExportRow]) -> Result<usize, SinkError>;
}

/// `attendance(date, name, arrival, status)`, one row per person per day.
///
/// Re-exporting the same day replaces that day's rows for the same names.
pub struct SqliteSink {
    conn: Connection,
    session_id: String,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn with_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance (
                date       TEXT NOT NULL,
                name       TEXT NOT NULL,
                arrival    TEXT NOT NULL DEFAULT '',
                status     TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (date, name)
            );",
        )?;
        Ok(Self {
            conn,
            session_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

impl ExportSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn export(&mut self, rows: &[ExportRow]) -> Result<usize, SinkError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO attendance (date, name, arrival, status, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.date.format("%Y-%m-%d").to_string(),
                    row.name.as_str(),
                    row.arrival_text(),
                    row.status.as_str(),
                    self.session_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    session_id: &'a str,
    rows: &'a [ExportRow],
}

/// Pretty-printed JSON document, overwritten on each export.
pub struct JsonSink {
    path: PathBuf,
    session_id: String,
}

impl JsonSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl ExportSink for JsonSink {
    fn name(&self) -> &'static str {
        "json"
    }

    fn export(&mut self, rows: &[ExportRow]) -> Result<usize, SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let doc = JsonExport {
            session_id: &self.session_id,
            rows,
        };
        std::fs::write(&self.path, serde_json::to_vec_pretty(&doc)?)?;
        Ok(rows.len())
    }
}

/// Hand the rows to every sink. A failing sink is logged and the rest still run.
///
/// Returns the number of sinks that succeeded.
pub fn export_all(sinks: &mut [Box<dyn ExportSink>], rows: &[ExportRow]) -> usize {
    let mut ok = 0;
    for sink in sinks.iter_mut() {
        match sink.export(rows) {
            Ok(n) => {
                ok += 1;
                tracing::info!(sink = sink.name(), rows = n, "attendance exported");
            }
            Err(e) => tracing::warn!(sink = sink.name(), error = %e, "export failed"),
        }
    }
    ok
}
