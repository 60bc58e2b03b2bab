//! Append-only plaintext ledger of resolved incidents.
//!
//! One CSV row per closed incident, jitter included (with its own note),
//! so the on-disk record is complete even when no notification went out.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::incident::IncidentRecord;

const HEADER: &str = "start,end,duration,role,note";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// CSV incident ledger. Errors are returned so the caller can log them;
/// nothing here is fatal to monitoring.
pub struct IncidentLedger {
    path: PathBuf,
}

impl IncidentLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one resolved incident, writing the header first on a fresh
    /// file.
    pub fn append(&self, record: &IncidentRecord) -> Result<(), LedgerError> {
        let fresh = !self.path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if fresh {
            writeln!(file, "{}", HEADER)?;
        }

        let note = if record.suppressed {
            "jitter"
        } else {
            "auto-resolved"
        };
        writeln!(
            file,
            "{},{},{},{},{}",
            record.start.format("%Y-%m-%d %H:%M:%S"),
            record.end.format("%Y-%m-%d %H:%M:%S"),
            format_duration(record.duration),
            record.role,
            note,
        )?;
        Ok(())
    }
}

/// H:MM:SS, microseconds dropped.
fn format_duration(d: std::time::Duration) -> String {
    let total = d.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
