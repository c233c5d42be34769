//! Durable running total of water used across irrigation sessions.
//!
//! Stored as a small JSON file:
//!
//! ```json
//! { "total_water_used": 12.3456, "last_updated": "2026-10-19T05:12:00Z" }
//! ```
//!
//! A missing or unreadable file starts the ledger at zero. Writes go to a
//! sibling temp file first and are renamed into place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] io::Error),
    #[error("ledger encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored total {0}")]
    Invalid(f64),
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    total_water_used: f64,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Debug)]
pub struct WaterLedger {
    path: PathBuf,
    total_liters: f64,
}

impl WaterLedger {
    /// Load the stored total, falling back to zero on any problem.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let total_liters = match read_total(&path) {
            Ok(total) => {
                info!(path = %path.display(), total_liters = total, "water ledger loaded");
                total
            }
            Err(e) => {
                warn!(path = %path.display(), "water ledger unavailable, starting at 0: {e}");
                0.0
            }
        };
        Self { path, total_liters }
    }

    pub fn total_liters(&self) -> f64 {
        self.total_liters
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fold a session's usage into the total and persist it.
    ///
    /// The in-memory total is kept even when the write fails.
    pub fn record_session(&mut self, liters: f64) -> Result<f64, LedgerError> {
        if liters.is_finite() && liters > 0.0 {
            self.total_liters += liters;
        } else if liters != 0.0 {
            warn!(liters, "ignoring invalid session usage");
        }
        self.save()?;
        Ok(self.total_liters)
    }

    /// Persist the rounded total plus a timestamp.
    pub fn save(&self) -> Result<(), LedgerError> {
        let record = LedgerFile {
            total_water_used: (self.total_liters * 10_000.0).round() / 10_000.0,
            last_updated: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        };
        let body = serde_json::to_vec_pretty(&record)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_total(path: &Path) -> Result<f64, LedgerError> {
    let file: LedgerFile = serde_json::from_slice(&fs::read(path)?)?;
    if !file.total_water_used.is_finite() || file.total_water_used < 0.0 {
        return Err(LedgerError::Invalid(file.total_water_used));
    }
    Ok(file.total_water_used)
}

// ===========================================================================
// Tests
// ===========================================================================
