//! Run ledger: what the next run's sync policy needs to know.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use super::fs::{read_json, write_json};
use crate::error::HarvestError;
use crate::portal::harvest::HarvestReport;
use crate::portal::sync_policy::{SyncContext, SyncMode};

pub const OUTCOME_OK: &str = "OK";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_execution: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_was_failure: bool,
    /// `OK` or the failing error's code.
    pub last_outcome: Option<String>,
    pub last_mode: Option<SyncMode>,
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub runs: u64,
}

impl LedgerEntry {
    pub fn sync_context(&self) -> SyncContext {
        SyncContext {
            last_execution: self.last_execution,
            last_job_was_failure: self.last_job_was_failure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunLedger {
    path: PathBuf,
}

impl RunLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> Result<LedgerEntry> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    /// Records the outcome of a run that started at `started`.
    pub async fn record(
        &self,
        started: DateTime<Utc>,
        outcome: &std::result::Result<HarvestReport, HarvestError>,
    ) -> Result<LedgerEntry> {
        let mut entry = self.load().await?;
        entry.last_execution = Some(started);
        entry.last_run_id = Some(uuid::Uuid::new_v4().to_string());
        entry.runs += 1;
        match outcome {
            Ok(report) => {
                entry.last_success = Some(started);
                entry.last_job_was_failure = false;
                entry.last_outcome = Some(OUTCOME_OK.into());
                entry.last_mode = Some(report.decision.mode);
            }
            Err(err) => {
                entry.last_job_was_failure = true;
                entry.last_outcome = Some(err.code().into());
            }
        }
        write_json(&self.path, &entry).await?;
        debug!(outcome = entry.last_outcome.as_deref().unwrap_or_default(), "ledger updated");
        Ok(entry)
    }
}
