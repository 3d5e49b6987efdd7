use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Default freshness window after which a full pass is forced.
pub const FRESHNESS_DAYS: i64 = 30;

/// What the scheduler knows about the previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    pub last_execution: Option<DateTime<Utc>>,
    pub last_job_was_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// First page of bills only.
    Incremental,
    /// Exhaustive pagination plus identity refresh.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SyncReason {
    #[strum(to_string = "no previous execution")]
    ColdStart,
    #[strum(to_string = "previous execution is stale")]
    Stale,
    #[strum(to_string = "previous execution failed")]
    PreviousFailure,
    #[strum(to_string = "full sync forced")]
    Forced,
    #[strum(to_string = "previous execution is recent")]
    Fresh,
}

/// Chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    pub mode: SyncMode,
    pub reason: SyncReason,
}

impl SyncDecision {
    pub fn refresh_identity(self) -> bool {
        self.mode == SyncMode::Full
    }

    pub fn forced() -> Self {
        Self {
            mode: SyncMode::Full,
            reason: SyncReason::Forced,
        }
    }
}

/// Picks the sync mode for this run. A previous run exactly `freshness_days`
/// old still counts as fresh.
pub fn select(ctx: SyncContext, now: DateTime<Utc>, freshness_days: i64) -> SyncDecision {
    let full = |reason| SyncDecision {
        mode: SyncMode::Full,
        reason,
    };

    let Some(last) = ctx.last_execution else {
        return full(SyncReason::ColdStart);
    };
    if ctx.last_job_was_failure {
        return full(SyncReason::PreviousFailure);
    }
    if now.signed_duration_since(last) > Duration::days(freshness_days) {
        return full(SyncReason::Stale);
    }

    SyncDecision {
        mode: SyncMode::Incremental,
        reason: SyncReason::Fresh,
    }
}
