use std::time::Duration;

use thiserror::Error;

use crate::portal::page::DriverError;
use crate::portal::wait::WaitError;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Terminal outcomes of a harvest run.
///
/// Every named portal operation catches low-level [`DriverError`]s at its
/// boundary and re-raises them as one of these variants, tagged with the stage
/// that failed. Application glue (config, store, CLI) keeps using
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ── Authentication ──────────────────────────────────────────────────
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    // ── Vendor breakage ─────────────────────────────────────────────────
    #[error("vendor unavailable during {stage}: {detail}")]
    VendorUnavailable { stage: &'static str, detail: String },

    // ── Pagination ──────────────────────────────────────────────────────
    #[error("pagination stalled on page {page} after {waited_secs}s: {detail}")]
    PaginationStalled {
        page: usize,
        waited_secs: u64,
        detail: String,
    },

    // ── Reconciliation ──────────────────────────────────────────────────
    #[error("partial sync: {skipped_docs} document(s) could not be categorized ({saved} saved)")]
    PartialSync { skipped_docs: usize, saved: usize },

    #[error("unexpected data during {stage}: {detail}")]
    UnknownError { stage: &'static str, detail: String },

    // ── Persistence collaborator ────────────────────────────────────────
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarvestError {
    /// Maps a page-level failure raised inside `stage`.
    ///
    /// Missing elements and navigation timeouts mean the portal no longer
    /// looks the way the site profile expects; anything else is unexpected.
    pub fn from_driver(stage: &'static str, err: DriverError) -> Self {
        match err {
            DriverError::ElementNotFound { .. } | DriverError::NavigationTimeout { .. } => {
                Self::VendorUnavailable {
                    stage,
                    detail: err.to_string(),
                }
            }
            DriverError::Script(_) | DriverError::Backend(_) => Self::UnknownError {
                stage,
                detail: err.to_string(),
            },
        }
    }

    /// Maps an expired bounded wait raised inside `stage`.
    pub fn from_wait(stage: &'static str, err: WaitError) -> Self {
        match err {
            WaitError::Elapsed { label, after } => Self::VendorUnavailable {
                stage,
                detail: format!("timed out after {}s waiting for {label}", after.as_secs()),
            },
            WaitError::Driver(inner) => Self::from_driver(stage, inner),
        }
    }

    pub fn stalled(page: usize, waited: Duration, detail: impl Into<String>) -> Self {
        Self::PaginationStalled {
            page,
            waited_secs: waited.as_secs(),
            detail: detail.into(),
        }
    }

    pub fn unknown(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::UnknownError {
            stage,
            detail: detail.into(),
        }
    }

    /// Outcome code recorded in the run ledger.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "LOGIN_FAILED",
            Self::VendorUnavailable { .. } => "VENDOR_DOWN",
            Self::PaginationStalled { .. } => "PAGINATION_STALLED",
            Self::PartialSync { .. } => "PARTIAL_SYNC",
            Self::UnknownError { .. } | Self::Other(_) => "UNKNOWN_ERROR",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
        }
    }

    /// Bad credentials must not be retried by the scheduler.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthenticationFailed(_))
    }
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, HarvestError>;
