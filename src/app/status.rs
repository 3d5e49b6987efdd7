use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::portal::sync_policy;
use crate::store::LedgerEntry;

/// Stored state gathered for `bytel-harvester status`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub ledger: LedgerEntry,
    pub bills: usize,
    pub identity_known: bool,
    pub credentials_source: &'static str,
    pub now: DateTime<Utc>,
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "never".into(), |t| t.format("%Y-%m-%d %H:%M UTC").to_string())
}

pub fn render_status(config: &Config, snapshot: &StatusSnapshot) -> String {
    let ledger = &snapshot.ledger;
    let next = if config.sync.force_full {
        sync_policy::SyncDecision::forced()
    } else {
        sync_policy::select(ledger.sync_context(), snapshot.now, config.sync.freshness_days)
    };

    let lines = [
        "◆ bytel-harvester status".to_string(),
        String::new(),
        format!("Version:     {}", env!("CARGO_PKG_VERSION")),
        format!("Workspace:   {}", config.workspace_dir.display()),
        format!("Config:      {}", config.config_path.display()),
        String::new(),
        format!("  Browser:      {} (session {})", config.browser.binary, config.browser.session_name),
        format!("  Credentials:  {}", snapshot.credentials_source),
        format!(
            "  Family name:  {}",
            config.portal.lastname.as_deref().unwrap_or("(not set)")
        ),
        String::new(),
        format!("  Last run:     {}", timestamp(ledger.last_execution)),
        format!("  Last success: {}", timestamp(ledger.last_success)),
        format!(
            "  Outcome:      {}",
            ledger.last_outcome.as_deref().unwrap_or("-")
        ),
        format!("  Runs:         {}", ledger.runs),
        format!("  Next sync:    {} ({})", next.mode, next.reason),
        String::new(),
        format!("  Bills stored: {}", snapshot.bills),
        format!(
            "  Identity:     {}",
            if snapshot.identity_known { "stored" } else { "not yet" }
        ),
    ];
    lines.join("\n")
}
