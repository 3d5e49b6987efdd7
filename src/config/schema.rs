use anyhow::{Result, bail};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub(super) const APP_DIR: &str = ".bytel-harvester";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,
}

// ── Portal account ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Phone number or e-mail used on the portal login form
    #[serde(default)]
    pub login: Option<String>,
    /// Stored with an `ENC:` prefix when `[secrets].encrypt` is on
    #[serde(default)]
    pub password: Option<String>,
    /// Some login paths ask for the account holder's family name
    #[serde(default)]
    pub lastname: Option<String>,
}

// ── Browser ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// agent-browser executable, resolved through PATH
    #[serde(default = "default_browser_binary")]
    pub binary: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default)]
    pub headed: bool,
}

fn default_browser_binary() -> String {
    "agent-browser".into()
}

fn default_session_name() -> String {
    "bytel-harvester".into()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: default_browser_binary(),
            session_name: default_session_name(),
            headed: false,
        }
    }
}

// ── Sync policy ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// A previous run older than this forces a full pass (default: 30)
    #[serde(default = "default_freshness_days")]
    pub freshness_days: i64,
    /// Upper bound on load-more cycles in a full pass (default: 60)
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub force_full: bool,
}

fn default_freshness_days() -> i64 {
    crate::portal::sync_policy::FRESHNESS_DAYS
}

fn default_max_pages() -> usize {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_days: default_freshness_days(),
            max_pages: default_max_pages(),
            force_full: false,
        }
    }
}

// ── Timeouts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Bounded wait for a single element or login outcome
    #[serde(default = "default_element_secs")]
    pub element_secs: u64,
    /// Settle timeout for one pagination cycle
    #[serde(default = "default_page_secs")]
    pub page_secs: u64,
    /// Deadline for a run, not counting time spent waiting on the user
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_element_secs() -> u64 {
    15
}

fn default_page_secs() -> u64 {
    30
}

fn default_run_secs() -> u64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            element_secs: default_element_secs(),
            page_secs: default_page_secs(),
            run_secs: default_run_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TimeoutsConfig {
    pub fn element(&self) -> Duration {
        Duration::from_secs(self.element_secs)
    }

    pub fn page(&self) -> Duration {
        Duration::from_secs(self.page_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Observability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Secrets ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self { encrypt: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let app_dir = home.join(APP_DIR);

        Self {
            workspace_dir: app_dir.join("workspace"),
            config_path: app_dir.join("config.toml"),
            portal: PortalConfig::default(),
            browser: BrowserConfig::default(),
            sync: SyncConfig::default(),
            timeouts: TimeoutsConfig::default(),
            observability: ObservabilityConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.element_secs == 0 || t.page_secs == 0 || t.run_secs == 0 || t.poll_interval_ms == 0 {
            bail!("[timeouts] values must be greater than zero");
        }
        if t.run_secs < t.page_secs {
            bail!("[timeouts].run_secs must be at least page_secs");
        }
        if self.sync.freshness_days <= 0 {
            bail!("[sync].freshness_days must be greater than zero");
        }
        if self.sync.max_pages == 0 {
            bail!("[sync].max_pages must be greater than zero");
        }
        if self.browser.binary.trim().is_empty() {
            bail!("[browser].binary must not be empty");
        }
        Ok(())
    }

    /// Password and login from config, when both are present.
    pub fn configured_credentials(&self) -> Option<crate::portal::Credentials> {
        let login = self.portal.login.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let password = self.portal.password.as_deref().filter(|s| !s.is_empty())?;
        Some(crate::portal::Credentials::new(login, password))
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.observability
            .log_level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}
