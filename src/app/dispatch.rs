use anyhow::{Context, Result, bail};
use chrono::Utc;
use dialoguer::{Input, Password};
use std::sync::Arc;
use tracing::{info, warn};

use crate::Config;
use crate::app::status::{StatusSnapshot, render_status};
use crate::browser::{AgentBrowser, AgentBrowserPage, spawn_pump};
use crate::cli::commands::{Cli, Commands, CredentialsCommands};
use crate::error::HarvestError;
use crate::portal::pagination::PaginationLimits;
use crate::portal::wait::{HumanGate, WaitPolicy};
use crate::portal::{
    AuthStateMachine, Bridge, CredentialSource, Credentials, HarvestReport, HarvestSettings,
    Harvester, InterceptionBuffer, Persistence, PortalPage, SiteProfile,
};
use crate::store::FileStore;

fn file_store(config: &Config) -> FileStore {
    FileStore::new(&config.workspace_dir, config.secret_store())
        .with_configured_credentials(config.configured_credentials())
}

fn harvest_settings(config: &Config, force_full: bool) -> HarvestSettings {
    let t = &config.timeouts;
    HarvestSettings {
        wait: WaitPolicy::new(t.element(), t.poll_interval()),
        human: HumanGate::new(t.poll_interval()),
        pagination: PaginationLimits {
            per_page_timeout: t.page(),
            poll_interval: t.poll_interval(),
            max_pages: config.sync.max_pages,
        },
        run_timeout: t.run(),
        freshness_days: config.sync.freshness_days,
        force_full: config.sync.force_full || force_full,
        lastname: config.portal.lastname.clone(),
    }
}

async fn ensure_browser(browser: &AgentBrowser, binary: &str) -> Result<()> {
    if !browser.is_available().await {
        bail!("'{binary}' not found; install agent-browser or set [browser].binary");
    }
    Ok(())
}

/// Stores a family name learned during the run. The file is reloaded so
/// environment overrides of this process are not written back.
fn remember_lastname(config: &Config, lastname: &str) -> Result<()> {
    let Some(app_dir) = config.config_path.parent() else {
        return Ok(());
    };
    let mut on_disk = Config::load_or_init_in(app_dir)?;
    if on_disk.portal.lastname.is_some() {
        return Ok(());
    }
    on_disk.portal.lastname = Some(lastname.to_string());
    on_disk.save()?;
    info!("account family name saved to config");
    Ok(())
}

fn print_report(report: &HarvestReport) {
    println!("✓ {} sync ({})", report.decision.mode, report.decision.reason);
    println!(
        "  pages: {}  payloads: {}  history complete: {}",
        report.pagination.pages,
        report.pagination.payloads,
        if report.pagination.exhausted { "yes" } else { "no" }
    );
    println!(
        "  bills: {} found, {} new, {} already stored",
        report.bills_found, report.saved, report.already_known
    );
    let quality = &report.quality;
    if quality.fallback_used > 0 || quality.length_mismatch() {
        println!(
            "  line numbers: {} read from the page, {} disagreements ({} rows for {} bills)",
            quality.fallback_used,
            quality.position_disagreements,
            quality.dom_line_numbers,
            quality.sorted_bills
        );
    }
    if report.identity_refreshed {
        println!("  identity refreshed");
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

/// One harvest run against the portal.
///
/// 1. Builds the page driver and starts the hook pump and bridge.
/// 2. Runs the harvester, cancelled on Ctrl-C.
/// 3. Records the outcome in the run ledger, whatever it was.
async fn run_harvest(mut config: Config, full: bool, headed: bool) -> Result<()> {
    if headed {
        config.browser.headed = true;
    }
    let profile = SiteProfile::bouygues();
    let store = file_store(&config);
    let ledger = store.ledger();
    let context = ledger.load().await?.sync_context();

    let browser = AgentBrowser::new(&config.browser).with_command_timeout(config.timeouts.page());
    ensure_browser(&browser, &config.browser.binary).await?;
    info!(session = browser.session(), "using agent-browser session");

    let buffer = Arc::new(InterceptionBuffer::new(profile.signatures.clone()));
    let (bridge, sender, captured) = Bridge::new(Arc::clone(&buffer));
    let bridge_task = bridge.pump();
    let hook_task = spawn_pump(browser.clone(), sender, config.timeouts.poll_interval());

    let page = AgentBrowserPage::new(browser, &profile.selectors, config.timeouts.page());
    let harvester = Harvester::new(
        &page,
        &profile,
        buffer,
        captured,
        &store,
        &store,
        harvest_settings(&config, full),
    );

    let started = Utc::now();
    let outcome = tokio::select! {
        result = harvester.run(context) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            Err(HarvestError::unknown("run", "interrupted by user"))
        }
    };
    hook_task.abort();
    bridge_task.abort();

    ledger
        .record(started, &outcome)
        .await
        .context("Failed to update run ledger")?;

    match outcome {
        Ok(report) => {
            if let Some(lastname) = report.discovered_lastname.as_deref()
                && let Err(err) = remember_lastname(&config, lastname)
            {
                warn!(error = %err, "could not save family name");
            }
            print_report(&report);
            Ok(())
        }
        Err(err) => {
            if err.is_retryable() {
                eprintln!("  the next run will retry with a full sync");
            } else {
                eprintln!("  check the stored credentials before the next run");
            }
            Err(anyhow::Error::new(err).context("harvest failed"))
        }
    }
}

async fn logout(config: &Config) -> Result<()> {
    let profile = SiteProfile::bouygues();
    let browser = AgentBrowser::new(&config.browser).with_command_timeout(config.timeouts.page());
    ensure_browser(&browser, &config.browser.binary).await?;

    let page = AgentBrowserPage::new(browser, &profile.selectors, config.timeouts.page());
    page.goto(&profile.urls.home).await?;
    let settings = harvest_settings(config, false);
    AuthStateMachine::new(&page, &profile, settings.wait, settings.human)
        .ensure_not_authenticated()
        .await?;
    println!("✓ Logged out of the portal");
    Ok(())
}

async fn set_credentials(config: &Config, login: Option<String>) -> Result<()> {
    let login = match login {
        Some(login) => login,
        None => Input::<String>::new()
            .with_prompt("Login (phone number or e-mail)")
            .interact_text()?,
    };
    let login = login.trim().to_string();
    if login.is_empty() {
        bail!("login must not be empty");
    }
    let password = Password::new().with_prompt("Password").interact()?;
    if password.is_empty() {
        bail!("password must not be empty");
    }

    let store = file_store(config);
    store
        .persist_credentials(&Credentials::new(login, password))
        .await?;
    if config.configured_credentials().is_some() {
        println!("! Credentials saved, but [portal] in config.toml still takes precedence");
    } else {
        println!("✓ Credentials saved");
    }
    Ok(())
}

async fn clear_credentials(config: &Config) -> Result<()> {
    if file_store(config).clear_credentials().await? {
        println!("✓ Stored credentials removed");
    } else {
        println!("No stored credentials");
    }
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let store = file_store(config);
    let credentials_source = if config.configured_credentials().is_some() {
        "config"
    } else if store.stored_credentials().await?.is_some() {
        "stored"
    } else {
        "none (prompted in the browser)"
    };
    let snapshot = StatusSnapshot {
        ledger: store.ledger().load().await?,
        bills: store.bills().await?.len(),
        identity_known: store.identity().await?.is_some(),
        credentials_source,
        now: Utc::now(),
    };
    println!("{}", render_status(config, &snapshot));
    Ok(())
}

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run { full, headed } => run_harvest(config, full, headed).await,
        Commands::Status => status(&config).await,
        Commands::Logout => logout(&config).await,
        Commands::Credentials {
            credentials_command,
        } => match credentials_command {
            CredentialsCommands::Set { login } => set_credentials(&config, login).await,
            CredentialsCommands::Clear => clear_credentials(&config).await,
        },
    }
}
