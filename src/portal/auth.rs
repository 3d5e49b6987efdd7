//! Authentication state machine.
//!
//! Browser storage and DOM markers are the only sources of truth; every
//! transition re-reads them instead of trusting the machine's previous belief,
//! because the portal can expire or redirect a session at any time.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use strum::Display;
use tracing::{debug, info, warn};
use url::Url;

use super::bridge::CapturedCredentials;
use super::model::Credentials;
use super::page::{DriverError, PortalPage};
use super::profile::SiteProfile;
use super::wait::{self, HumanGate, WaitPolicy};
use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Challenge {
    None,
    Credentials,
    OneTimeCode,
    IframeRedirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unknown,
    CheckingAuth,
    Authenticated,
    NeedsChallenge(Challenge),
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::CheckingAuth => f.write_str("CheckingAuth"),
            Self::Authenticated => f.write_str("Authenticated"),
            Self::NeedsChallenge(challenge) => write!(f, "NeedsChallenge({challenge})"),
            Self::Failed => f.write_str("Failed"),
        }
    }
}

/// Authentication status as last derived from the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub token_expiry: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub pending_challenge: Challenge,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            authenticated: false,
            token_expiry: None,
            user_id: None,
            pending_challenge: Challenge::None,
        }
    }
}

/// Result of a successful `ensure_authenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// An existing portal session was reused without logging in.
    pub reused_session: bool,
    /// Credentials a human typed into the portal, to be persisted.
    pub captured: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoginResult {
    LoggedIn,
    BadCredentials,
    VendorDown(String),
    OneTimeCode,
}

fn at(stage: &'static str) -> impl FnOnce(DriverError) -> HarvestError {
    move |err| HarvestError::from_driver(stage, err)
}

/// Parses a token expiry stored as epoch milliseconds or RFC 3339.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct AuthStateMachine<'a> {
    page: &'a dyn PortalPage,
    profile: &'a SiteProfile,
    policy: WaitPolicy,
    human: HumanGate,
    captured: Option<CapturedCredentials>,
    lastname: Option<String>,
    state: AuthState,
    session: Session,
}

impl<'a> AuthStateMachine<'a> {
    pub fn new(
        page: &'a dyn PortalPage,
        profile: &'a SiteProfile,
        policy: WaitPolicy,
        human: HumanGate,
    ) -> Self {
        Self {
            page,
            profile,
            policy,
            human,
            captured: None,
            lastname: None,
            state: AuthState::Unknown,
            session: Session::default(),
        }
    }

    /// Slot filled by the bridge when a human submits the portal's form.
    pub fn with_captured_credentials(mut self, captured: CapturedCredentials) -> Self {
        self.captured = Some(captured);
        self
    }

    pub fn with_lastname(mut self, lastname: Option<String>) -> Self {
        self.lastname = lastname;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn transition(&mut self, next: AuthState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "auth transition");
            self.state = next;
        }
    }

    fn fail(&mut self, err: HarvestError) -> HarvestError {
        self.transition(AuthState::Failed);
        err
    }

    // ── Predicates ──────────────────────────────────────────────────────

    /// Whether the current page holds a live session.
    ///
    /// A pending one-time-code challenge is resolved first, blocking for as
    /// long as the user needs, so a half-finished login is never reported as
    /// logged out.
    pub async fn check_authenticated(&mut self) -> Result<bool> {
        self.transition(AuthState::CheckingAuth);

        let otp_pending = self
            .page
            .is_element_present(&self.profile.selectors.otp_input)
            .await
            .map_err(at("check_auth"))?;
        if otp_pending {
            self.resolve_one_time_code().await?;
            self.transition(AuthState::CheckingAuth);
        }

        let profile = self.profile;
        let storage = &profile.storage;
        let expiry_raw = self
            .page
            .storage_item(&storage.token_expiry)
            .await
            .map_err(at("check_auth"))?;
        let expiry = expiry_raw.as_deref().and_then(|raw| {
            let parsed = parse_expiry(raw);
            if parsed.is_none() {
                warn!(key = %storage.token_expiry, "unparseable token expiry, falling back to DOM markers");
            }
            parsed
        });
        self.session.token_expiry = expiry;
        self.session.user_id = self
            .page
            .storage_item(&storage.user_id)
            .await
            .map_err(at("check_auth"))?;

        let authenticated = match expiry {
            Some(expiry) => expiry > Utc::now(),
            None if self.session.user_id.is_some() => {
                debug!("no token expiry stored, trusting the stored user id");
                true
            }
            None => self.dom_reports_session().await.map_err(at("check_auth"))?,
        };

        self.session.authenticated = authenticated;
        self.transition(if authenticated {
            AuthState::Authenticated
        } else {
            AuthState::NeedsChallenge(Challenge::Credentials)
        });
        debug!(authenticated, expiry = ?self.session.token_expiry, "session checked");
        Ok(authenticated)
    }

    async fn dom_reports_session(&self) -> std::result::Result<bool, DriverError> {
        let url = self.page.current_url().await?;
        if url.contains(&self.profile.urls.logged_in_pattern) {
            return Ok(true);
        }
        self.page
            .is_element_present(&self.profile.selectors.disconnect)
            .await
    }

    // ── Challenges ──────────────────────────────────────────────────────

    /// Waits, without any timeout, for the user to enter the one-time code,
    /// then completes the single confirming click.
    pub async fn resolve_one_time_code(&mut self) -> Result<()> {
        self.session.pending_challenge = Challenge::OneTimeCode;
        self.transition(AuthState::NeedsChallenge(Challenge::OneTimeCode));
        info!("one-time code requested by the portal");

        let page = self.page;
        let confirmed = self.profile.selectors.otp_confirmed.as_str();
        self.human
            .suspend_until("one-time code entry", move || async move {
                Ok(page.is_element_present(confirmed).await?.then_some(()))
            })
            .await
            .map_err(at("one_time_code"))?;

        self.page
            .click(&self.profile.selectors.otp_confirm_button)
            .await
            .map_err(at("one_time_code"))?;
        self.session.pending_challenge = Challenge::None;
        Ok(())
    }

    async fn open_login_surface(&mut self) -> Result<()> {
        let profile = self.profile;
        let selectors = &profile.selectors;
        let iframe = self
            .page
            .is_element_present(&selectors.login_iframe)
            .await
            .map_err(at("login_surface"))?;

        if iframe {
            let src = self
                .page
                .attribute(&selectors.login_iframe, "src")
                .await
                .map_err(at("login_surface"))?
                .ok_or_else(|| HarvestError::VendorUnavailable {
                    stage: "login_surface",
                    detail: format!("login iframe {} has no src", selectors.login_iframe),
                })?;
            let base = self.page.current_url().await.map_err(at("login_surface"))?;
            let target = resolve_link(&base, &src)
                .ok_or_else(|| HarvestError::unknown("login_surface", format!("bad iframe src {src}")))?;
            self.session.pending_challenge = Challenge::IframeRedirect;
            self.transition(AuthState::NeedsChallenge(Challenge::IframeRedirect));
            info!(%target, "following login iframe");
            self.page.goto(&target).await.map_err(at("login_surface"))?;
        } else {
            let form = self
                .page
                .is_element_present(&selectors.username)
                .await
                .map_err(at("login_surface"))?;
            if !form {
                self.page
                    .goto(&self.profile.urls.login)
                    .await
                    .map_err(at("login_surface"))?;
            }
        }

        wait::wait_for_element(self.page, &selectors.username, self.policy)
            .await
            .map_err(|e| HarvestError::from_wait("login_surface", e))?;
        self.session.pending_challenge = Challenge::Credentials;
        self.transition(AuthState::NeedsChallenge(Challenge::Credentials));
        Ok(())
    }

    async fn submit_credentials(&mut self, credentials: &Credentials) -> Result<()> {
        let profile = self.profile;
        let selectors = &profile.selectors;
        info!(login = %credentials.login, "submitting stored credentials");
        self.page
            .fill(&selectors.username, &credentials.login)
            .await
            .map_err(at("submit_credentials"))?;
        self.page
            .fill(&selectors.password, &credentials.password)
            .await
            .map_err(at("submit_credentials"))?;

        if let Some(lastname) = self.lastname.as_deref() {
            let has_field = self
                .page
                .is_element_present(&selectors.lastname)
                .await
                .map_err(at("submit_credentials"))?;
            if has_field {
                self.page
                    .fill(&selectors.lastname, lastname)
                    .await
                    .map_err(at("submit_credentials"))?;
            }
        } else {
            debug!("lastname not set, some login paths may reject the attempt");
        }

        self.page
            .click(&selectors.submit)
            .await
            .map_err(at("submit_credentials"))
    }

    /// Blocks until a human either submits the form (captured over the bridge)
    /// or completes the login some other way.
    async fn await_human_credentials(&mut self) -> Result<Option<Credentials>> {
        info!("no stored credentials, waiting for manual login");
        let page = self.page;
        let profile = self.profile;
        let captured = self.captured.clone();
        self.human
            .suspend_until("manual credential entry", move || {
                let captured = captured.clone();
                async move {
                    if let Some(credentials) = captured.as_ref().and_then(CapturedCredentials::current) {
                        return Ok(Some(Some(credentials)));
                    }
                    let url = page.current_url().await?;
                    let done = url.contains(&profile.urls.logged_in_pattern)
                        || page.is_element_present(&profile.selectors.disconnect).await?;
                    Ok(done.then_some(None))
                }
            })
            .await
            .map_err(at("manual_login"))
    }

    async fn await_login_result(&self) -> Result<LoginResult> {
        let page = self.page;
        let profile = self.profile;
        wait::bounded("login outcome", self.policy, move || async move {
            let selectors = &profile.selectors;
            if page.is_element_present(&selectors.bad_credentials).await? {
                return Ok(Some(LoginResult::BadCredentials));
            }
            if page.is_element_present(&selectors.vendor_down).await? {
                let text = page.inner_texts(&selectors.vendor_down).await?.join(" ");
                return Ok(Some(LoginResult::VendorDown(text)));
            }
            if page.is_element_present(&selectors.otp_input).await? {
                return Ok(Some(LoginResult::OneTimeCode));
            }
            let body = page.inner_texts("body").await?;
            if body.iter().any(|t| t.contains(&profile.bad_credentials_text)) {
                return Ok(Some(LoginResult::BadCredentials));
            }
            let url = page.current_url().await?;
            if url.contains(&profile.urls.logged_in_pattern)
                || page.is_element_present(&selectors.disconnect).await?
                || page.storage_item(&profile.storage.user_id).await?.is_some()
            {
                return Ok(Some(LoginResult::LoggedIn));
            }
            Ok(None)
        })
        .await
        .map_err(|e| HarvestError::from_wait("login_outcome", e))
    }

    async fn confirm_disconnect_control(&mut self) -> Result<()> {
        let waited = wait::wait_for_element(self.page, &self.profile.selectors.disconnect, self.policy).await;
        match waited {
            Ok(()) => Ok(()),
            Err(wait::WaitError::Elapsed { .. }) => Err(self.fail(HarvestError::VendorUnavailable {
                stage: "confirm_session",
                detail: format!(
                    "portal reports a session but {} never appeared",
                    self.profile.selectors.disconnect
                ),
            })),
            Err(other) => Err(self.fail(HarvestError::from_wait("confirm_session", other))),
        }
    }

    // ── Public transitions ──────────────────────────────────────────────

    /// Drives the page to an authenticated session.
    ///
    /// Without a previously known account any lingering browser session is
    /// logged out first, so a stranger's session is never reused.
    pub async fn ensure_authenticated(
        &mut self,
        has_stored_account: bool,
        stored: Option<&Credentials>,
    ) -> Result<AuthOutcome> {
        self.page
            .goto(&self.profile.urls.home)
            .await
            .map_err(at("navigate"))?;

        if !has_stored_account {
            info!("no known account, clearing any existing portal session");
            self.ensure_not_authenticated().await?;
            self.page
                .goto(&self.profile.urls.home)
                .await
                .map_err(at("navigate"))?;
        }

        if self.check_authenticated().await? {
            info!("reusing existing portal session");
            self.confirm_disconnect_control().await?;
            return Ok(AuthOutcome {
                reused_session: true,
                captured: None,
            });
        }

        self.open_login_surface().await?;

        let captured = match stored {
            Some(credentials) => {
                self.submit_credentials(credentials).await?;
                None
            }
            None => self.await_human_credentials().await?,
        };

        match self.await_login_result().await {
            Ok(LoginResult::LoggedIn) => {}
            Ok(LoginResult::OneTimeCode) => self.resolve_one_time_code().await?,
            Ok(LoginResult::BadCredentials) => {
                warn!("portal rejected the credentials");
                return Err(self.fail(HarvestError::AuthenticationFailed(
                    "portal reported invalid login or password".into(),
                )));
            }
            Ok(LoginResult::VendorDown(text)) => {
                return Err(self.fail(HarvestError::VendorUnavailable {
                    stage: "login_outcome",
                    detail: if text.is_empty() { "portal unavailable".into() } else { text },
                }));
            }
            Err(err) => return Err(self.fail(err)),
        }

        if !self.check_authenticated().await? {
            return Err(self.fail(HarvestError::VendorUnavailable {
                stage: "verify_session",
                detail: "login accepted but no session could be observed".into(),
            }));
        }
        self.confirm_disconnect_control().await?;
        info!("authenticated");

        Ok(AuthOutcome {
            reused_session: false,
            captured,
        })
    }

    /// Logs out if needed and confirms it through storage, not the click.
    pub async fn ensure_not_authenticated(&mut self) -> Result<()> {
        if !self.check_authenticated().await? {
            debug!("already logged out");
            return Ok(());
        }

        let profile = self.profile;
        let selectors = &profile.selectors;
        info!("logging out of the portal");
        self.page
            .click(&selectors.disconnect)
            .await
            .map_err(at("logout"))?;
        let confirm = self
            .page
            .is_element_present(&selectors.logout_confirm)
            .await
            .map_err(at("logout"))?;
        if confirm {
            self.page
                .click(&selectors.logout_confirm)
                .await
                .map_err(at("logout"))?;
        }

        let page = self.page;
        let key = self.profile.storage.user_id.as_str();
        wait::bounded("session storage cleared", self.policy, move || async move {
            Ok(page.storage_item(key).await?.is_none().then_some(()))
        })
        .await
        .map_err(|e| HarvestError::from_wait("logout", e))?;

        self.session = Session::default();
        self.transition(AuthState::Unknown);
        info!("logout confirmed");
        Ok(())
    }
}

/// Resolves a possibly relative link against `base`.
pub fn resolve_link(base: &str, link: &str) -> Option<String> {
    if let Ok(absolute) = Url::parse(link) {
        return Some(absolute.to_string());
    }
    Url::parse(base)
        .ok()?
        .join(link)
        .ok()
        .map(|u| u.to_string())
}
