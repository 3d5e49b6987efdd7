//! Run orchestrator: sync decision, authentication, pagination,
//! reconciliation, persistence, in that order and never concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::auth::AuthStateMachine;
use super::bridge::CapturedCredentials;
use super::intercept::{InterceptionBuffer, PayloadKind};
use super::model::{BILL_DEDUP_KEY, CanonicalBill, CanonicalIdentity, Credentials};
use super::page::PortalPage;
use super::pagination::{PaginationDriver, PaginationLimits, PaginationReport};
use super::profile::SiteProfile;
use super::reconcile::{self, DataQuality, IdentityFragments, Reconciler};
use super::sync_policy::{self, SyncContext, SyncDecision};
use super::wait::{HumanGate, WaitPolicy};
use crate::error::{HarvestError, Result};

/// Payload kinds whose arrival marks a settled bills page.
pub const BILL_KINDS: &[PayloadKind] = &[PayloadKind::BillingData];

// ── Collaborators ───────────────────────────────────────────────────────────

/// Outcome of handing bills to the persistence collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub saved: usize,
    pub already_known: usize,
}

/// Durable storage for harvested records. Called once per run; retries are
/// the implementation's business.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Stores `records`, skipping any whose `dedup_key` value is already known.
    async fn persist_bills(
        &self,
        records: &[CanonicalBill],
        dedup_key: &str,
    ) -> anyhow::Result<PersistSummary>;

    async fn persist_identity(&self, identity: &CanonicalIdentity) -> anyhow::Result<()>;

    async fn persist_credentials(&self, credentials: &Credentials) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn stored_credentials(&self) -> anyhow::Result<Option<Credentials>>;
}

// ── Settings & report ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub wait: WaitPolicy,
    pub human: HumanGate,
    pub pagination: PaginationLimits,
    /// Deadline for the whole run, minus time suspended on `human`.
    pub run_timeout: Duration,
    pub freshness_days: i64,
    pub force_full: bool,
    pub lastname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub decision: SyncDecision,
    pub reused_session: bool,
    pub pagination: PaginationReport,
    pub bills_found: usize,
    pub saved: usize,
    pub already_known: usize,
    pub skipped_docs: usize,
    pub quality: DataQuality,
    pub identity_refreshed: bool,
    /// Family name read from the contact payload while none was configured.
    pub discovered_lastname: Option<String>,
}

fn persistence(err: &anyhow::Error) -> HarvestError {
    HarvestError::PersistenceFailed(format!("{err:#}"))
}

// ── Orchestrator ────────────────────────────────────────────────────────────

pub struct Harvester<'a> {
    page: &'a dyn PortalPage,
    profile: &'a SiteProfile,
    buffer: Arc<InterceptionBuffer>,
    captured: CapturedCredentials,
    store: &'a dyn Persistence,
    credentials: &'a dyn CredentialSource,
    settings: HarvestSettings,
}

impl<'a> Harvester<'a> {
    pub fn new(
        page: &'a dyn PortalPage,
        profile: &'a SiteProfile,
        buffer: Arc<InterceptionBuffer>,
        captured: CapturedCredentials,
        store: &'a dyn Persistence,
        credentials: &'a dyn CredentialSource,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            page,
            profile,
            buffer,
            captured,
            store,
            credentials,
            settings,
        }
    }

    pub fn decide(&self, ctx: SyncContext, now: DateTime<Utc>) -> SyncDecision {
        if self.settings.force_full {
            return SyncDecision::forced();
        }
        sync_policy::select(ctx, now, self.settings.freshness_days)
    }

    /// Executes one harvest run.
    ///
    /// Everything after the sync decision runs under `run_timeout`, except
    /// time spent waiting on a human. When pagination stalls or the deadline
    /// passes, whatever was intercepted so far is still reconciled and
    /// persisted before the failure is reported.
    pub async fn run(&self, ctx: SyncContext) -> Result<HarvestReport> {
        let started = Utc::now();
        let decision = self.decide(ctx, started);
        info!(mode = %decision.mode, reason = %decision.reason, "sync mode selected");

        let budget = self.settings.run_timeout;
        match self
            .settings
            .human
            .within_budget(budget, self.pipeline(ctx, decision, started))
            .await
        {
            Some(outcome) => outcome,
            None => {
                error!(budget_secs = budget.as_secs(), "run deadline reached");
                self.salvage(started).await;
                Err(HarvestError::VendorUnavailable {
                    stage: "run",
                    detail: format!("run deadline of {}s reached", budget.as_secs()),
                })
            }
        }
    }

    async fn pipeline(
        &self,
        ctx: SyncContext,
        decision: SyncDecision,
        started: DateTime<Utc>,
    ) -> Result<HarvestReport> {
        let stored = self
            .credentials
            .stored_credentials()
            .await
            .map_err(|e| persistence(&e))?;
        let has_stored_account = ctx.last_execution.is_some() || stored.is_some();

        let mut auth = AuthStateMachine::new(
            self.page,
            self.profile,
            self.settings.wait,
            self.settings.human.clone(),
        )
        .with_captured_credentials(self.captured.clone())
        .with_lastname(self.settings.lastname.clone());
        let outcome = auth.ensure_authenticated(has_stored_account, stored.as_ref()).await?;

        if let Some(captured) = outcome.captured.as_ref() {
            info!(login = %captured.login, "storing credentials entered in the portal");
            self.store
                .persist_credentials(captured)
                .await
                .map_err(|e| persistence(&e))?;
        }
        let login = outcome
            .captured
            .as_ref()
            .or(stored.as_ref())
            .map(|c| c.login.clone());

        let selectors = &self.profile.selectors;
        let driver = PaginationDriver::new(
            self.page,
            &self.buffer,
            BILL_KINDS,
            &selectors.load_more,
            &selectors.bill_rows,
            self.settings.pagination,
        )
        .with_empty_page(reconcile::billing_is_empty);
        let pagination = match driver.run(&self.profile.urls.bills, decision.mode).await {
            Ok(report) => report,
            Err(HarvestError::PaginationStalled {
                page,
                waited_secs,
                detail,
            }) => {
                error!(page, waited_secs, %detail, "pagination stalled, persisting what was intercepted");
                let skipped_docs = self.salvage(started).await;
                let detail = if skipped_docs > 0 {
                    format!("{detail}; {skipped_docs} intercepted bill(s) left uncategorized")
                } else {
                    detail
                };
                return Err(HarvestError::PaginationStalled {
                    page,
                    waited_secs,
                    detail,
                });
            }
            Err(other) => return Err(other),
        };

        let (reconciliation, persisted) = self.reconcile_and_persist(started).await?;

        let mut identity_refreshed = false;
        let mut discovered_lastname = None;
        if decision.refresh_identity() {
            let identity = self.refresh_identity(login).await?;
            identity_refreshed = !identity.is_empty();
            if self.settings.lastname.is_none() {
                discovered_lastname = identity.name.as_ref().and_then(|n| n.family.clone());
            }
        }

        let skipped_docs = reconciliation.skipped_docs();
        let report = HarvestReport {
            decision,
            reused_session: outcome.reused_session,
            pagination,
            bills_found: reconciliation.bills.len(),
            saved: persisted.saved,
            already_known: persisted.already_known,
            skipped_docs,
            quality: reconciliation.quality,
            identity_refreshed,
            discovered_lastname,
        };

        if skipped_docs > 0 {
            warn!(skipped_docs, saved = persisted.saved, "some bills could not be categorized");
            return Err(HarvestError::PartialSync {
                skipped_docs,
                saved: persisted.saved,
            });
        }
        info!(
            bills = report.bills_found,
            saved = report.saved,
            already_known = report.already_known,
            "harvest finished"
        );
        Ok(report)
    }

    /// Best-effort persistence after a failed run, bounded by the element
    /// timeout. Returns how many intercepted bills could not be categorized.
    async fn salvage(&self, started: DateTime<Utc>) -> usize {
        if self.buffer.latest(PayloadKind::BillingData).is_none()
            && self.buffer.latest(PayloadKind::OtherDocuments).is_none()
        {
            debug!("nothing intercepted, nothing to salvage");
            return 0;
        }
        match tokio::time::timeout(self.settings.wait.timeout, self.reconcile_and_persist(started)).await {
            Ok(Ok((reconciliation, persisted))) => {
                let skipped_docs = reconciliation.skipped_docs();
                if skipped_docs > 0 {
                    warn!(skipped_docs, saved = persisted.saved, "salvaged run left bills uncategorized");
                }
                info!(
                    bills = reconciliation.bills.len(),
                    saved = persisted.saved,
                    skipped_docs,
                    "salvaged intercepted bills"
                );
                skipped_docs
            }
            Ok(Err(err)) => {
                warn!(error = %err, "best-effort persistence failed");
                0
            }
            Err(_) => {
                warn!("best-effort persistence timed out");
                0
            }
        }
    }

    async fn reconcile_and_persist(
        &self,
        imported_at: DateTime<Utc>,
    ) -> Result<(reconcile::Reconciliation, PersistSummary)> {
        let billing = self.buffer.latest(PayloadKind::BillingData);
        let other = self.buffer.latest(PayloadKind::OtherDocuments);

        let dom_line_numbers = match billing {
            Some(_) => self
                .page
                .inner_texts(&self.profile.selectors.line_numbers)
                .await
                .map_err(|e| HarvestError::from_driver("reconcile", e))?,
            None => Vec::new(),
        };
        if let Some(payload) = billing.as_ref() {
            debug!(sequence = payload.sequence, index = payload.index, "reconciling latest billing payload");
        }

        let reconciliation = Reconciler::new(self.profile, imported_at).reconcile(
            billing.as_ref().map(|p| &p.body),
            other.as_ref().map(|p| &p.body),
            &dom_line_numbers,
        )?;

        if reconciliation.bills.is_empty() {
            info!("no bills on the account");
            return Ok((reconciliation, PersistSummary::default()));
        }
        let persisted = self
            .store
            .persist_bills(&reconciliation.bills, BILL_DEDUP_KEY)
            .await
            .map_err(|e| persistence(&e))?;
        Ok((reconciliation, persisted))
    }

    /// Identity is opportunistic: a missing contact payload only means fewer
    /// fields, never a failed run.
    async fn refresh_identity(&self, login: Option<String>) -> Result<CanonicalIdentity> {
        const CONTACT: &[PayloadKind] = &[PayloadKind::ContactData];

        if self.buffer.latest(PayloadKind::ContactData).is_none() {
            let before = self.buffer.count(CONTACT);
            self.page
                .goto(&self.profile.urls.identity)
                .await
                .map_err(|e| HarvestError::from_driver("identity", e))?;
            let arrived = tokio::time::timeout(
                self.settings.wait.timeout,
                self.buffer.grown_to(CONTACT, before + 1),
            )
            .await;
            if arrived.is_err() {
                warn!("no contact payload intercepted, identity limited to session fragments");
            }
        }

        let contact = self.buffer.latest(PayloadKind::ContactData);
        let identity = reconcile::reconcile_identity(
            contact.as_ref().map(|p| &p.body),
            &IdentityFragments {
                login,
                lastname: self.settings.lastname.clone(),
            },
        );
        if identity.is_empty() {
            debug!("identity empty, nothing to persist");
            return Ok(identity);
        }
        self.store
            .persist_identity(&identity)
            .await
            .map_err(|e| persistence(&e))?;
        Ok(identity)
    }
}
