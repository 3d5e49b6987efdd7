//! Pagination driver.
//!
//! A page cycle is one trigger followed by a settle. The first cycle opens the
//! bills page; later cycles click the load-more control. A cycle settles only
//! when the interception buffer has grown *and* more rows are visible: the DOM
//! update and the data fetch are loosely coupled and either can land first.
//! An account with no history never renders a row, so the opening cycle also
//! settles on a fresh payload the profile recognizes as empty.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::intercept::{InterceptionBuffer, PayloadKind};
use super::page::{DriverResult, PortalPage};
use super::sync_policy::SyncMode;
use crate::error::{HarvestError, Result};

const STAGE: &str = "pagination";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger<'t> {
    Open(&'t str),
    Click(&'t str),
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationLimits {
    pub per_page_timeout: Duration,
    pub poll_interval: Duration,
    pub max_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationReport {
    pub pages: usize,
    pub payloads: usize,
    /// The load-more control disappeared, so history is complete.
    pub exhausted: bool,
}

pub struct PaginationDriver<'a> {
    page: &'a dyn PortalPage,
    buffer: &'a InterceptionBuffer,
    kinds: &'a [PayloadKind],
    load_more: &'a str,
    rows: &'a str,
    limits: PaginationLimits,
    empty_page: Option<fn(&Value) -> bool>,
}

impl<'a> PaginationDriver<'a> {
    pub fn new(
        page: &'a dyn PortalPage,
        buffer: &'a InterceptionBuffer,
        kinds: &'a [PayloadKind],
        load_more: &'a str,
        rows: &'a str,
        limits: PaginationLimits,
    ) -> Self {
        Self {
            page,
            buffer,
            kinds,
            load_more,
            rows,
            limits,
            empty_page: None,
        }
    }

    /// Recognizes a payload that lists nothing, letting the opening cycle
    /// settle without any visible row.
    pub fn with_empty_page(mut self, is_empty: fn(&Value) -> bool) -> Self {
        self.empty_page = Some(is_empty);
        self
    }

    /// Opens `bills_url` and pages through history according to `mode`.
    pub async fn run(&self, bills_url: &str, mode: SyncMode) -> Result<PaginationReport> {
        let mut pages = 0;
        let mut trigger = Trigger::Open(bills_url);
        let mut exhausted = false;

        loop {
            if pages >= self.limits.max_pages {
                return Err(HarvestError::stalled(
                    pages + 1,
                    Duration::ZERO,
                    format!("load-more still present after {pages} pages"),
                ));
            }

            self.cycle(pages + 1, trigger).await?;
            pages += 1;

            if mode == SyncMode::Incremental {
                debug!("incremental sync, stopping after the first page");
                break;
            }

            let more = self
                .page
                .is_element_present(self.load_more)
                .await
                .map_err(|e| HarvestError::from_driver(STAGE, e))?;
            if !more {
                exhausted = true;
                break;
            }
            trigger = Trigger::Click(self.load_more);
        }

        let payloads = self.buffer.count(self.kinds);
        info!(pages, payloads, exhausted, %mode, "pagination finished");
        Ok(PaginationReport {
            pages,
            payloads,
            exhausted,
        })
    }

    async fn cycle(&self, page_no: usize, trigger: Trigger<'_>) -> Result<()> {
        let rows_before = match trigger {
            Trigger::Open(_) => 0,
            Trigger::Click(_) => self.visible_rows().await.map_err(|e| HarvestError::from_driver(STAGE, e))?,
        };
        let payloads_before = self.buffer.count(self.kinds);

        match trigger {
            Trigger::Open(url) => self.page.goto(url).await,
            Trigger::Click(selector) => self.page.click(selector).await,
        }
        .map_err(|e| HarvestError::from_driver(STAGE, e))?;

        let settle = async {
            let opening = matches!(trigger, Trigger::Open(_));
            let (_, rows) = tokio::join!(
                self.buffer.grown_to(self.kinds, payloads_before + 1),
                self.rows_grown_past(rows_before, opening.then_some(payloads_before)),
            );
            rows
        };

        match tokio::time::timeout(self.limits.per_page_timeout, settle).await {
            Ok(Ok(rows)) => {
                debug!(page = page_no, rows, payloads = self.buffer.count(self.kinds), "page settled");
                Ok(())
            }
            Ok(Err(err)) => Err(HarvestError::from_driver(STAGE, err)),
            Err(_) => {
                let buffer_grew = self.buffer.size_at_least(self.kinds, payloads_before + 1);
                let rows_now = self.visible_rows().await.unwrap_or(rows_before);
                Err(HarvestError::stalled(
                    page_no,
                    self.limits.per_page_timeout,
                    format!(
                        "buffer grew: {buffer_grew}, visible rows {rows_before} -> {rows_now} ({})",
                        self.rows
                    ),
                ))
            }
        }
    }

    async fn visible_rows(&self) -> DriverResult<usize> {
        self.page.count_elements(self.rows).await
    }

    /// Resolves once more than `before` rows are visible, or, when
    /// `empty_after` is set, once a payload newer than that count is empty.
    async fn rows_grown_past(&self, before: usize, empty_after: Option<usize>) -> DriverResult<usize> {
        loop {
            let now = self.visible_rows().await?;
            if now > before {
                return Ok(now);
            }
            if let Some(payloads_before) = empty_after
                && self.newest_is_empty(payloads_before)
            {
                debug!("empty payload intercepted, no rows expected");
                return Ok(now);
            }
            tokio::time::sleep(self.limits.poll_interval).await;
        }
    }

    fn newest_is_empty(&self, payloads_before: usize) -> bool {
        let Some(is_empty) = self.empty_page else {
            return false;
        };
        if !self.buffer.size_at_least(self.kinds, payloads_before + 1) {
            return false;
        }
        self.kinds
            .iter()
            .filter_map(|kind| self.buffer.latest(*kind))
            .max_by_key(|payload| payload.index)
            .is_some_and(|payload| is_empty(&payload.body))
    }
}
