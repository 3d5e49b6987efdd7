use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::cli::AgentBrowser;
use super::hook::{PRESENT_SCRIPT, hook_script, js_str};
use crate::portal::page::{DriverError, DriverResult, PortalPage};
use crate::portal::profile::Selectors;

/// [`PortalPage`] backed by an agent-browser session.
///
/// The network hook lives in page context and is lost on every full load.
/// Navigations that stay on the current origin are therefore performed
/// in-app (`history.pushState` plus a `popstate` event) once the hook is in
/// place, so the responses the target route fetches are observed.
pub struct AgentBrowserPage {
    browser: AgentBrowser,
    hook: String,
    navigation_timeout: Duration,
}

fn expect_bool(value: &Value) -> DriverResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| DriverError::Script(format!("expected boolean, got {value}")))
}

fn same_origin(current: &str, target: &str) -> bool {
    match (Url::parse(current), Url::parse(target)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

impl AgentBrowserPage {
    pub fn new(browser: AgentBrowser, selectors: &Selectors, navigation_timeout: Duration) -> Self {
        Self {
            browser,
            hook: hook_script(selectors),
            navigation_timeout,
        }
    }

    pub fn browser(&self) -> &AgentBrowser {
        &self.browser
    }

    async fn install_hook(&self) -> DriverResult<()> {
        let state = self.browser.eval(&self.hook).await?;
        debug!(state = %state, "network hook");
        Ok(())
    }

    async fn hook_present(&self) -> DriverResult<bool> {
        expect_bool(&self.browser.eval(PRESENT_SCRIPT).await?)
    }

    async fn hard_navigate(&self, url: &str) -> DriverResult<()> {
        let args = ["open", url];
        match tokio::time::timeout(self.navigation_timeout, self.browser.run_ok(&args)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DriverError::NavigationTimeout { url: url.to_string() }),
        }
    }

    async fn soft_navigate(&self, url: &str) -> DriverResult<()> {
        let script = format!(
            "(() => {{ history.pushState({{}}, '', {target}); \
             window.dispatchEvent(new PopStateEvent('popstate', {{ state: {{}} }})); \
             return location.href; }})()",
            target = js_str(url)
        );
        self.browser.eval(&script).await.map(|_| ())
    }

    async fn query(&self, expression: &str, selector: &str) -> DriverResult<Value> {
        let script = format!(
            "((sel) => {expression})({sel})",
            sel = js_str(selector)
        );
        self.browser.eval(&script).await
    }
}

#[async_trait]
impl PortalPage for AgentBrowserPage {
    async fn goto(&self, url: &str) -> DriverResult<()> {
        let current = self.current_url().await.unwrap_or_default();
        let soft = same_origin(&current, url) && self.hook_present().await.unwrap_or(false);

        if soft {
            debug!(%url, "in-app navigation");
            self.soft_navigate(url).await?;
        } else {
            info!(%url, "opening");
            self.hard_navigate(url).await?;
        }
        self.install_hook().await
    }

    async fn current_url(&self) -> DriverResult<String> {
        match self.browser.eval("location.href").await? {
            Value::String(url) => Ok(url),
            other => Err(DriverError::Script(format!("unexpected location {other}"))),
        }
    }

    async fn is_element_present(&self, selector: &str) -> DriverResult<bool> {
        expect_bool(&self.query("document.querySelector(sel) !== null", selector).await?)
    }

    async fn count_elements(&self, selector: &str) -> DriverResult<usize> {
        let value = self
            .query("document.querySelectorAll(sel).length", selector)
            .await?;
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| DriverError::Script(format!("expected count, got {value}")))
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        self.browser.run_ok(&["click", selector]).await.map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()> {
        self.browser
            .run_ok(&["fill", selector, value])
            .await
            .map(|_| ())
    }

    async fn attribute(&self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        let expression = format!(
            "(e => e ? e.getAttribute({name}) : null)(document.querySelector(sel))",
            name = js_str(name)
        );
        Ok(self
            .query(&expression, selector)
            .await?
            .as_str()
            .map(ToOwned::to_owned))
    }

    async fn inner_texts(&self, selector: &str) -> DriverResult<Vec<String>> {
        let value = self
            .query(
                "Array.from(document.querySelectorAll(sel), e => (e.innerText || e.textContent || '').trim())",
                selector,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| DriverError::Script(e.to_string()))
    }

    async fn storage_item(&self, key: &str) -> DriverResult<Option<String>> {
        let value = self
            .query(
                "window.localStorage.getItem(sel) ?? window.sessionStorage.getItem(sel)",
                key,
            )
            .await?;
        Ok(value.as_str().map(ToOwned::to_owned))
    }

    async fn evaluate(&self, script: &str) -> DriverResult<Value> {
        self.browser.eval(script).await
    }
}
