//! Page-side network hook and the task that drains it into the bridge.
//!
//! The hook wraps `fetch` and `XMLHttpRequest`, queues every JSON-looking
//! response body in page context and remembers credentials typed into the
//! login form. The pump reads the queue, forwards it over the bridge and only
//! then acknowledges it, so a failed round-trip re-delivers instead of losing
//! data. Sequences combine the hook's install time with a counter, which keeps
//! them unique across page loads.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::cli::AgentBrowser;
use crate::portal::bridge::{BridgeMessage, BridgeSender};
use crate::portal::model::Credentials;
use crate::portal::profile::Selectors;

const HOOK_TEMPLATE: &str = r#"(() => {
  if (window.__bytelHook) return 'present';
  const epoch = Date.now() * 1000;
  let counter = 0;
  const queue = [];
  let credentials = null;

  const push = (url, body) => {
    if (typeof body !== 'string') return;
    const head = body.trimStart()[0];
    if (head !== '{' && head !== '[') return;
    counter += 1;
    queue.push({ sequence: epoch + counter, url: url || null, body });
  };

  const nativeFetch = window.fetch;
  if (nativeFetch) {
    window.fetch = function (...args) {
      return nativeFetch.apply(this, args).then((response) => {
        try {
          response.clone().text().then((text) => push(response.url, text), () => {});
        } catch (_) {}
        return response;
      });
    };
  }

  const nativeOpen = XMLHttpRequest.prototype.open;
  const nativeSend = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.open = function (method, url, ...rest) {
    this.__bytelUrl = String(url);
    return nativeOpen.call(this, method, url, ...rest);
  };
  XMLHttpRequest.prototype.send = function (...args) {
    this.addEventListener('load', () => {
      try {
        const url = this.responseURL || this.__bytelUrl;
        if (this.responseType === '' || this.responseType === 'text') push(url, this.responseText);
        else if (this.responseType === 'json') push(url, JSON.stringify(this.response));
      } catch (_) {}
    });
    return nativeSend.apply(this, args);
  };

  const capture = () => {
    const login = document.querySelector(__USERNAME__);
    const password = document.querySelector(__PASSWORD__);
    if (login && password && login.value && password.value) {
      credentials = { login: login.value, password: password.value };
    }
  };
  document.addEventListener('submit', capture, true);
  document.addEventListener('click', (event) => {
    if (event.target instanceof Element && event.target.closest(__SUBMIT__)) capture();
  }, true);

  window.__bytelHook = {
    drain: () => ({ responses: queue.slice(), credentials }),
    ack: (upTo) => {
      while (queue.length && queue[0].sequence <= upTo) queue.shift();
    },
  };
  return 'installed';
})()"#;

pub(super) const DRAIN_SCRIPT: &str =
    "window.__bytelHook ? window.__bytelHook.drain() : { responses: [], credentials: null }";

pub(super) const PRESENT_SCRIPT: &str = "Boolean(window.__bytelHook)";

/// JSON string literal, valid as a JavaScript string literal too.
pub(super) fn js_str(value: &str) -> String {
    Value::String(value.to_owned()).to_string()
}

pub fn hook_script(selectors: &Selectors) -> String {
    HOOK_TEMPLATE
        .replace("__USERNAME__", &js_str(&selectors.username))
        .replace("__PASSWORD__", &js_str(&selectors.password))
        .replace("__SUBMIT__", &js_str(&selectors.submit))
}

fn ack_script(up_to: u64) -> String {
    format!("window.__bytelHook && window.__bytelHook.ack({up_to})")
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    sequence: u64,
    url: Option<String>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct HookLogin {
    login: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct Drained {
    #[serde(default)]
    responses: Vec<HookResponse>,
    #[serde(default)]
    credentials: Option<HookLogin>,
}

impl Drained {
    /// Splits a drain into bridge messages plus the highest sequence seen.
    fn into_messages(self) -> (Vec<BridgeMessage>, Option<u64>) {
        let up_to = self.responses.iter().map(|r| r.sequence).max();
        let mut messages: Vec<BridgeMessage> = self
            .responses
            .into_iter()
            .map(|r| BridgeMessage::NetworkResponse {
                sequence: r.sequence,
                url: r.url,
                body: r.body,
            })
            .collect();
        if let Some(login) = self.credentials {
            messages.push(BridgeMessage::Credentials(Credentials::new(
                login.login,
                login.password,
            )));
        }
        (messages, up_to)
    }
}

/// One drain round-trip. Returns `false` once the bridge is closed.
async fn pump_once(browser: &AgentBrowser, tx: &BridgeSender) -> bool {
    let raw = match browser.eval(DRAIN_SCRIPT).await {
        Ok(raw) => raw,
        Err(err) => {
            // Expected while a navigation is in flight.
            trace!(error = %err, "hook drain failed");
            return !tx.is_closed();
        }
    };
    let drained: Drained = match serde_json::from_value(raw) {
        Ok(drained) => drained,
        Err(err) => {
            debug!(error = %err, "unexpected hook drain shape");
            return !tx.is_closed();
        }
    };

    let (messages, up_to) = drained.into_messages();
    for message in messages {
        if tx.send(message).await.is_err() {
            return false;
        }
    }
    if let Some(up_to) = up_to
        && let Err(err) = browser.eval(&ack_script(up_to)).await
    {
        debug!(error = %err, up_to, "hook ack failed, responses will be re-delivered");
    }
    true
}

/// Drains the hook every `interval` until the bridge receiver is dropped.
pub fn spawn_pump(browser: AgentBrowser, tx: BridgeSender, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(session = browser.session(), "network hook pump started");
        while pump_once(&browser, &tx).await {
            tokio::time::sleep(interval).await;
        }
        debug!("network hook pump stopped");
    })
}
