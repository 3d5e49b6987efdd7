use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::BrowserConfig;
use crate::portal::page::{DriverError, DriverResult};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from agent-browser --json commands
#[derive(Debug, Deserialize)]
pub struct AgentBrowserResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

/// Handle on one named agent-browser session. Cheap to clone; every call
/// spawns the CLI, which talks to the session's long-lived browser.
#[derive(Debug, Clone)]
pub struct AgentBrowser {
    binary: String,
    session: String,
    headed: bool,
    command_timeout: Duration,
}

impl AgentBrowser {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            session: config.session_name.clone(),
            headed: config.headed,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Upper bound for one CLI invocation. A hung call is killed.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Check if agent-browser CLI is available
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    /// Execute an agent-browser command
    pub async fn run(&self, args: &[&str]) -> DriverResult<AgentBrowserResponse> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--session").arg(&self.session);
        if self.headed {
            cmd.arg("--headed");
        }
        cmd.args(args).arg("--json");

        // Arguments may carry form values; only the verb is logged.
        debug!(verb = args.first().copied().unwrap_or_default(), session = %self.session, "agent-browser");

        let running = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.command_timeout, running)
            .await
            .map_err(|_| timed_out(args, self.command_timeout))?
            .map_err(|e| DriverError::Backend(format!("failed to run {}: {e}", self.binary)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            debug!(stderr = %stderr.trim(), "agent-browser stderr");
        }

        Ok(parse_response(&stdout, &stderr, output.status.success()))
    }

    /// Runs a command and maps an unsuccessful response to a [`DriverError`].
    pub async fn run_ok(&self, args: &[&str]) -> DriverResult<Option<Value>> {
        let response = self.run(args).await?;
        if response.success {
            return Ok(response.data);
        }
        Err(classify_failure(args, response.error.unwrap_or_default()))
    }

    /// Evaluates `script` in page context.
    pub async fn eval(&self, script: &str) -> DriverResult<Value> {
        let response = self.run(&["eval", script]).await?;
        if !response.success {
            return Err(DriverError::Script(
                response.error.unwrap_or_else(|| "eval failed".into()),
            ));
        }
        Ok(eval_result(response.data))
    }
}

fn parse_response(stdout: &str, stderr: &str, status_ok: bool) -> AgentBrowserResponse {
    if let Ok(resp) = serde_json::from_str::<AgentBrowserResponse>(stdout.trim()) {
        return resp;
    }

    // Fallback for non-JSON output
    if status_ok {
        AgentBrowserResponse {
            success: true,
            data: Some(json!({ "output": stdout.trim() })),
            error: None,
        }
    } else {
        AgentBrowserResponse {
            success: false,
            data: None,
            error: Some(stderr.trim().to_string()),
        }
    }
}

/// `eval` wraps the script's value as `{ "result": .. }`.
fn eval_result(data: Option<Value>) -> Value {
    match data {
        Some(Value::Object(mut map)) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        Some(other) => other,
        None => Value::Null,
    }
}

fn timed_out(args: &[&str], after: Duration) -> DriverError {
    match args {
        ["open", url, ..] => DriverError::NavigationTimeout { url: (*url).to_string() },
        _ => DriverError::Backend(format!(
            "{} timed out after {}s",
            args.first().copied().unwrap_or("command"),
            after.as_secs()
        )),
    }
}

fn classify_failure(args: &[&str], error: String) -> DriverError {
    let lowered = error.to_ascii_lowercase();
    let target = args.get(1).copied().unwrap_or_default().to_string();
    match args.first().copied() {
        Some("click" | "fill")
            if lowered.contains("not found")
                || lowered.contains("no element")
                || lowered.contains("resolved to 0 elements") =>
        {
            DriverError::ElementNotFound { selector: target }
        }
        Some("open") if lowered.contains("timeout") || lowered.contains("timed out") => {
            DriverError::NavigationTimeout { url: target }
        }
        _ => DriverError::Backend(if error.is_empty() {
            format!("{} failed", args.first().copied().unwrap_or("command"))
        } else {
            error
        }),
    }
}
