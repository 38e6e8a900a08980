//! Hook runner: the bridge between the agent runtime and the daemon.
//!
//! The agent spawns `kait hook <kind>` with one event as JSON on stdin. The
//! runner stamps the kind, POSTs to the daemon, and for pre-tool events asks
//! `/advise` and prints the advice as hook output. It always exits 0: a
//! missing or wedged daemon must never block the agent's tool call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Total time the hook will spend talking to the daemon.
const HOOK_BUDGET_MS: u64 = 1500;

/// Session id used when the agent runtime did not provide one.
const FALLBACK_SESSION: &str = "default";

/// Hook output printed on stdout for pre-tool invocations.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HookOutput {
    /// Advice texts, best first. Empty when nothing fired.
    pub advice: Vec<String>,
}

/// One advice item as returned by `/advise`.
#[derive(Debug, Deserialize)]
struct WireAdviceItem {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireAdviseResponse {
    #[serde(default)]
    items: Vec<WireAdviceItem>,
}

/// The hook runner.
pub struct HookRunner {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HookRunner {
    /// Create a runner against the given daemon base URL.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(HOOK_BUDGET_MS))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    /// Handle one hook invocation.
    ///
    /// Returns the hook output to print (pre-tool only). Every failure path
    /// logs and falls through; the exit code is always 0.
    pub fn run(&self, kind: EventKind, stdin_json: &str) -> Option<HookOutput> {
        let event = match prepare_event(kind, stdin_json) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("hook input not usable: {}", err);
                return None;
            }
        };

        if let Err(err) = self.post_event(&event) {
            tracing::warn!("event post failed (daemon down?): {}", err);
        }

        if kind != EventKind::PreTool {
            return None;
        }

        let advice = self.fetch_advice(&event).unwrap_or_default();
        Some(HookOutput { advice })
    }

    fn post_event(&self, event: &serde_json::Value) -> Result<(), String> {
        let mut request = self
            .client
            .post(format!("{}/events", self.base_url))
            .json(event);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("daemon returned {}", response.status()));
        }
        Ok(())
    }

    fn fetch_advice(&self, event: &serde_json::Value) -> Option<Vec<String>> {
        let tool = event.get("tool")?.as_str()?;
        let body = serde_json::json!({
            "session_id": event.get("session_id").and_then(|v| v.as_str()).unwrap_or(FALLBACK_SESSION),
            "tool": tool,
            "tool_args": event.get("tool_args").cloned().unwrap_or(serde_json::Value::Null),
        });

        let mut request = self
            .client
            .post(format!("{}/advise", self.base_url))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().ok()?;
        let parsed: WireAdviseResponse = response.json().ok()?;
        Some(parsed.items.into_iter().map(|i| i.text).collect())
    }
}

/// Stamp kind, source, and session fallback onto the raw hook payload.
fn prepare_event(kind: EventKind, stdin_json: &str) -> Result<serde_json::Value, String> {
    let mut event: serde_json::Value =
        serde_json::from_str(stdin_json).map_err(|e| format!("stdin is not JSON: {}", e))?;

    let Some(map) = event.as_object_mut() else {
        return Err("stdin is not a JSON object".to_string());
    };
    map.insert(
        "kind".to_string(),
        serde_json::Value::String(kind.as_str().to_string()),
    );
    map.entry("source".to_string())
        .or_insert_with(|| serde_json::Value::String("observe".to_string()));

    let session_missing = map
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if session_missing {
        map.insert(
            "session_id".to_string(),
            serde_json::Value::String(FALLBACK_SESSION.to_string()),
        );
    }

    Ok(event)
}
