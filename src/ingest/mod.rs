//! The ingest daemon: HTTP surface for hooks.
//!
//! Loopback-bound axum server with four routes:
//! - `POST /events` — one JSON event or an NDJSON batch, bearer-authed
//! - `POST /advise` — just-in-time advice for the pre-tool hook
//! - `GET /health` — liveness
//! - `GET /status` — queue depth, cycle age, component heartbeats
//!
//! The daemon never blocks on pipeline progress: accepted events go straight
//! to the append-only queue (or its overflow sidecar) and the handler
//! returns 202.

pub mod scorer;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::advisory::{AdviceItem, AdviceProvider, AdviceRequest};
use crate::config::{
    invalid_events_path, pipeline_stats_path, token_path, IngestConfig, PipelineConfig,
};
use crate::error::{KaitError, Result};
use crate::event::{Event, QueueEntry};
use crate::heartbeat::{ComponentStatus, HeartbeatRegistry};
use crate::pipeline::CycleStats;
use crate::queue::EventQueue;
use crate::util;

/// Shared state behind the HTTP handlers.
pub struct IngestState {
    /// The append-only queue accepted events land in.
    pub queue: Arc<EventQueue>,
    /// Ingest configuration.
    pub cfg: IngestConfig,
    /// Queue depth at which clients get 429.
    pub hard_pressure: usize,
    /// Bearer token required on mutating calls.
    pub token: String,
    /// Data root, for status reads.
    pub data_root: PathBuf,
    /// Advice provider for `/advise`; absent in ingest-only setups.
    pub advisor: Option<Arc<dyn AdviceProvider>>,
    /// Heartbeat registry shared with the workers.
    pub heartbeats: Arc<HeartbeatRegistry>,
    limiter: Mutex<HashMap<IpAddr, VecDeque<f64>>>,
}

impl IngestState {
    /// Assemble the handler state.
    pub fn new(
        queue: Arc<EventQueue>,
        cfg: IngestConfig,
        pipeline_cfg: &PipelineConfig,
        token: String,
        data_root: impl Into<PathBuf>,
        advisor: Option<Arc<dyn AdviceProvider>>,
        heartbeats: Arc<HeartbeatRegistry>,
    ) -> Self {
        Self {
            queue,
            cfg,
            hard_pressure: pipeline_cfg.hard_pressure,
            token,
            data_root: data_root.into(),
            advisor,
            heartbeats,
            limiter: Mutex::new(HashMap::new()),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.token);
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }

    fn rate_limit(&self, ip: IpAddr, now_s: f64) -> (bool, u64) {
        let mut limiter = self.limiter.lock().expect("rate limiter lock poisoned");
        let window = limiter.entry(ip).or_default();
        allow_rate_limited(
            window,
            now_s,
            self.cfg.rate_limit_per_min,
            self.cfg.rate_limit_window_s,
        )
    }
}

/// Sliding-window rate limit check.
///
/// Returns whether the request is allowed and, when it is not, how many
/// seconds until the window frees up.
pub fn allow_rate_limited(
    window: &mut VecDeque<f64>,
    now: f64,
    limit: u32,
    window_s: u64,
) -> (bool, u64) {
    let horizon = now - window_s as f64;
    while window.front().is_some_and(|t| *t <= horizon) {
        window.pop_front();
    }

    if (window.len() as u32) < limit {
        window.push_back(now);
        return (true, 0);
    }

    let oldest = window.front().copied().unwrap_or(now);
    let retry = (oldest + window_s as f64 - now).ceil().max(1.0) as u64;
    (false, retry)
}

/// A quarantined invalid event.
#[derive(Debug, Serialize, Deserialize)]
struct QuarantineRow {
    ts: chrono::DateTime<Utc>,
    reason: String,
    payload: String,
}

/// Append an invalid payload to the bounded quarantine file.
pub fn quarantine_invalid(
    data_root: &Path,
    cfg: &IngestConfig,
    payload: &str,
    reason: &str,
) -> Result<()> {
    let path = invalid_events_path(data_root);
    util::append_jsonl(
        &path,
        &QuarantineRow {
            ts: Utc::now(),
            reason: reason.to_string(),
            payload: util::truncate_chars(payload, cfg.invalid_max_payload_chars),
        },
    )?;
    util::trim_jsonl_to_last(&path, cfg.invalid_max_lines)
}

/// Outcome of parsing a request body into events.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Events that validated, ids and importance assigned.
    pub accepted: Vec<Event>,
    /// Rejected payload fragments with their reasons.
    pub rejected: Vec<(String, String)>,
}

/// Parse a request body: a single JSON event or an NDJSON batch.
pub fn parse_events(body: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    // A whole-body parse handles single (possibly pretty-printed) events
    let fragments: Vec<&str> = if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        vec![body]
    } else {
        body.lines().filter(|l| !l.trim().is_empty()).collect()
    };

    for fragment in fragments {
        match serde_json::from_str::<Event>(fragment) {
            Ok(mut event) => {
                if event.event_id.is_empty() {
                    event.event_id = util::next_event_id();
                }
                if event.ts_ns == 0 {
                    event.ts_ns = util::now_ns();
                }
                match event.validate() {
                    Ok(()) => {
                        event.importance = scorer::score(&event);
                        batch.accepted.push(event);
                    }
                    Err(err) => batch.rejected.push((fragment.to_string(), err.to_string())),
                }
            }
            Err(err) => batch
                .rejected
                .push((fragment.to_string(), format!("malformed JSON: {}", err))),
        }
    }

    batch
}

/// Response body for `POST /events`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EventsResponse {
    /// Events written to the queue.
    pub accepted: usize,
    /// Fragments rejected and quarantined.
    pub rejected: usize,
}

/// Request body for `POST /advise`.
#[derive(Debug, Deserialize)]
pub struct AdviseBody {
    session_id: String,
    tool: String,
    #[serde(default)]
    tool_args: serde_json::Value,
    #[serde(default)]
    context: Option<String>,
}

/// Response body for `POST /advise`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AdviseResponse {
    /// Ranked advice; empty on any advisor fault.
    pub items: Vec<AdviceItem>,
}

/// Body of `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    /// Unconsumed queue records.
    pub queue_depth: usize,
    /// Seconds since the last pipeline cycle completed.
    pub last_cycle_age_s: Option<i64>,
    /// Per-component heartbeat health.
    pub components: BTreeMap<String, ComponentHealth>,
}

/// One component's health in `/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// `ok`, `stale`, or `missing`.
    pub status: String,
}

/// Build the router over shared state.
pub fn router(state: Arc<IngestState>) -> Router {
    let body_limit = state.cfg.max_batch_bytes;
    Router::new()
        .route("/events", post(post_events))
        .route("/advise", post(post_advise))
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve the router on an already-bound listener.
pub async fn serve(state: Arc<IngestState>, listener: tokio::net::TcpListener) -> Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| KaitError::store(format!("http server error: {}", e)))
}

async fn get_health() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<Arc<IngestState>>) -> Json<StatusBody> {
    state.heartbeats.beat("kaitd");

    let queue_depth = state.queue.depth().unwrap_or(0);
    let last_cycle_age_s = std::fs::read_to_string(pipeline_stats_path(&state.data_root))
        .ok()
        .and_then(|content| serde_json::from_str::<CycleStats>(&content).ok())
        .map(|stats| (Utc::now() - stats.ts).num_seconds());

    let mut components = BTreeMap::new();
    for component in ["kaitd", "pipeline", "advisory"] {
        let status = match state.heartbeats.component_status(component) {
            ComponentStatus::Ok => "ok",
            ComponentStatus::Stale => "stale",
            ComponentStatus::Missing => "missing",
        };
        components.insert(
            component.to_string(),
            ComponentHealth {
                status: status.to_string(),
            },
        );
    }

    Json(StatusBody {
        queue_depth,
        last_cycle_age_s,
        components,
    })
}

async fn post_events(
    State(state): State<Arc<IngestState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.heartbeats.beat("kaitd");

    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "missing or bad bearer token").into_response();
    }

    let now_s = Utc::now().timestamp() as f64;
    let (allowed, retry) = state.rate_limit(addr.ip(), now_s);
    if !allowed {
        return rate_limited_response(retry);
    }

    // Backpressure: shed load before doing any parsing work
    if state.queue.depth().unwrap_or(0) > state.hard_pressure {
        return rate_limited_response(5);
    }

    let Ok(body) = std::str::from_utf8(&body) else {
        return (StatusCode::BAD_REQUEST, "body is not UTF-8").into_response();
    };

    let batch = parse_events(body);
    for (payload, reason) in &batch.rejected {
        if let Err(err) = quarantine_invalid(&state.data_root, &state.cfg, payload, reason) {
            tracing::warn!("failed to quarantine invalid event: {}", err);
        }
    }

    if batch.accepted.is_empty() {
        let rejected = batch.rejected.len();
        return (
            StatusCode::BAD_REQUEST,
            Json(EventsResponse {
                accepted: 0,
                rejected,
            }),
        )
            .into_response();
    }

    let mut accepted = 0;
    let mut rejected = batch.rejected.len();
    for event in batch.accepted {
        match state.queue.append(&QueueEntry::for_event(event)) {
            Ok(()) => accepted += 1,
            Err(err) => {
                tracing::error!("queue append failed after overflow fallback: {}", err);
                rejected += 1;
            }
        }
    }

    (StatusCode::ACCEPTED, Json(EventsResponse { accepted, rejected })).into_response()
}

async fn post_advise(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    Json(body): Json<AdviseBody>,
) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "missing or bad bearer token").into_response();
    }

    let Some(advisor) = &state.advisor else {
        return (StatusCode::OK, Json(AdviseResponse { items: vec![] })).into_response();
    };

    let mut req = AdviceRequest::new(body.session_id, body.tool, body.tool_args);
    req.context = body.context;
    let items = advisor.advise_for(&req);
    (StatusCode::OK, Json(AdviseResponse { items })).into_response()
}

fn rate_limited_response(retry_after_s: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after_s.to_string())],
        "backpressure: retry later",
    )
        .into_response()
}

/// Resolve the daemon's bearer token.
///
/// Order: `KAITD_TOKEN` env var, then the token file (which must be 0600),
/// else a fresh token is generated and written with 0600 permissions.
pub fn resolve_token(data_root: &Path) -> Result<String> {
    if let Ok(token) = std::env::var("KAITD_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let path = token_path(data_root);
    if path.exists() {
        check_token_permissions(&path)?;
        let token = util::read_to_string_limited(&path)?.trim().to_string();
        if token.is_empty() {
            return Err(KaitError::config(format!(
                "token file {} is empty",
                path.display()
            )));
        }
        return Ok(token);
    }

    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    util::atomic_write_string(&path, &token)?;
    set_token_permissions(&path)?;
    Ok(token)
}

#[cfg(unix)]
fn check_token_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)
        .map_err(|e| KaitError::storage(path, e))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(KaitError::config(format!(
            "token file {} must not be group/world readable (chmod 600)",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_token_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_token_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| KaitError::storage(path, e))
}

#[cfg(not(unix))]
fn set_token_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serial_test::serial;
    use tempfile::TempDir;

    // Rate limiter

    #[test]
    fn test_rate_limiter_enforces_window() {
        let mut window = VecDeque::new();

        let (ok, retry) = allow_rate_limited(&mut window, 100.0, 2, 60);
        assert!(ok);
        assert_eq!(retry, 0);

        let (ok, retry) = allow_rate_limited(&mut window, 101.0, 2, 60);
        assert!(ok);
        assert_eq!(retry, 0);

        let (ok, retry) = allow_rate_limited(&mut window, 102.0, 2, 60);
        assert!(!ok);
        assert!(retry >= 1);

        // Past the window, requests flow again
        let (ok, retry) = allow_rate_limited(&mut window, 161.0, 2, 60);
        assert!(ok);
        assert_eq!(retry, 0);
    }

    // Body parsing

    #[test]
    fn test_parse_single_event() {
        let body = r#"{"session_id": "s1", "kind": "user_prompt", "text": "hello"}"#;
        let batch = parse_events(body);

        assert_eq!(batch.accepted.len(), 1);
        assert!(batch.rejected.is_empty());
        let event = &batch.accepted[0];
        assert!(!event.event_id.is_empty());
        assert!(event.ts_ns > 0);
        assert!(event.importance > 0.0);
    }

    #[test]
    fn test_parse_ndjson_batch() {
        let body = concat!(
            r#"{"session_id": "s1", "kind": "pre_tool", "tool": "Read"}"#,
            "\n",
            r#"{"session_id": "s1", "kind": "post_tool", "tool": "Read"}"#,
            "\n"
        );
        let batch = parse_events(body);
        assert_eq!(batch.accepted.len(), 2);
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        let body = concat!(
            r#"{"session_id": "s1", "kind": "pre_tool", "tool": "Read"}"#,
            "\n",
            "{definitely not json\n"
        );
        let batch = parse_events(body);
        assert_eq!(batch.accepted.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert!(batch.rejected[0].1.contains("malformed JSON"));
    }

    #[test]
    fn test_parse_rejects_invalid_events() {
        // Missing tool on an outcome kind
        let body = r#"{"session_id": "s1", "kind": "post_tool_failure"}"#;
        let batch = parse_events(body);
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn test_parse_preserves_provided_ids() {
        let body = r#"{"event_id": "evt_custom", "session_id": "s1", "kind": "user_prompt"}"#;
        let batch = parse_events(body);
        assert_eq!(batch.accepted[0].event_id, "evt_custom");
    }

    // Quarantine

    #[test]
    fn test_quarantine_is_bounded_and_truncated() {
        let dir = TempDir::new().unwrap();
        let cfg = IngestConfig {
            invalid_max_lines: 3,
            invalid_max_payload_chars: 12,
            ..IngestConfig::default()
        };

        for i in 0..5 {
            quarantine_invalid(dir.path(), &cfg, &"x".repeat(200), &format!("reason-{}", i))
                .unwrap();
        }

        let content = std::fs::read_to_string(invalid_events_path(dir.path())).unwrap();
        let rows: Vec<QuarantineRow> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.iter().map(|r| r.reason.as_str()).collect::<Vec<_>>(),
            vec!["reason-2", "reason-3", "reason-4"]
        );
        assert!(rows[2].payload.ends_with("...<truncated>"));
    }

    // Token resolution

    #[test]
    #[serial]
    fn test_token_generated_and_reused() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");

        let first = resolve_token(dir.path()).unwrap();
        assert_eq!(first.len(), 32);
        assert!(token_path(dir.path()).exists());

        let second = resolve_token(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    #[serial]
    fn test_token_env_wins() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("KAITD_TOKEN", "from-env");

        let token = resolve_token(dir.path()).unwrap();
        assert_eq!(token, "from-env");
        // No file written when the env var serves
        assert!(!token_path(dir.path()).exists());

        std::env::remove_var("KAITD_TOKEN");
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    fn test_world_readable_token_file_is_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");
        let path = token_path(dir.path());
        std::fs::write(&path, "secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = resolve_token(dir.path()).unwrap_err();
        assert!(matches!(err, KaitError::Config { .. }));
    }

    // Importance assignment end to end through parse

    #[test]
    fn test_parse_assigns_importance_by_kind() {
        let body = r#"{"session_id": "s1", "kind": "post_tool_failure", "tool": "Bash"}"#;
        let batch = parse_events(body);
        assert!((batch.accepted[0].importance - scorer::weights::FAILURE_BIAS).abs() < 1e-9);
    }

    #[test]
    fn test_event_kind_in_parse_is_validated() {
        let body = r#"{"session_id": "s1", "kind": "not_a_kind"}"#;
        let batch = parse_events(body);
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn test_parse_empty_body() {
        let batch = parse_events("");
        assert!(batch.accepted.is_empty());
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn test_kind_roundtrip_through_parse() {
        for kind in EventKind::all() {
            let body = format!(
                r#"{{"session_id": "s1", "kind": "{}", "tool": "Bash"}}"#,
                kind.as_str()
            );
            let batch = parse_events(&body);
            assert_eq!(batch.accepted.len(), 1, "kind {}", kind.as_str());
            assert_eq!(batch.accepted[0].kind, *kind);
        }
    }
}
