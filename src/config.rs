//! Configuration loading for Kait.
//!
//! Configuration follows a precedence chain:
//! 1. Environment variables (highest priority)
//! 2. Data-root config (`<data_root>/config.toml`)
//! 3. Defaults (lowest priority)
//!
//! All configuration is optional. The daemon runs with sensible defaults
//! when no config exists.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FailOpen, KaitError, Result};

/// Main configuration struct for Kait.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Lite mode: run only ingest + pipeline, skip sidecar workers.
    pub lite: bool,
    /// Ingest daemon configuration.
    pub ingest: IngestConfig,
    /// Queue file configuration.
    pub queue: QueueConfig,
    /// Pipeline scheduler configuration.
    pub pipeline: PipelineConfig,
    /// Memory capture configuration.
    pub memory: MemoryConfig,
    /// Meta-Ralph quality gate configuration.
    pub ralph: RalphConfig,
    /// Cognitive store configuration.
    pub cognitive: CognitiveConfig,
    /// EIDOS episodic store configuration.
    pub eidos: EidosConfig,
    /// Advisory engine configuration.
    pub advisory: AdvisoryConfig,
    /// Implicit feedback configuration.
    pub feedback: FeedbackConfig,
    /// Promotion loop configuration.
    pub promotion: PromotionConfig,
}

/// Ingest daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Loopback port to bind.
    pub port: u16,
    /// Maximum accepted request body, in bytes.
    pub max_batch_bytes: usize,
    /// Per-client request budget per window.
    pub rate_limit_per_min: u32,
    /// Rate-limit window in seconds.
    pub rate_limit_window_s: u64,
    /// Most-recent quarantined events kept on disk.
    pub invalid_max_lines: usize,
    /// Quarantined payloads are truncated to this many characters.
    pub invalid_max_payload_chars: usize,
    /// Heartbeat write interval for workers, in seconds.
    pub heartbeat_interval_s: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            max_batch_bytes: 8 * 1024 * 1024,
            rate_limit_per_min: 120,
            rate_limit_window_s: 60,
            invalid_max_lines: 1000,
            invalid_max_payload_chars: 2000,
            heartbeat_interval_s: 30,
        }
    }
}

/// Queue file configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Rotate the primary queue file once it reaches this many bytes.
    pub rotate_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Pipeline scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum events read per cycle.
    pub batch_max: usize,
    /// Keep rate for events below the low-importance threshold.
    pub low_keep_rate: f64,
    /// Importance below which sampling applies.
    pub low_importance_threshold: f64,
    /// Queue depth at which batch size doubles.
    pub soft_pressure: usize,
    /// Queue depth at which ingest returns 429.
    pub hard_pressure: usize,
    /// Delay between cycles, in milliseconds.
    pub cycle_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max: 1000,
            low_keep_rate: 0.25,
            low_importance_threshold: 0.3,
            soft_pressure: 5_000,
            hard_pressure: 20_000,
            cycle_interval_ms: 500,
        }
    }
}

/// Memory capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Minimum score for a candidate to become a pending memory.
    pub mem_threshold: f64,
    /// Maximum characters per captured chunk.
    pub patch_max_chars: usize,
    /// Minimum characters for a chunk to be considered.
    pub patch_min_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mem_threshold: 0.5,
            patch_max_chars: 2000,
            patch_min_chars: 40,
        }
    }
}

/// Meta-Ralph quality gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    /// Statement similarity at or above which a candidate is a duplicate.
    pub dedup_threshold: f64,
    /// Highest total scored `primitive`.
    pub primitive_max: u8,
    /// Highest total scored `needs_work`.
    pub needs_work_max: u8,
    /// Highest total subject to the dedup check.
    pub dedup_band_max: u8,
    /// Most-recent verdicts kept in the roast history.
    pub roast_history_max_lines: usize,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.85,
            primitive_max: 1,
            needs_work_max: 3,
            dedup_band_max: 5,
            roast_history_max_lines: 5000,
        }
    }
}

/// Cognitive store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CognitiveConfig {
    /// Half-life of the recency factor in advisory readiness, in seconds.
    pub reliability_halflife_s: u64,
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            reliability_halflife_s: 14 * 86_400,
        }
    }
}

/// EIDOS episodic store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EidosConfig {
    /// Open steps older than this are force-sealed as abandoned, seconds.
    pub step_timeout_s: u64,
    /// Idle sessions older than this close their episode, seconds.
    pub session_timeout_s: u64,
    /// Minimum sealed steps for an episode to enter distillation.
    pub min_steps: usize,
    /// Supporting steps required for a cluster to distill.
    pub validate_min: usize,
}

impl Default for EidosConfig {
    fn default() -> Self {
        Self {
            step_timeout_s: 300,
            session_timeout_s: 1800,
            min_steps: 5,
            validate_min: 3,
        }
    }
}

/// Advisory engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// Items requested from each retrieval source.
    pub per_source_k: usize,
    /// Maximum items emitted per call.
    pub max_emit: usize,
    /// Fused items considered by the reranker.
    pub rerank_top_m: usize,
    /// Per-tool cooldown between emissions, seconds.
    pub tool_cooldown_s: u64,
    /// Identical advice is suppressed within this TTL, seconds.
    pub advice_ttl_s: u64,
    /// Emissions allowed per session per minute.
    pub budget_per_minute: u32,
    /// Require agreement from multiple sources before emitting.
    pub agreement_gate: bool,
    /// Distinct sources required when the agreement gate is on.
    pub min_sources: usize,
    /// Below this remaining budget, use the quick fallback path, ms.
    pub quick_min_ms: u64,
    /// Total time budget for one advise call, ms.
    pub budget_ms: u64,
    /// Use the full-text index for semantic retrieval; keyword overlap otherwise.
    pub embeddings: bool,
    /// Reciprocal-rank-fusion weight for the cognitive source.
    pub weight_cognitive: f64,
    /// Fusion weight for the EIDOS source.
    pub weight_eidos: f64,
    /// Fusion weight for the semantic source.
    pub weight_semantic: f64,
    /// Fusion weight for the packet cache.
    pub weight_packet: f64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            per_source_k: 5,
            max_emit: 2,
            rerank_top_m: 8,
            tool_cooldown_s: 30,
            advice_ttl_s: 600,
            budget_per_minute: 2,
            agreement_gate: false,
            min_sources: 2,
            quick_min_ms: 900,
            budget_ms: 1500,
            embeddings: true,
            weight_cognitive: 1.0,
            weight_eidos: 0.9,
            weight_semantic: 0.7,
            weight_packet: 0.8,
        }
    }
}

/// Implicit feedback configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedbackConfig {
    /// A different tool within this window marks the exposure ignored, seconds.
    pub exposure_timeout_s: u64,
    /// Exposures expire entirely after this long, seconds.
    pub exposure_expiry_s: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            exposure_timeout_s: 30,
            exposure_expiry_s: 300,
        }
    }
}

/// Promotion loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionConfig {
    /// Minimum seconds between promotion passes.
    pub interval_s: u64,
    /// Reliability floor for promotion.
    pub promote_reliability: f64,
    /// Validation floor for promotion.
    pub promote_validations: u64,
    /// Promoted insights below this reliability are demoted.
    pub demotion_threshold: f64,
    /// Directory holding the guidance files; data root when unset.
    pub guidance_dir: Option<PathBuf>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            interval_s: 3600,
            promote_reliability: 0.80,
            promote_validations: 5,
            demotion_threshold: 0.65,
            guidance_dir: None,
        }
    }
}

impl Config {
    /// Load configuration for a data root with the full precedence chain.
    pub fn load(data_root: &Path) -> Self {
        let mut config = Self::load_from_file(&data_root.join("config.toml"))
            .fail_open_with("loading config", Config::default());
        config.apply_env_overrides();
        config
    }

    /// Load config from a specific TOML file.
    ///
    /// A missing file is not an error; it yields the defaults.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path).map_err(|e| KaitError::storage(path, e))?;
        toml::from_str(&content).map_err(|e| KaitError::config(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("KAITD_PORT") {
            if let Ok(n) = val.parse() {
                self.ingest.port = n;
            }
        }

        if let Ok(val) = env::var("KAIT_LITE") {
            self.lite = val == "1" || val == "true";
        }

        if let Ok(val) = env::var("KAIT_EMBEDDINGS") {
            self.advisory.embeddings = !(val == "0" || val == "false");
        }

        if let Ok(val) = env::var("KAIT_ADVISORY_AGREEMENT_GATE") {
            self.advisory.agreement_gate = val == "1" || val == "true";
        }

        if let Ok(val) = env::var("KAIT_ADVISORY_MIN_SOURCES") {
            if let Ok(n) = val.parse() {
                self.advisory.min_sources = n;
            }
        }

        if let Ok(val) = env::var("KAIT_PIPELINE_LOW_KEEP_RATE") {
            if let Ok(n) = val.parse() {
                self.pipeline.low_keep_rate = n;
            }
        }

        if let Ok(val) = env::var("KAIT_MEMORY_PATCH_MAX_CHARS") {
            if let Ok(n) = val.parse() {
                self.memory.patch_max_chars = n;
            }
        }

        if let Ok(val) = env::var("KAIT_MEMORY_PATCH_MIN_CHARS") {
            if let Ok(n) = val.parse() {
                self.memory.patch_min_chars = n;
            }
        }
    }
}

/// Resolve the Kait data root.
///
/// Checks the `DATA_ROOT` environment variable first, then falls back to
/// `~/.kait`.
pub fn data_root() -> Option<PathBuf> {
    if let Ok(root) = env::var("DATA_ROOT") {
        return Some(PathBuf::from(root));
    }
    dirs::home_dir().map(|h| h.join(".kait"))
}

/// `<data_root>/queue/`.
pub fn queue_dir(root: &Path) -> PathBuf {
    root.join("queue")
}

/// `<data_root>/queue/events.jsonl`.
pub fn queue_path(root: &Path) -> PathBuf {
    queue_dir(root).join("events.jsonl")
}

/// `<data_root>/queue/events.overflow.jsonl`.
pub fn queue_overflow_path(root: &Path) -> PathBuf {
    queue_dir(root).join("events.overflow.jsonl")
}

/// `<data_root>/queue/state.json`.
pub fn queue_state_path(root: &Path) -> PathBuf {
    queue_dir(root).join("state.json")
}

/// `<data_root>/cognitive_insights.json`.
pub fn cognitive_snapshot_path(root: &Path) -> PathBuf {
    root.join("cognitive_insights.json")
}

/// `<data_root>/eidos.db`.
pub fn eidos_db_path(root: &Path) -> PathBuf {
    root.join("eidos.db")
}

/// `<data_root>/advisor/`.
pub fn advisor_dir(root: &Path) -> PathBuf {
    root.join("advisor")
}

/// `<data_root>/advisory_decision_ledger.jsonl`.
pub fn decision_ledger_path(root: &Path) -> PathBuf {
    root.join("advisory_decision_ledger.jsonl")
}

/// `<data_root>/advisor/implicit_feedback.jsonl`.
pub fn implicit_feedback_path(root: &Path) -> PathBuf {
    advisor_dir(root).join("implicit_feedback.jsonl")
}

/// `<data_root>/advisor/advice_log.jsonl`.
pub fn advice_log_path(root: &Path) -> PathBuf {
    advisor_dir(root).join("advice_log.jsonl")
}

/// `<data_root>/advisor/packets.json`.
pub fn packets_path(root: &Path) -> PathBuf {
    advisor_dir(root).join("packets.json")
}

/// `<data_root>/promotion_log.jsonl`.
pub fn promotion_log_path(root: &Path) -> PathBuf {
    root.join("promotion_log.jsonl")
}

/// `<data_root>/roast_history.jsonl`.
pub fn roast_history_path(root: &Path) -> PathBuf {
    root.join("roast_history.jsonl")
}

/// `<data_root>/invalid_events.jsonl`.
pub fn invalid_events_path(root: &Path) -> PathBuf {
    root.join("invalid_events.jsonl")
}

/// `<data_root>/kaitd.token`.
pub fn token_path(root: &Path) -> PathBuf {
    root.join("kaitd.token")
}

/// `<data_root>/<component>.heartbeat.json`.
pub fn heartbeat_path(root: &Path, component: &str) -> PathBuf {
    root.join(format!("{}.heartbeat.json", component))
}

/// `<data_root>/pipeline_stats.json`.
pub fn pipeline_stats_path(root: &Path) -> PathBuf {
    root.join("pipeline_stats.json")
}

/// `<data_root>/pipeline_state.json`.
pub fn pipeline_state_path(root: &Path) -> PathBuf {
    root.join("pipeline_state.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.ingest.port, 8787);
        assert_eq!(config.ingest.max_batch_bytes, 8 * 1024 * 1024);
        assert_eq!(config.queue.rotate_bytes, 64 * 1024 * 1024);
        assert_eq!(config.pipeline.batch_max, 1000);
        assert!((config.pipeline.low_keep_rate - 0.25).abs() < f64::EPSILON);
        assert!((config.memory.mem_threshold - 0.5).abs() < f64::EPSILON);
        assert!((config.ralph.dedup_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.cognitive.reliability_halflife_s, 14 * 86_400);
        assert_eq!(config.eidos.session_timeout_s, 1800);
        assert_eq!(config.eidos.min_steps, 5);
        assert_eq!(config.advisory.max_emit, 2);
        assert_eq!(config.advisory.tool_cooldown_s, 30);
        assert_eq!(config.advisory.advice_ttl_s, 600);
        assert_eq!(config.feedback.exposure_timeout_s, 30);
        assert_eq!(config.promotion.interval_s, 3600);
        assert!((config.promotion.promote_reliability - 0.80).abs() < f64::EPSILON);
        assert!(!config.lite);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(
            &path,
            r#"
[advisory]
max_emit = 3
agreement_gate = true

[promotion]
interval_s = 60
"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();

        assert_eq!(config.advisory.max_emit, 3);
        assert!(config.advisory.agreement_gate);
        assert_eq!(config.promotion.interval_s, 60);
        // Unspecified sections keep defaults
        assert_eq!(config.ingest.port, 8787);
        assert_eq!(config.advisory.tool_cooldown_s, 30);
    }

    #[test]
    fn test_load_from_missing_file_gives_defaults() {
        let config = Config::load_from_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_invalid_toml_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not toml [[[").unwrap();

        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_overrides() {
        env::set_var("KAITD_PORT", "9999");
        env::set_var("KAIT_LITE", "1");
        env::set_var("KAIT_EMBEDDINGS", "0");
        env::set_var("KAIT_ADVISORY_AGREEMENT_GATE", "true");
        env::set_var("KAIT_ADVISORY_MIN_SOURCES", "3");
        env::set_var("KAIT_PIPELINE_LOW_KEEP_RATE", "0.5");
        env::set_var("KAIT_MEMORY_PATCH_MAX_CHARS", "900");
        env::set_var("KAIT_MEMORY_PATCH_MIN_CHARS", "10");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.ingest.port, 9999);
        assert!(config.lite);
        assert!(!config.advisory.embeddings);
        assert!(config.advisory.agreement_gate);
        assert_eq!(config.advisory.min_sources, 3);
        assert!((config.pipeline.low_keep_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.memory.patch_max_chars, 900);
        assert_eq!(config.memory.patch_min_chars, 10);

        for key in [
            "KAITD_PORT",
            "KAIT_LITE",
            "KAIT_EMBEDDINGS",
            "KAIT_ADVISORY_AGREEMENT_GATE",
            "KAIT_ADVISORY_MIN_SOURCES",
            "KAIT_PIPELINE_LOW_KEEP_RATE",
            "KAIT_MEMORY_PATCH_MAX_CHARS",
            "KAIT_MEMORY_PATCH_MIN_CHARS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_env_beats_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[ingest]\nport = 9000\n",
        )
        .unwrap();

        env::set_var("KAITD_PORT", "9001");
        let config = Config::load(dir.path());
        env::remove_var("KAITD_PORT");

        assert_eq!(config.ingest.port, 9001);
    }

    #[test]
    #[serial]
    fn test_data_root_env_override() {
        let dir = TempDir::new().unwrap();
        env::set_var("DATA_ROOT", dir.path().to_str().unwrap());

        assert_eq!(data_root().unwrap(), dir.path());

        env::remove_var("DATA_ROOT");
        let fallback = data_root();
        assert!(fallback.is_some());
        assert!(fallback.unwrap().ends_with(".kait"));
    }

    #[test]
    fn test_path_helpers() {
        let root = Path::new("/data/kait");

        assert_eq!(queue_path(root), PathBuf::from("/data/kait/queue/events.jsonl"));
        assert_eq!(
            queue_overflow_path(root),
            PathBuf::from("/data/kait/queue/events.overflow.jsonl")
        );
        assert_eq!(
            queue_state_path(root),
            PathBuf::from("/data/kait/queue/state.json")
        );
        assert_eq!(
            cognitive_snapshot_path(root),
            PathBuf::from("/data/kait/cognitive_insights.json")
        );
        assert_eq!(eidos_db_path(root), PathBuf::from("/data/kait/eidos.db"));
        assert_eq!(
            implicit_feedback_path(root),
            PathBuf::from("/data/kait/advisor/implicit_feedback.jsonl")
        );
        assert_eq!(
            heartbeat_path(root, "pipeline"),
            PathBuf::from("/data/kait/pipeline.heartbeat.json")
        );
        assert_eq!(token_path(root), PathBuf::from("/data/kait/kaitd.token"));
    }

    #[test]
    fn test_full_toml_roundtrip() {
        let mut config = Config::default();
        config.advisory.max_emit = 4;
        config.eidos.min_steps = 7;
        config.promotion.guidance_dir = Some(PathBuf::from("/tmp/guides"));

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }
}
