//! The process-wide runtime.
//!
//! Process state is a single `Runtime` value owning one handle per store;
//! components receive the handles they need at construction rather than
//! reaching for globals. The daemon composes the ingest server, pipeline
//! scheduler, and promotion loop on top of it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;

use crate::advisory::{AdviceItem, AdviceProvider, AdviceRequest, Advisor, PacketCache};
use crate::bus::{BusEvent, EventBus};
use crate::cognitive::CognitiveStore;
use crate::config::{self, Config};
use crate::eidos::{Aggregator, EidosStore};
use crate::error::{KaitError, Result};
use crate::feedback::FeedbackMatcher;
use crate::heartbeat::HeartbeatRegistry;
use crate::ingest::{self, IngestState};
use crate::memory::MemoryCapture;
use crate::pipeline::Pipeline;
use crate::promotion::PromotionLoop;
use crate::queue::EventQueue;
use crate::ralph::MetaRalph;

/// The capability bundle owning one handle per store.
pub struct Runtime {
    /// Resolved data root.
    pub data_root: PathBuf,
    /// Loaded configuration.
    pub config: Config,
    /// The event queue.
    pub queue: Arc<EventQueue>,
    /// The cognitive store.
    pub cognitive: Arc<RwLock<CognitiveStore>>,
    /// The EIDOS store.
    pub eidos: Arc<Mutex<EidosStore>>,
    /// The advisory engine.
    pub advisor: Arc<Advisor>,
    /// The feedback matcher.
    pub feedback: Arc<Mutex<FeedbackMatcher>>,
    /// The event bus.
    pub bus: Arc<EventBus>,
    /// Heartbeat registry shared by all workers.
    pub heartbeats: Arc<HeartbeatRegistry>,
    /// Bearer token for the HTTP surface.
    pub token: String,
}

impl Runtime {
    /// Open every store and assemble the runtime.
    ///
    /// Fatal conditions surface as errors: an unwritable data root, an
    /// unreadable token file, or a store whose schema cannot be loaded.
    pub fn bootstrap(data_root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let data_root = data_root.into();
        ensure_writable(&data_root)?;
        std::fs::create_dir_all(config::advisor_dir(&data_root))
            .map_err(|e| KaitError::storage(config::advisor_dir(&data_root), e))?;

        let token = ingest::resolve_token(&data_root)?;

        let queue = Arc::new(EventQueue::open(&data_root, &config.queue)?);
        let cognitive = Arc::new(RwLock::new(CognitiveStore::open(
            config::cognitive_snapshot_path(&data_root),
            &config.cognitive,
        )?));
        let eidos = Arc::new(Mutex::new(EidosStore::open(
            config::eidos_db_path(&data_root),
            &config.eidos,
        )?));
        let feedback = Arc::new(Mutex::new(FeedbackMatcher::new(
            config.feedback.clone(),
            config::implicit_feedback_path(&data_root),
        )));

        let advisor = Arc::new(Advisor::new(
            config.advisory.clone(),
            Arc::clone(&cognitive),
            Arc::clone(&eidos),
            PacketCache::with_path(config::packets_path(&data_root)),
            config::decision_ledger_path(&data_root),
            config::advice_log_path(&data_root),
        ));
        advisor.refresh(&[])?;

        let heartbeats = Arc::new(HeartbeatRegistry::new(
            &data_root,
            config.ingest.heartbeat_interval_s,
        ));

        Ok(Self {
            data_root,
            config,
            queue,
            cognitive,
            eidos,
            advisor,
            feedback,
            bus: Arc::new(EventBus::new()),
            heartbeats,
            token,
        })
    }

    /// Build the pipeline scheduler over this runtime's stores.
    pub fn build_pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.config.pipeline.clone(),
            Arc::clone(&self.queue),
            MemoryCapture::new(self.config.memory.clone()),
            MetaRalph::new(
                self.config.ralph.clone(),
                config::roast_history_path(&self.data_root),
            ),
            Arc::clone(&self.cognitive),
            Arc::clone(&self.eidos),
            Aggregator::new(self.config.eidos.clone()),
            Arc::clone(&self.feedback),
            Some(Arc::clone(&self.advisor)),
            Arc::clone(&self.bus),
            config::pipeline_stats_path(&self.data_root),
            config::pipeline_state_path(&self.data_root),
        )
    }

    /// Build the promotion loop over this runtime's stores.
    pub fn build_promotion(&self) -> PromotionLoop {
        PromotionLoop::new(
            self.config.promotion.clone(),
            &self.data_root,
            config::promotion_log_path(&self.data_root),
        )
    }

    /// The advice provider the daemon serves: advisory plus exposure
    /// recording and bus publication.
    pub fn advice_provider(&self) -> Arc<dyn AdviceProvider> {
        Arc::new(RuntimeAdvisor {
            advisor: Arc::clone(&self.advisor),
            feedback: Arc::clone(&self.feedback),
            bus: Arc::clone(&self.bus),
        })
    }

    /// Run the daemon until interrupted.
    ///
    /// Spawns the ingest server, the pipeline scheduler, and (outside lite
    /// mode) the promotion loop. Blocks the calling thread.
    pub fn run_daemon(self: Arc<Self>, listener: std::net::TcpListener) -> Result<()> {
        let tokio_runtime = tokio::runtime::Runtime::new()
            .map_err(|e| KaitError::config(format!("failed to start async runtime: {}", e)))?;
        let shutdown = Arc::new(AtomicBool::new(false));

        tokio_runtime.block_on(async {
            listener
                .set_nonblocking(true)
                .map_err(|e| KaitError::storage("listener", e))?;
            let listener = tokio::net::TcpListener::from_std(listener)
                .map_err(|e| KaitError::storage("listener", e))?;

            let state = Arc::new(IngestState::new(
                Arc::clone(&self.queue),
                self.config.ingest.clone(),
                &self.config.pipeline,
                self.token.clone(),
                &self.data_root,
                Some(self.advice_provider()),
                Arc::clone(&self.heartbeats),
            ));

            let server = tokio::spawn(ingest::serve(state, listener));
            let pipeline_task = self.spawn_pipeline(Arc::clone(&shutdown));
            let promotion_task = if self.config.lite {
                None
            } else {
                Some(self.spawn_promotion(Arc::clone(&shutdown)))
            };
            let reload_task = self.spawn_config_reload();

            tracing::info!(
                port = self.config.ingest.port,
                lite = self.config.lite,
                "kaitd running"
            );

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| KaitError::storage("signal", e))?;
            tracing::info!("shutting down");

            shutdown.store(true, Ordering::SeqCst);
            server.abort();
            if let Some(task) = reload_task {
                task.abort();
            }
            pipeline_task.await.ok();
            if let Some(task) = promotion_task {
                task.await.ok();
            }
            Ok(())
        })
    }

    fn spawn_pipeline(&self, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let mut pipeline = self.build_pipeline();
        let heartbeats = Arc::clone(&self.heartbeats);
        let interval = Duration::from_millis(self.config.pipeline.cycle_interval_ms);

        tokio::task::spawn_blocking(move || {
            while !shutdown.load(Ordering::SeqCst) {
                heartbeats.beat("pipeline");
                heartbeats.beat("advisory");
                match pipeline.cycle() {
                    Ok(stats) => {
                        if stats.events_processed > 0 {
                            tracing::debug!(
                                events = stats.events_processed,
                                insights = stats.insights_created,
                                "cycle complete"
                            );
                        }
                    }
                    // The offset was not advanced; the next cycle retries
                    Err(err) => tracing::error!("pipeline cycle failed: {}", err),
                }
                std::thread::sleep(interval);
            }
        })
    }

    /// Reload the advisory config section on SIGHUP.
    ///
    /// The writer publishes the updated snapshot atomically; other sections
    /// keep their startup values until restart.
    #[cfg(unix)]
    fn spawn_config_reload(&self) -> Option<tokio::task::JoinHandle<()>> {
        let data_root = self.data_root.clone();
        let advisor = Arc::clone(&self.advisor);

        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!("SIGHUP handler unavailable, reload disabled: {}", err);
                return None;
            }
        };

        Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                let config = Config::load(&data_root);
                advisor.update_config(config.advisory);
                tracing::info!("advisory config reloaded");
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_config_reload(&self) -> Option<tokio::task::JoinHandle<()>> {
        None
    }

    fn spawn_promotion(&self, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let mut promotion = self.build_promotion();
        let cognitive = Arc::clone(&self.cognitive);
        let heartbeats = Arc::clone(&self.heartbeats);

        tokio::task::spawn_blocking(move || {
            while !shutdown.load(Ordering::SeqCst) {
                heartbeats.beat("promotion");
                let result = cognitive
                    .write()
                    .map_err(|_| KaitError::store("cognitive lock poisoned"))
                    .and_then(|mut store| promotion.tick(&mut store, Utc::now()));
                if let Err(err) = result {
                    tracing::warn!("promotion pass failed: {}", err);
                }
                // The tick throttles itself; this just bounds wakeups
                for _ in 0..60 {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
    }
}

/// The provider served over `/advise`: emission plus bookkeeping.
struct RuntimeAdvisor {
    advisor: Arc<Advisor>,
    feedback: Arc<Mutex<FeedbackMatcher>>,
    bus: Arc<EventBus>,
}

impl AdviceProvider for RuntimeAdvisor {
    fn advise_for(&self, req: &AdviceRequest) -> Vec<AdviceItem> {
        let items = self.advisor.advise(req);
        if items.is_empty() {
            return items;
        }

        if let Ok(mut feedback) = self.feedback.lock() {
            feedback.record_exposures(req, &items);
        }
        self.bus.publish(BusEvent::AdviceEmitted {
            session_id: req.session_id.clone(),
            tool: req.tool.clone(),
            advice_ids: items.iter().map(|i| i.advice_id.clone()).collect(),
        });
        items
    }
}

/// Verify the data root exists and is writable.
fn ensure_writable(data_root: &Path) -> Result<()> {
    std::fs::create_dir_all(data_root).map_err(|e| KaitError::storage(data_root, e))?;
    let probe = data_root.join(".write_probe");
    std::fs::write(&probe, b"ok").map_err(|e| KaitError::storage(data_root, e))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind, QueueEntry};
    use serial_test::serial;
    use tempfile::TempDir;

    fn runtime(dir: &TempDir) -> Arc<Runtime> {
        Arc::new(Runtime::bootstrap(dir.path(), Config::default()).unwrap())
    }

    #[test]
    #[serial]
    fn test_bootstrap_creates_layout() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");
        let rt = runtime(&dir);

        assert!(dir.path().join("queue").exists());
        assert!(dir.path().join("advisor").exists());
        assert!(dir.path().join("kaitd.token").exists());
        assert_eq!(rt.token.len(), 32);
    }

    #[test]
    #[serial]
    fn test_bootstrap_twice_reuses_state() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");
        let first = Runtime::bootstrap(dir.path(), Config::default())
            .unwrap()
            .token
            .clone();
        let second = Runtime::bootstrap(dir.path(), Config::default())
            .unwrap()
            .token
            .clone();
        assert_eq!(first, second);
    }

    #[test]
    #[serial]
    fn test_pipeline_from_runtime_processes_queue() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");
        let rt = runtime(&dir);

        let mut event = Event::new("s1", EventKind::UserPrompt).with_text(
            "Always verify the lockfile exists before running install because missing \
             lockfiles caused broken builds",
        );
        event.importance = 0.95;
        rt.queue.append(&QueueEntry::for_event(event)).unwrap();

        let mut pipeline = rt.build_pipeline();
        let stats = pipeline.cycle().unwrap();
        assert_eq!(stats.events_processed, 1);
        assert_eq!(rt.cognitive.read().unwrap().len(), 1);
    }

    #[test]
    #[serial]
    fn test_advice_provider_records_exposures() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("KAITD_TOKEN");
        let rt = runtime(&dir);

        // Seed a strong insight directly
        {
            let mut insight = crate::cognitive::Insight::new(
                crate::cognitive::InsightCategory::Wisdom,
                "File exists at expected path often wrong; use Glob first",
                "test",
            );
            for i in 0..100 {
                insight.validate(&format!("e{}", i), Utc::now(), 14 * 86_400);
            }
            rt.cognitive.write().unwrap().upsert(insight).unwrap();
        }
        rt.advisor.refresh(&[]).unwrap();

        let rx = rt.bus.subscribe();
        let provider = rt.advice_provider();
        let req = AdviceRequest::new("s1", "Read", serde_json::json!({"path": "missing.py"}));
        let items = provider.advise_for(&req);

        assert_eq!(items.len(), 1);
        assert_eq!(rt.feedback.lock().unwrap().pending_count(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::AdviceEmitted { .. }
        ));
    }
}
