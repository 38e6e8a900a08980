//! SQLite-backed EIDOS store.
//!
//! Tables: `episodes`, `steps`, `distillations`. The store is single-writer;
//! the connection is opened with WAL and a busy timeout so status readers in
//! other processes do not error out.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::EidosConfig;
use crate::error::{KaitError, Result};
use crate::event::{Event, EventKind};
use crate::util;

use super::{
    ActionKind, Distillation, DistillationType, Episode, EpisodeOutcome, EpisodePhase, Evaluation,
    Step, GOAL_MAX_CHARS,
};

/// A state transition produced by feeding an event to the store.
///
/// Effects are what the pipeline publishes on the bus; the store itself has
/// no bus reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EidosEffect {
    /// A new episode opened for a session.
    EpisodeStarted { episode_id: String, session_id: String },
    /// A step opened under the active episode.
    StepOpened { step_id: String, session_id: String },
    /// A step reached a terminal state.
    StepSealed {
        step_id: String,
        session_id: String,
        evaluation: Evaluation,
        abandoned: bool,
    },
    /// An episode closed.
    EpisodeClosed {
        episode_id: String,
        session_id: String,
        outcome: EpisodeOutcome,
    },
}

/// The episodic store.
#[derive(Debug)]
pub struct EidosStore {
    conn: Connection,
    cfg: EidosConfig,
}

impl EidosStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>, cfg: &EidosConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KaitError::storage(parent, e))?;
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn, cfg)
    }

    /// Open an in-memory store for tests.
    pub fn open_in_memory(cfg: &EidosConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, cfg)
    }

    fn with_connection(conn: Connection, cfg: &EidosConfig) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        init_schema(&conn)?;

        let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
        if integrity != "ok" {
            return Err(KaitError::invariant(format!(
                "eidos database integrity check failed: {}",
                integrity
            )));
        }

        Ok(Self {
            conn,
            cfg: cfg.clone(),
        })
    }

    /// Feed one event through the episode/step state machine.
    pub fn observe(&self, event: &Event) -> Result<Vec<EidosEffect>> {
        let mut effects = Vec::new();

        match event.kind {
            EventKind::PreTool => {
                self.ensure_episode(event, None, &mut effects)?;
                // Opening a step while one is still open force-seals the
                // stale one; at most one step per session is ever open.
                if let Some(open) = self.open_step(&event.session_id)? {
                    self.force_seal(&open, event.ts_ns, &mut effects)?;
                }
                let tool = event.tool.clone().unwrap_or_else(|| "unknown".to_string());
                let step_id = util::next_id("stp");
                let episode = self
                    .active_episode(&event.session_id)?
                    .ok_or_else(|| KaitError::invariant("step opened with no active episode"))?;
                let decision = format!("{}: {}", tool, event.arg_head());
                let prediction = format!("{} likely succeeds", tool);
                self.conn.execute(
                    "INSERT INTO steps (step_id, episode_id, session_id, decision, action_kind, \
                     prediction, tool, outcome, evaluation, opened_ns, sealed_ns) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, '?', ?8, NULL)",
                    params![
                        step_id,
                        episode.episode_id,
                        event.session_id,
                        decision,
                        ActionKind::ToolCall.as_str(),
                        prediction,
                        tool,
                        event.ts_ns
                    ],
                )?;
                self.touch_episode(&episode.episode_id, event.ts_ns)?;
                effects.push(EidosEffect::StepOpened {
                    step_id,
                    session_id: event.session_id.clone(),
                });
            }

            EventKind::PostTool | EventKind::PostToolFailure => {
                self.ensure_episode(event, None, &mut effects)?;
                if let Some(open) = self.open_step(&event.session_id)? {
                    let (outcome, evaluation) = if event.kind == EventKind::PostTool {
                        ("success", Evaluation::Passed)
                    } else {
                        ("failure", Evaluation::Failed)
                    };
                    self.seal_step(&open.step_id, outcome, evaluation, event.ts_ns)?;
                    self.bump_step_count(&open.episode_id, event.ts_ns)?;
                    effects.push(EidosEffect::StepSealed {
                        step_id: open.step_id,
                        session_id: event.session_id.clone(),
                        evaluation,
                        abandoned: false,
                    });
                } else {
                    tracing::debug!(
                        session = %event.session_id,
                        "outcome event with no open step"
                    );
                }
            }

            EventKind::UserPrompt => {
                let goal = event
                    .text
                    .as_deref()
                    .map(|t| t.chars().take(GOAL_MAX_CHARS).collect::<String>());
                self.ensure_episode(event, goal, &mut effects)?;
                // A step left open past its timeout is abandoned, not
                // silently inherited by the next tool call.
                if let Some(open) = self.open_step(&event.session_id)? {
                    let age_s = (event.ts_ns - open.opened_ns) / 1_000_000_000;
                    if age_s >= self.cfg.step_timeout_s as i64 {
                        self.force_seal(&open, event.ts_ns, &mut effects)?;
                    }
                }
            }
        }

        Ok(effects)
    }

    /// The session's active episode, if any.
    pub fn active_episode(&self, session_id: &str) -> Result<Option<Episode>> {
        self.conn
            .query_row(
                "SELECT episode_id, session_id, goal, phase, outcome, started_ns, ended_ns, \
                 step_count FROM episodes WHERE session_id = ?1 AND outcome = 'active'",
                params![session_id],
                row_to_episode,
            )
            .optional()
            .map_err(Into::into)
    }

    /// The session's open step, if any.
    pub fn open_step(&self, session_id: &str) -> Result<Option<Step>> {
        self.conn
            .query_row(
                "SELECT step_id, episode_id, session_id, decision, action_kind, prediction, \
                 tool, outcome, evaluation, opened_ns, sealed_ns \
                 FROM steps WHERE session_id = ?1 AND sealed_ns IS NULL",
                params![session_id],
                row_to_step,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch an episode by id.
    pub fn episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        self.conn
            .query_row(
                "SELECT episode_id, session_id, goal, phase, outcome, started_ns, ended_ns, \
                 step_count FROM episodes WHERE episode_id = ?1",
                params![episode_id],
                row_to_episode,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Sealed steps belonging to an episode, in open order.
    pub fn sealed_steps(&self, episode_id: &str) -> Result<Vec<Step>> {
        let mut stmt = self.conn.prepare(
            "SELECT step_id, episode_id, session_id, decision, action_kind, prediction, \
             tool, outcome, evaluation, opened_ns, sealed_ns \
             FROM steps WHERE episode_id = ?1 AND sealed_ns IS NOT NULL ORDER BY opened_ns",
        )?;
        let rows = stmt.query_map(params![episode_id], row_to_step)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Close episodes for sessions idle past the session timeout.
    ///
    /// Open steps are force-sealed as abandoned; each closed episode moves
    /// to phase `consolidate` with an outcome derived from its steps.
    pub fn close_idle_sessions(&self, now_ns: i64) -> Result<Vec<EidosEffect>> {
        let cutoff = now_ns - (self.cfg.session_timeout_s as i64) * 1_000_000_000;
        let idle: Vec<Episode> = {
            let mut stmt = self.conn.prepare(
                "SELECT episode_id, session_id, goal, phase, outcome, started_ns, ended_ns, \
                 step_count FROM episodes WHERE outcome = 'active' AND last_ns < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], row_to_episode)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut effects = Vec::new();
        for episode in idle {
            effects.extend(self.close_episode(&episode.episode_id, now_ns)?);
        }
        Ok(effects)
    }

    /// Close one episode immediately (session end).
    pub fn close_episode(&self, episode_id: &str, now_ns: i64) -> Result<Vec<EidosEffect>> {
        let mut effects = Vec::new();
        let Some(episode) = self.episode(episode_id)? else {
            return Err(KaitError::invariant(format!(
                "close of unknown episode {}",
                episode_id
            )));
        };
        if episode.outcome != EpisodeOutcome::Active {
            return Ok(effects);
        }

        if let Some(open) = self.open_step(&episode.session_id)? {
            if open.episode_id == episode.episode_id {
                self.force_seal(&open, now_ns, &mut effects)?;
            }
        }

        let steps = self.sealed_steps(episode_id)?;
        let passed = steps
            .iter()
            .filter(|s| s.evaluation == Evaluation::Passed)
            .count();
        let failed = steps
            .iter()
            .filter(|s| s.evaluation == Evaluation::Failed)
            .count();
        let outcome = if passed > failed && passed > 0 {
            EpisodeOutcome::Success
        } else if failed >= passed && failed > 0 {
            EpisodeOutcome::Failure
        } else {
            EpisodeOutcome::Abandoned
        };

        self.conn.execute(
            "UPDATE episodes SET outcome = ?1, phase = ?2, ended_ns = ?3, step_count = ?4 \
             WHERE episode_id = ?5",
            params![
                outcome.as_str(),
                EpisodePhase::Consolidate.as_str(),
                now_ns,
                steps.len() as i64,
                episode_id
            ],
        )?;

        effects.push(EidosEffect::EpisodeClosed {
            episode_id: episode_id.to_string(),
            session_id: episode.session_id,
            outcome,
        });
        Ok(effects)
    }

    /// Insert a distillation.
    pub fn insert_distillation(&self, d: &Distillation) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO distillations (distillation_id, dtype, statement, \
             confidence, validation_count, contradiction_count, times_retrieved, times_used, \
             times_helped, source_step_ids, domains, triggers, created_at_s) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                d.distillation_id,
                d.dtype.as_str(),
                d.statement,
                d.confidence,
                d.validation_count,
                d.contradiction_count,
                d.times_retrieved,
                d.times_used,
                d.times_helped,
                serde_json::to_string(&d.source_step_ids)?,
                serde_json::to_string(&d.domains)?,
                serde_json::to_string(&d.triggers)?,
                d.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// All distillations, newest first.
    pub fn list_distillations(&self) -> Result<Vec<Distillation>> {
        let mut stmt = self.conn.prepare(
            "SELECT distillation_id, dtype, statement, confidence, validation_count, \
             contradiction_count, times_retrieved, times_used, times_helped, source_step_ids, \
             domains, triggers, created_at_s FROM distillations ORDER BY created_at_s DESC",
        )?;
        let rows = stmt.query_map([], row_to_distillation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Distillations whose triggers intersect the given terms, best first.
    ///
    /// Bumps `times_retrieved` on everything returned.
    pub fn find_by_triggers(&self, terms: &[String], k: usize) -> Result<Vec<Distillation>> {
        let lower: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let mut matched: Vec<(usize, Distillation)> = self
            .list_distillations()?
            .into_iter()
            .filter_map(|d| {
                let hits = d
                    .triggers
                    .iter()
                    .filter(|t| lower.iter().any(|q| t.contains(q.as_str()) || q.contains(t.as_str())))
                    .count();
                if hits > 0 {
                    Some((hits, d))
                } else {
                    None
                }
            })
            .collect();

        matched.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.confidence.partial_cmp(&a.1.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });
        matched.truncate(k);

        for (_, d) in &matched {
            self.conn.execute(
                "UPDATE distillations SET times_retrieved = times_retrieved + 1 \
                 WHERE distillation_id = ?1",
                params![d.distillation_id],
            )?;
        }

        Ok(matched.into_iter().map(|(_, d)| d).collect())
    }

    /// Record that a distillation was included in emitted advice.
    pub fn bump_used(&self, distillation_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE distillations SET times_used = times_used + 1 WHERE distillation_id = ?1",
            params![distillation_id],
        )?;
        Ok(())
    }

    /// Record implicit feedback on a distillation.
    pub fn reinforce(&self, distillation_id: &str, helped: bool) -> Result<()> {
        let sql = if helped {
            "UPDATE distillations SET times_helped = times_helped + 1, \
             validation_count = validation_count + 1, \
             confidence = MIN(1.0, confidence + 0.02) WHERE distillation_id = ?1"
        } else {
            "UPDATE distillations SET contradiction_count = contradiction_count + 1, \
             confidence = MAX(0.0, confidence - 0.05) WHERE distillation_id = ?1"
        };
        self.conn.execute(sql, params![distillation_id])?;
        Ok(())
    }

    /// Decay confidences that have not been reinforced since `cutoff`.
    pub fn decay_confidences(&self, factor: f64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE distillations SET confidence = confidence * ?1 WHERE validation_count = 0",
            params![factor],
        )?;
        Ok(changed)
    }

    /// Count of open steps for a session. Property tests assert ≤ 1.
    pub fn open_step_count(&self, session_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM steps WHERE session_id = ?1 AND sealed_ns IS NULL",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    fn ensure_episode(
        &self,
        event: &Event,
        goal: Option<String>,
        effects: &mut Vec<EidosEffect>,
    ) -> Result<Episode> {
        if let Some(existing) = self.active_episode(&event.session_id)? {
            if existing.goal.is_none() {
                if let Some(goal) = goal {
                    self.conn.execute(
                        "UPDATE episodes SET goal = ?1 WHERE episode_id = ?2",
                        params![goal, existing.episode_id],
                    )?;
                }
            }
            self.touch_episode(&existing.episode_id, event.ts_ns)?;
            return Ok(self
                .active_episode(&event.session_id)?
                .expect("episode touched above"));
        }

        let episode_id = util::next_id("epi");
        self.conn.execute(
            "INSERT INTO episodes (episode_id, session_id, goal, phase, outcome, started_ns, \
             ended_ns, step_count, last_ns) VALUES (?1, ?2, ?3, 'explore', 'active', ?4, NULL, 0, ?4)",
            params![episode_id, event.session_id, goal, event.ts_ns],
        )?;
        effects.push(EidosEffect::EpisodeStarted {
            episode_id: episode_id.clone(),
            session_id: event.session_id.clone(),
        });
        Ok(self
            .active_episode(&event.session_id)?
            .expect("episode inserted above"))
    }

    fn seal_step(
        &self,
        step_id: &str,
        outcome: &str,
        evaluation: Evaluation,
        ts_ns: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE steps SET outcome = ?1, evaluation = ?2, sealed_ns = ?3 WHERE step_id = ?4",
            params![outcome, evaluation.as_str(), ts_ns, step_id],
        )?;
        Ok(())
    }

    fn force_seal(&self, step: &Step, ts_ns: i64, effects: &mut Vec<EidosEffect>) -> Result<()> {
        self.seal_step(&step.step_id, "abandoned", Evaluation::Open, ts_ns)?;
        self.bump_step_count(&step.episode_id, ts_ns)?;
        effects.push(EidosEffect::StepSealed {
            step_id: step.step_id.clone(),
            session_id: step.session_id.clone(),
            evaluation: Evaluation::Open,
            abandoned: true,
        });
        Ok(())
    }

    fn bump_step_count(&self, episode_id: &str, ts_ns: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET step_count = step_count + 1, last_ns = ?1, \
             phase = CASE WHEN phase = 'explore' THEN 'execute' ELSE phase END \
             WHERE episode_id = ?2",
            params![ts_ns, episode_id],
        )?;
        Ok(())
    }

    fn touch_episode(&self, episode_id: &str, ts_ns: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET last_ns = MAX(last_ns, ?1) WHERE episode_id = ?2",
            params![ts_ns, episode_id],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            episode_id  TEXT PRIMARY KEY,
            session_id  TEXT NOT NULL,
            goal        TEXT,
            phase       TEXT NOT NULL,
            outcome     TEXT NOT NULL,
            started_ns  INTEGER NOT NULL,
            ended_ns    INTEGER,
            step_count  INTEGER NOT NULL DEFAULT 0,
            last_ns     INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_session ON episodes(session_id, outcome);

        CREATE TABLE IF NOT EXISTS steps (
            step_id     TEXT PRIMARY KEY,
            episode_id  TEXT NOT NULL REFERENCES episodes(episode_id),
            session_id  TEXT NOT NULL,
            decision    TEXT NOT NULL,
            action_kind TEXT NOT NULL,
            prediction  TEXT NOT NULL,
            tool        TEXT,
            outcome     TEXT,
            evaluation  TEXT NOT NULL DEFAULT '?',
            opened_ns   INTEGER NOT NULL,
            sealed_ns   INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_steps_session_open ON steps(session_id, sealed_ns);
        CREATE INDEX IF NOT EXISTS idx_steps_episode ON steps(episode_id);

        CREATE TABLE IF NOT EXISTS distillations (
            distillation_id     TEXT PRIMARY KEY,
            dtype               TEXT NOT NULL,
            statement           TEXT NOT NULL,
            confidence          REAL NOT NULL,
            validation_count    INTEGER NOT NULL DEFAULT 0,
            contradiction_count INTEGER NOT NULL DEFAULT 0,
            times_retrieved     INTEGER NOT NULL DEFAULT 0,
            times_used          INTEGER NOT NULL DEFAULT 0,
            times_helped        INTEGER NOT NULL DEFAULT 0,
            source_step_ids     TEXT NOT NULL,
            domains             TEXT NOT NULL,
            triggers            TEXT NOT NULL,
            created_at_s        INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn row_to_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let phase: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    Ok(Episode {
        episode_id: row.get(0)?,
        session_id: row.get(1)?,
        goal: row.get(2)?,
        phase: EpisodePhase::parse(&phase).unwrap_or(EpisodePhase::Explore),
        outcome: EpisodeOutcome::parse(&outcome).unwrap_or(EpisodeOutcome::Active),
        started_ns: row.get(5)?,
        ended_ns: row.get(6)?,
        step_count: row.get(7)?,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<Step> {
    let action_kind: String = row.get(4)?;
    let evaluation: String = row.get(8)?;
    Ok(Step {
        step_id: row.get(0)?,
        episode_id: row.get(1)?,
        session_id: row.get(2)?,
        decision: row.get(3)?,
        action_kind: ActionKind::parse(&action_kind).unwrap_or(ActionKind::ToolCall),
        prediction: row.get(5)?,
        tool: row.get(6)?,
        outcome: row.get(7)?,
        evaluation: Evaluation::parse(&evaluation).unwrap_or(Evaluation::Open),
        opened_ns: row.get(9)?,
        sealed_ns: row.get(10)?,
    })
}

fn row_to_distillation(row: &Row<'_>) -> rusqlite::Result<Distillation> {
    let dtype: String = row.get(1)?;
    let source_step_ids: String = row.get(9)?;
    let domains: String = row.get(10)?;
    let triggers: String = row.get(11)?;
    let created_at_s: i64 = row.get(12)?;
    Ok(Distillation {
        distillation_id: row.get(0)?,
        dtype: DistillationType::parse(&dtype).unwrap_or(DistillationType::Heuristic),
        statement: row.get(2)?,
        confidence: row.get(3)?,
        validation_count: row.get(4)?,
        contradiction_count: row.get(5)?,
        times_retrieved: row.get(6)?,
        times_used: row.get(7)?,
        times_helped: row.get(8)?,
        source_step_ids: serde_json::from_str(&source_step_ids).unwrap_or_default(),
        domains: serde_json::from_str(&domains).unwrap_or_default(),
        triggers: serde_json::from_str(&triggers).unwrap_or_default(),
        created_at: datetime_from_secs(created_at_s),
    })
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
