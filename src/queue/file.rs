//! File-backed queue implementation.
//!
//! Layout under `<data_root>/queue/`:
//! - `events.jsonl` — primary append target
//! - `events.jsonl.<seq>` — rotated segments awaiting consumption
//! - `events.overflow.jsonl` — sidecar used when the primary is unavailable
//! - `state.json` — committed read position, rewritten via temp + rename
//!
//! A crash between processing a batch and committing its offset re-delivers
//! the same events; consumers must be idempotent keyed by `event_id`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{queue_dir, queue_overflow_path, queue_path, queue_state_path, QueueConfig};
use crate::error::{KaitError, Result};
use crate::event::QueueEntry;
use crate::util;

/// Name of the primary queue file within the queue directory.
const PRIMARY_NAME: &str = "events.jsonl";

/// Append retry attempts before falling back to the overflow sidecar.
const APPEND_RETRIES: u32 = 3;

/// Committed read position, persisted as `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueState {
    /// File currently being read (`events.jsonl` or a rotated segment).
    pub read_file: String,
    /// Byte offset of the first unconsumed record in `read_file`.
    pub committed_offset: u64,
    /// Sequence number of the most recent rotation.
    pub write_seq: u64,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            read_file: PRIMARY_NAME.to_string(),
            committed_offset: 0,
            write_seq: 0,
        }
    }
}

/// Read position produced by [`EventQueue::read_batch`], to be committed
/// only after the batch has been fully processed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCursor {
    /// File the batch was read from.
    pub read_file: String,
    /// Byte offset just past the last consumed record.
    pub offset: u64,
    /// Whether a rotated segment was consumed to completion.
    pub file_done: bool,
}

/// One batch of entries plus the cursor that commits it.
#[derive(Debug)]
pub struct ReadBatch {
    /// Parsed entries, in file order.
    pub entries: Vec<QueueEntry>,
    /// Position to commit after processing.
    pub cursor: QueueCursor,
    /// Malformed lines skipped while reading.
    pub skipped: usize,
}

/// The append-only event queue.
#[derive(Debug)]
pub struct EventQueue {
    dir: PathBuf,
    primary: PathBuf,
    overflow: PathBuf,
    state_path: PathBuf,
    rotate_bytes: u64,
}

impl EventQueue {
    /// Open (or create) the queue under the given data root.
    pub fn open(data_root: &Path, cfg: &QueueConfig) -> Result<Self> {
        let dir = queue_dir(data_root);
        fs::create_dir_all(&dir).map_err(|e| KaitError::storage(&dir, e))?;

        let queue = Self {
            primary: queue_path(data_root),
            overflow: queue_overflow_path(data_root),
            state_path: queue_state_path(data_root),
            dir,
            rotate_bytes: cfg.rotate_bytes,
        };

        if !queue.state_path.exists() {
            queue.save_state(&QueueState::default())?;
        }

        Ok(queue)
    }

    /// Append an entry, retrying with jitter and falling back to the
    /// overflow sidecar so ingest never blocks on pipeline progress.
    pub fn append(&self, entry: &QueueEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;

        let mut last_err = None;
        for attempt in 0..APPEND_RETRIES {
            match util::append_line(&self.primary, &line) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, "queue append failed: {}", err);
                    last_err = Some(err);
                    let jitter_ms = rand::thread_rng().gen_range(5..50) * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(jitter_ms));
                }
            }
        }

        match util::append_line(&self.overflow, &line) {
            Ok(()) => {
                tracing::warn!("queue append diverted to overflow sidecar");
                Ok(())
            }
            Err(_) => Err(last_err.unwrap_or_else(|| KaitError::store("queue append failed"))),
        }
    }

    /// Read up to `max` entries from the committed position.
    ///
    /// Rotated segments are drained before the primary. The returned cursor
    /// must be passed to [`commit`](Self::commit) once the batch has been
    /// processed; until then the read position does not advance.
    pub fn read_batch(&self, max: usize) -> Result<ReadBatch> {
        let state = self.load_state()?;
        let read_path = self.dir.join(&state.read_file);

        // A missing read target (e.g. segment deleted out from under us)
        // falls through to the next file in the chain.
        if !read_path.exists() {
            let next = self.next_read_file(Some(&state.read_file));
            if next != state.read_file {
                self.save_state(&QueueState {
                    read_file: next,
                    committed_offset: 0,
                    write_seq: state.write_seq,
                })?;
            }
            return Ok(ReadBatch {
                entries: Vec::new(),
                cursor: QueueCursor {
                    read_file: state.read_file,
                    offset: state.committed_offset,
                    file_done: false,
                },
                skipped: 0,
            });
        }

        let mut file = File::open(&read_path).map_err(|e| KaitError::storage(&read_path, e))?;
        file.seek(SeekFrom::Start(state.committed_offset))
            .map_err(|e| KaitError::storage(&read_path, e))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| KaitError::storage(&read_path, e))?;

        let mut entries = Vec::new();
        let mut skipped = 0;
        let mut consumed: u64 = 0;
        let mut reached_eof = true;

        for line in content.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing record still being appended; leave it.
                reached_eof = false;
                break;
            }
            if entries.len() >= max {
                reached_eof = false;
                break;
            }
            consumed += line.len() as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!("skipping malformed queue record: {}", err);
                    skipped += 1;
                }
            }
        }

        let file_done = reached_eof && state.read_file != PRIMARY_NAME;

        Ok(ReadBatch {
            entries,
            cursor: QueueCursor {
                read_file: state.read_file,
                offset: state.committed_offset + consumed,
                file_done,
            },
            skipped,
        })
    }

    /// Commit a processed batch's cursor via temp-file rename.
    ///
    /// A fully consumed rotated segment is deleted and the read position
    /// moves to the next segment (or the primary) at offset zero.
    pub fn commit(&self, cursor: &QueueCursor) -> Result<()> {
        let mut state = self.load_state()?;

        if state.read_file != cursor.read_file {
            // Rotation moved the read target between read and commit; the
            // offset still applies to the renamed file.
            if cursor.read_file == PRIMARY_NAME {
                state.committed_offset = cursor.offset;
                return self.save_state(&state);
            }
        }

        if cursor.file_done {
            let done_path = self.dir.join(&cursor.read_file);
            if done_path.exists() {
                fs::remove_file(&done_path).map_err(|e| KaitError::storage(&done_path, e))?;
            }
            state.read_file = self.next_read_file(None);
            state.committed_offset = 0;
        } else {
            state.committed_offset = cursor.offset;
        }

        self.save_state(&state)
    }

    /// Rotate the primary file if it has reached the configured size.
    ///
    /// Returns true when a rotation happened.
    pub fn maybe_rotate(&self) -> Result<bool> {
        let size = match fs::metadata(&self.primary) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        if size < self.rotate_bytes {
            return Ok(false);
        }

        let mut state = self.load_state()?;
        state.write_seq += 1;
        let rotated_name = format!("{}.{}", PRIMARY_NAME, state.write_seq);
        let rotated_path = self.dir.join(&rotated_name);

        fs::rename(&self.primary, &rotated_path)
            .map_err(|e| KaitError::storage(&rotated_path, e))?;

        // Keep the reader pointed at the same bytes it was reading.
        if state.read_file == PRIMARY_NAME {
            state.read_file = rotated_name;
        }
        self.save_state(&state)?;

        tracing::info!(seq = state.write_seq, bytes = size, "rotated queue segment");
        Ok(true)
    }

    /// Merge the overflow sidecar back into the primary.
    ///
    /// Called during idle cycles. Returns the number of merged records.
    pub fn merge_overflow(&self) -> Result<usize> {
        if !self.overflow.exists() {
            return Ok(0);
        }

        let content = util::read_to_string_limited(&self.overflow)?;
        let mut merged = 0;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            util::append_line(&self.primary, line)?;
            merged += 1;
        }

        fs::remove_file(&self.overflow).map_err(|e| KaitError::storage(&self.overflow, e))?;
        if merged > 0 {
            tracing::info!(merged, "merged overflow sidecar into primary queue");
        }
        Ok(merged)
    }

    /// Count unconsumed records across the read chain and the sidecar.
    pub fn depth(&self) -> Result<usize> {
        let state = self.load_state()?;
        let mut depth = 0;

        let mut chain = self.rotated_segments();
        chain.push(PRIMARY_NAME.to_string());

        // Count from the read position onward; files earlier in the chain
        // were already consumed.
        let mut counting = !chain.iter().any(|name| *name == state.read_file);
        for name in chain {
            let path = self.dir.join(&name);
            if name == state.read_file {
                counting = true;
                depth += count_lines_from(&path, state.committed_offset)?;
                continue;
            }
            if counting {
                depth += count_lines_from(&path, 0)?;
            }
        }

        if self.overflow.exists() {
            depth += count_lines_from(&self.overflow, 0)?;
        }

        Ok(depth)
    }

    /// List rotated segment names in consumption order.
    fn rotated_segments(&self) -> Vec<String> {
        let mut segments: Vec<(u64, String)> = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(seq_str) = name.strip_prefix("events.jsonl.") {
                    if let Ok(seq) = seq_str.parse::<u64>() {
                        segments.push((seq, name));
                    }
                }
            }
        }
        segments.sort();
        segments.into_iter().map(|(_, name)| name).collect()
    }

    /// Next file the reader should target, excluding `skip`.
    fn next_read_file(&self, skip: Option<&str>) -> String {
        for name in self.rotated_segments() {
            if Some(name.as_str()) != skip {
                return name;
            }
        }
        PRIMARY_NAME.to_string()
    }

    fn load_state(&self) -> Result<QueueState> {
        if !self.state_path.exists() {
            return Ok(QueueState::default());
        }
        let content = util::read_to_string_limited(&self.state_path)?;
        serde_json::from_str(&content).map_err(|e| {
            KaitError::invariant(format!("corrupt queue state: {} (resetting would lose position)", e))
        })
    }

    fn save_state(&self, state: &QueueState) -> Result<()> {
        util::atomic_write_json(&self.state_path, state)
    }
}

/// Count newline-terminated records in `path` starting at `offset`.
fn count_lines_from(path: &Path, offset: u64) -> Result<usize> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(0),
    };
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| KaitError::storage(path, e))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| KaitError::storage(path, e))?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use tempfile::TempDir;

    fn entry(session: &str, n: usize) -> QueueEntry {
        QueueEntry::for_event(
            Event::new(session, EventKind::PostTool)
                .with_tool("Bash")
                .with_text(format!("run {}", n)),
        )
    }

    fn open_queue(dir: &TempDir) -> EventQueue {
        EventQueue::open(dir.path(), &QueueConfig::default()).unwrap()
    }

    #[test]
    fn test_append_then_read() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);

        for i in 0..3 {
            queue.append(&entry("s1", i)).unwrap();
        }

        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(batch.skipped, 0);
        assert!(!batch.cursor.file_done);
    }

    #[test]
    fn test_uncommitted_batch_is_redelivered() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        queue.append(&entry("s1", 0)).unwrap();

        let first = queue.read_batch(10).unwrap();
        let second = queue.read_batch(10).unwrap();

        assert_eq!(first.entries, second.entries);
    }

    #[test]
    fn test_commit_advances_position() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        queue.append(&entry("s1", 0)).unwrap();
        queue.append(&entry("s1", 1)).unwrap();

        let batch = queue.read_batch(1).unwrap();
        assert_eq!(batch.entries.len(), 1);
        queue.commit(&batch.cursor).unwrap();

        let rest = queue.read_batch(10).unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(
            rest.entries[0].event.text.as_deref(),
            Some("run 1")
        );
    }

    #[test]
    fn test_depth_counts_unconsumed() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);

        assert_eq!(queue.depth().unwrap(), 0);

        for i in 0..5 {
            queue.append(&entry("s1", i)).unwrap();
        }
        assert_eq!(queue.depth().unwrap(), 5);

        let batch = queue.read_batch(2).unwrap();
        queue.commit(&batch.cursor).unwrap();
        assert_eq!(queue.depth().unwrap(), 3);
    }

    #[test]
    fn test_malformed_lines_are_skipped_and_consumed() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);

        queue.append(&entry("s1", 0)).unwrap();
        util::append_line(&queue_path(dir.path()), "{not valid json").unwrap();
        queue.append(&entry("s1", 1)).unwrap();

        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.skipped, 1);

        // Committing moves past the malformed line too
        queue.commit(&batch.cursor).unwrap();
        let rest = queue.read_batch(10).unwrap();
        assert!(rest.entries.is_empty());
        assert_eq!(rest.skipped, 0);
    }

    #[test]
    fn test_rotation_and_drain() {
        let dir = TempDir::new().unwrap();
        let queue = EventQueue::open(
            dir.path(),
            &QueueConfig { rotate_bytes: 1 },
        )
        .unwrap();

        queue.append(&entry("s1", 0)).unwrap();
        assert!(queue.maybe_rotate().unwrap());
        // Rotated segment exists, primary gone until next append
        assert!(dir.path().join("queue/events.jsonl.1").exists());

        queue.append(&entry("s1", 1)).unwrap();

        // First batch drains the rotated segment
        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.cursor.file_done);
        queue.commit(&batch.cursor).unwrap();
        assert!(!dir.path().join("queue/events.jsonl.1").exists());

        // Second batch reads the new primary
        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].event.text.as_deref(), Some("run 1"));
    }

    #[test]
    fn test_overflow_merge() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);

        let line = serde_json::to_string(&entry("s1", 9)).unwrap();
        util::append_line(&queue_overflow_path(dir.path()), &line).unwrap();

        assert_eq!(queue.depth().unwrap(), 1);
        assert_eq!(queue.merge_overflow().unwrap(), 1);
        assert!(!queue_overflow_path(dir.path()).exists());

        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
    }

    #[test]
    fn test_merge_overflow_noop_without_sidecar() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        assert_eq!(queue.merge_overflow().unwrap(), 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open_queue(&dir);
            for i in 0..3 {
                queue.append(&entry("s1", i)).unwrap();
            }
            let batch = queue.read_batch(2).unwrap();
            queue.commit(&batch.cursor).unwrap();
        }

        let queue = open_queue(&dir);
        let batch = queue.read_batch(10).unwrap();
        assert_eq!(batch.entries.len(), 1);
    }
}
