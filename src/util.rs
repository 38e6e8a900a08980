//! Shared file and identifier utilities.
//!
//! Append-only JSONL writers, atomic snapshot writes, bounded log trimming,
//! and monotone event-id generation used across Kait modules.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::{KaitError, Result};

/// Maximum file size that can be read into memory (16 MB).
///
/// Queue segments rotate well below this; snapshots and logs that exceed it
/// indicate something has gone wrong and are refused rather than loaded.
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Read a file into a string with size limit protection.
pub fn read_to_string_limited(path: &Path) -> Result<String> {
    read_to_string_with_limit(path, MAX_FILE_SIZE)
}

/// Read a file into a string with a custom size limit.
pub fn read_to_string_with_limit(path: &Path, limit: u64) -> Result<String> {
    let metadata = fs::metadata(path).map_err(|e| KaitError::storage(path, e))?;

    let size = metadata.len();
    if size > limit {
        return Err(KaitError::storage(
            path,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file too large ({} bytes, max {} bytes)", size, limit),
            ),
        ));
    }

    fs::read_to_string(path).map_err(|e| KaitError::storage(path, e))
}

/// Append a single line to a file, creating it if needed.
///
/// The write goes through `O_APPEND`, so concurrent appenders from multiple
/// workers interleave at record granularity.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| KaitError::storage(parent, e))?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| KaitError::storage(path, e))?;

    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| KaitError::storage(path, e))
}

/// Serialize a value and append it as one JSONL record.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    append_line(path, &line)
}

/// Write a JSON value atomically via temp file + rename.
///
/// The temp file is fsynced before the rename so a crash leaves either the
/// old snapshot or the new one, never a partial write.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write_string(path, &json)
}

/// Write a string atomically via temp file + rename.
pub fn atomic_write_string(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ".".into());
    if !parent.exists() {
        fs::create_dir_all(&parent).map_err(|e| KaitError::storage(&parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file =
            fs::File::create(&temp_path).map_err(|e| KaitError::storage(&temp_path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| KaitError::storage(&temp_path, e))?;
        file.sync_all()
            .map_err(|e| KaitError::storage(&temp_path, e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| KaitError::storage(path, e))
}

/// Trim a JSONL file in place, keeping only the most recent `max_lines`.
///
/// Used to bound the quarantine and roast-history logs. A no-op when the
/// file does not exist or is already within bounds.
pub fn trim_jsonl_to_last(path: &Path, max_lines: usize) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let content = read_to_string_limited(path)?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= max_lines {
        return Ok(());
    }

    let kept = &lines[lines.len() - max_lines..];
    atomic_write_string(path, &format!("{}\n", kept.join("\n")))
}

/// Truncate a string to `max_chars`, appending a marker when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{}...<truncated>", head)
}

/// Current wall-clock time in integer nanoseconds.
pub fn now_ns() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

/// Last nanosecond value handed out by `next_event_id`, for monotonicity.
static LAST_ID_NS: AtomicU64 = AtomicU64::new(0);

/// Generate a monotone, lexicographically sortable id with the given prefix.
///
/// Format: `<prefix>_<16-hex-digit nanos>`. If the clock reads the same or
/// an earlier nanosecond than the previous call, the counter is bumped past
/// it so ids never repeat or go backwards within a process.
pub fn next_id(prefix: &str) -> String {
    let now = now_ns().max(0) as u64;
    let mut prev = LAST_ID_NS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_ID_NS.compare_exchange_weak(
            prev,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("{}_{:016x}", prefix, candidate),
            Err(actual) => prev = actual,
        }
    }
}

/// Generate a monotone event id (`evt_` prefix).
pub fn next_event_id() -> String {
    next_id("evt")
}

/// Short stable hex digest of arbitrary text.
///
/// Used for insight keys, advice ids, and packet-cache keys.
pub fn short_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}
