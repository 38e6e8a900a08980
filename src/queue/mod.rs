//! Append-only event queue.
//!
//! The queue is a newline-delimited record file with a sibling state file
//! tracking the committed read offset. Multiple ingest workers append via
//! `O_APPEND`; a single pipeline scheduler owns the read side.

mod file;

pub use file::{EventQueue, QueueCursor, QueueState, ReadBatch};
