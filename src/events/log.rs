//! Append-only JSONL event log with crash-safe scanning.
//!
//! A single writer appends one JSON object per line and fsyncs before
//! returning, so an acknowledged event survives a crash. A torn trailing
//! record (partial write at the moment of a crash) is detected on scan as
//! an unparseable line and dropped; everything before it is authoritative.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::EventLogError;
use crate::events::Event;

struct LogInner {
    file: Option<File>,
    next_seq: u64,
    closed: bool,
}

/// Single-writer, append-only event log.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Open the log at `path`, scanning any existing records to resume the
    /// sequence counter after the highest seq already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EventLogError> {
        let path = path.into();
        let existing = Self::scan_path(&path)?;
        let next_seq = existing.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                file: None,
                next_seq,
                closed: false,
            }),
        })
    }

    /// Append `event`, assigning the next sequence number.
    ///
    /// The record is flushed and fsynced before this returns; the caller may
    /// treat the returned seq as durable. Fails with [`EventLogError::Closed`]
    /// once a `runtime_stopped` event has been written.
    pub fn append(&self, mut event: Event) -> Result<u64, EventLogError> {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        if inner.closed {
            return Err(EventLogError::Closed);
        }

        event.seq = inner.next_seq;
        let line = serde_json::to_string(&event)?;

        if inner.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(EventLogError::Write)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(EventLogError::Write)?;
            inner.file = Some(file);
        }

        let file = inner.file.as_mut().expect("file just opened");
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_data())
            .map_err(EventLogError::Write)?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        if event.kind == crate::events::kind::RUNTIME_STOPPED {
            inner.closed = true;
        }
        debug!(seq, kind = %event.kind, "event appended");
        Ok(seq)
    }

    /// Read every valid event in seq order, dropping torn or blank lines.
    pub fn scan(&self) -> Result<Vec<Event>, EventLogError> {
        Self::scan_path(&self.path)
    }

    fn scan_path(path: &Path) -> Result<Vec<Event>, EventLogError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::Read(e)),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(EventLogError::Read)?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unparseable log line");
                }
            }
        }
        Ok(events)
    }
}
