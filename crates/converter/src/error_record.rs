//! Error records and the sinks they are reported to.
//!
//! Every failed task produces one [`ErrorRecord`]. Records are always logged;
//! they can additionally be appended to a JSON-lines file for later inspection.

use crate::task::TaskStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Description used when a record names a stage that cannot fail
const GENERIC_FAILURE: &str = "failed to process video";

/// Structured description of a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Video the task was about, when the payload got far enough to name it
    pub video_id: Option<i64>,
    /// Stage that failed
    pub stage: TaskStage,
    /// Human-readable stage description, e.g. "failed to merge chunks"
    pub error: String,
    /// Underlying cause, including captured encoder output when there is any
    pub details: String,
    /// When the failure was recorded
    pub time: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create a record for a failure at `stage`, timestamped now
    pub fn new(video_id: Option<i64>, stage: TaskStage, details: impl Into<String>) -> Self {
        Self {
            video_id,
            stage,
            error: stage
                .failure_message()
                .unwrap_or(GENERIC_FAILURE)
                .to_string(),
            details: details.into(),
            time: Utc::now(),
        }
    }

    /// Serialize the record as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"error\":\"{}\",\"details\":\"unserializable record: {}\"}}",
                self.error, e
            )
        })
    }
}

/// Destination for error records
///
/// Reporting never fails the caller; sinks deal with their own IO errors.
pub trait ErrorSink: Send + Sync {
    /// Record a failure
    fn report(&self, record: &ErrorRecord);
}

/// Sink that emits records through `tracing` at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, record: &ErrorRecord) {
        error!(
            video_id = ?record.video_id,
            stage = %record.stage,
            record = %record.to_json(),
            "processing error: {}", record.error
        );
    }
}

/// Sink that appends each record as one JSON line to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    /// Create a sink writing to `path`; parent directories are created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// File the records are appended to
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &ErrorRecord) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", record.to_json())
    }
}

impl ErrorSink for JsonLinesSink {
    fn report(&self, record: &ErrorRecord) {
        if let Err(e) = self.append(record) {
            warn!(
                path = %self.path.display(),
                "failed to persist error record: {}", e
            );
        }
    }
}

/// Sink that forwards every record to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ErrorSink for FanoutSink {
    fn report(&self, record: &ErrorRecord) {
        for sink in &self.sinks {
            sink.report(record);
        }
    }
}

/// Loads all error records from a JSON-lines file.
///
/// A missing file yields no records. Lines that fail to parse are skipped with
/// a warning.
pub fn load_error_records(path: &Path) -> Result<Vec<ErrorRecord>, io::Error> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    "skipping malformed error record: {}", e
                );
            }
        }
    }

    Ok(records)
}
