//! Shared fixtures for unit tests

use crate::config::EncoderConfig;
use crate::error_record::{ErrorRecord, ErrorSink};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Encoder configuration that runs `body` as a POSIX shell script.
///
/// The script is passed to `sh` rather than executed directly, so tests never
/// race on the executable bit. Arguments follow the default template:
/// `$1=-i $2=<input> $3=-f $4=dash $5=<manifest>`.
pub fn shell_encoder(dir: &Path, body: &str) -> EncoderConfig {
    let script = dir.join("encoder.sh");
    fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();

    let mut args = vec![script.to_string_lossy().into_owned()];
    args.extend(EncoderConfig::default().args);

    EncoderConfig {
        binary: "sh".to_string(),
        args,
        timeout_secs: 0,
    }
}

/// Stub encoder that copies the merged input to the manifest path
pub fn copying_encoder(dir: &Path) -> EncoderConfig {
    shell_encoder(dir, "cp \"$2\" \"$5\"")
}

/// Sink that keeps reported records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records reported so far
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ErrorSink for MemorySink {
    fn report(&self, record: &ErrorRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
    }
}
