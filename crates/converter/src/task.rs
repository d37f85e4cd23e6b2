//! Task model for the conversion pipeline.
//!
//! A task names one uploaded video: its numeric id and the directory holding
//! its chunks. Tasks arrive as JSON payloads such as
//! `{"video_id": 1, "path": "/media/uploads/1"}`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for task payload parsing
#[derive(Debug, Error)]
pub enum TaskError {
    /// Payload is not a valid task document
    #[error("Invalid task payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Task path is empty
    #[error("Task {video_id} has an empty path")]
    EmptyPath { video_id: i64 },
}

/// A unit of work: one video to reassemble and package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTask {
    /// Identifier of the uploaded video
    pub video_id: i64,
    /// Directory holding the video's chunks
    pub path: PathBuf,
}

impl VideoTask {
    /// Create a new task
    pub fn new(video_id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            video_id,
            path: path.into(),
        }
    }

    /// Directory holding the chunks
    pub fn dir(&self) -> &Path {
        &self.path
    }
}

/// Parse a task from a raw JSON payload.
///
/// Unknown fields are ignored. Both `video_id` and `path` are required and the
/// path must not be empty.
pub fn parse_task(payload: &[u8]) -> Result<VideoTask, TaskError> {
    let task: VideoTask = serde_json::from_slice(payload)?;
    if task.path.as_os_str().is_empty() {
        return Err(TaskError::EmptyPath {
            video_id: task.video_id,
        });
    }
    Ok(task)
}

/// Stage of a task in the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    /// Payload is being decoded.
    Parsing,
    /// Chunks are being concatenated.
    Merging,
    /// Package directory is being created.
    PreparingOutput,
    /// External encoder is running.
    Transcoding,
    /// Merged file is being removed.
    CleaningUp,
    /// All stages finished.
    Complete,
}

impl TaskStage {
    /// Stage description used in error records when this stage fails
    ///
    /// `Complete` is not a stage that can fail and has no description.
    pub fn failure_message(&self) -> Option<&'static str> {
        match self {
            TaskStage::Parsing => Some("failed to unmarshal task"),
            TaskStage::Merging => Some("failed to merge chunks"),
            TaskStage::PreparingOutput => Some("failed to create output directory"),
            TaskStage::Transcoding => Some("failed to convert"),
            TaskStage::CleaningUp => Some("failed to remove merged file"),
            TaskStage::Complete => None,
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStage::Parsing => write!(f, "parsing"),
            TaskStage::Merging => write!(f, "merging"),
            TaskStage::PreparingOutput => write!(f, "preparing_output"),
            TaskStage::Transcoding => write!(f, "transcoding"),
            TaskStage::CleaningUp => write!(f, "cleaning_up"),
            TaskStage::Complete => write!(f, "complete"),
        }
    }
}
