//! Conversion pipeline
//!
//! Runs one task through merge, output preparation, transcoding and cleanup.
//! Each failure is reported to the configured [`ErrorSink`] and also returned,
//! so callers can acknowledge or retry the task upstream.

use crate::chunks::{merge_chunks, MergeError, MergeOptions, MergeSummary};
use crate::config::{Config, OutputConfig};
use crate::encode::{run_encoder, EncodeError, EncodeParams};
use crate::error_record::{ErrorRecord, ErrorSink, FanoutSink, JsonLinesSink, LogSink};
use crate::task::{parse_task, TaskError, TaskStage, VideoTask};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Error type for pipeline runs
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Payload could not be turned into a task
    #[error("Invalid task: {0}")]
    Task(#[from] TaskError),

    /// Chunks could not be merged
    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    /// The merge worker thread panicked
    #[error("Merge task panicked: {0}")]
    MergePanicked(String),

    /// Package directory could not be created
    #[error("Failed to create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// External encoder failed
    #[error("Conversion failed: {0}")]
    Encode(#[from] EncodeError),

    /// Merged file could not be removed after a successful conversion
    #[error("Failed to remove merged file {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Stage the failure happened in
    pub fn stage(&self) -> TaskStage {
        match self {
            PipelineError::Task(_) => TaskStage::Parsing,
            PipelineError::Merge(_) | PipelineError::MergePanicked(_) => TaskStage::Merging,
            PipelineError::OutputDir { .. } => TaskStage::PreparingOutput,
            PipelineError::Encode(_) => TaskStage::Transcoding,
            PipelineError::Cleanup { .. } => TaskStage::CleaningUp,
        }
    }

    /// Underlying cause for the error record, with any captured encoder output
    pub fn details(&self) -> String {
        match self {
            PipelineError::Task(e) => e.to_string(),
            PipelineError::Merge(e) => e.to_string(),
            PipelineError::Encode(e) => match e.output().map(str::trim_end) {
                Some(output) if !output.is_empty() => format!("{}\n{}", e, output),
                _ => e.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Paths a task reads and writes, all inside the task directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    /// Directory holding the chunks
    pub source_dir: PathBuf,
    /// Transient reassembled video
    pub merged_path: PathBuf,
    /// Streaming package directory
    pub package_dir: PathBuf,
    /// Manifest written by the encoder
    pub manifest_path: PathBuf,
}

impl TaskLayout {
    /// Resolve the layout of `task` under the given output naming
    pub fn for_task(task: &VideoTask, output: &OutputConfig) -> Self {
        let source_dir = task.dir().to_path_buf();
        let package_dir = source_dir.join(&output.package_dir);
        Self {
            merged_path: source_dir.join(&output.merged_file_name),
            manifest_path: package_dir.join(&output.manifest_name),
            package_dir,
            source_dir,
        }
    }
}

/// Summary of a successful conversion
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReport {
    /// Video that was converted
    pub video_id: i64,
    /// Number of chunks merged
    pub chunk_count: usize,
    /// Size of the merged file in bytes
    pub merged_bytes: u64,
    /// Streaming package directory
    pub package_dir: PathBuf,
    /// Manifest written by the encoder
    pub manifest_path: PathBuf,
    /// Total time spent on the task
    pub elapsed: Duration,
}

/// Runs conversion tasks one at a time
pub struct ConversionPipeline {
    config: Config,
    sink: Arc<dyn ErrorSink>,
}

impl ConversionPipeline {
    /// Create a pipeline reporting errors to `sink`
    pub fn new(config: Config, sink: Arc<dyn ErrorSink>) -> Self {
        Self { config, sink }
    }

    /// Create a pipeline with the sinks named by the configuration
    ///
    /// Records always go to the log; when `errors.log_file` is set they are
    /// also appended to that file.
    pub fn from_config(config: Config) -> Self {
        let mut sinks = FanoutSink::new().with(Arc::new(LogSink));
        if let Some(path) = &config.errors.log_file {
            sinks = sinks.with(Arc::new(JsonLinesSink::new(path)));
        }
        Self::new(config, Arc::new(sinks))
    }

    /// Configuration the pipeline was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parse a raw payload and process the task it describes
    ///
    /// A payload that does not parse is reported and no stage runs.
    pub async fn handle(&self, payload: &[u8]) -> Result<ConversionReport, PipelineError> {
        let task = match parse_task(payload) {
            Ok(task) => task,
            Err(e) => {
                let video_id = match &e {
                    TaskError::EmptyPath { video_id } => Some(*video_id),
                    TaskError::Json(_) => None,
                };
                let err = PipelineError::from(e);
                self.report(video_id, &err);
                return Err(err);
            }
        };

        self.process(&task).await
    }

    /// Process a task: merge, prepare output, transcode, clean up
    ///
    /// Stops at the first failing stage. The merged file is removed only when
    /// every stage succeeded; otherwise it is left for diagnosis.
    pub async fn process(&self, task: &VideoTask) -> Result<ConversionReport, PipelineError> {
        let result = self.run_stages(task).await;
        if let Err(e) = &result {
            self.report(Some(task.video_id), e);
        }
        result
    }

    async fn run_stages(&self, task: &VideoTask) -> Result<ConversionReport, PipelineError> {
        let started = Instant::now();
        let layout = TaskLayout::for_task(task, &self.config.output);

        log_stage(task, TaskStage::Merging, &layout.source_dir);
        let merged = self.merge(&layout).await?;
        debug!(
            video_id = task.video_id,
            chunks = merged.chunk_count,
            bytes = merged.bytes_written,
            "chunks merged"
        );

        log_stage(task, TaskStage::PreparingOutput, &layout.package_dir);
        tokio::fs::create_dir_all(&layout.package_dir)
            .await
            .map_err(|source| PipelineError::OutputDir {
                path: layout.package_dir.clone(),
                source,
            })?;

        log_stage(task, TaskStage::Transcoding, &layout.merged_path);
        let params = EncodeParams::from_config(
            &self.config.encoder,
            layout.merged_path.clone(),
            layout.manifest_path.clone(),
        );
        let encoded = run_encoder(&params).await?;
        info!(
            video_id = task.video_id,
            path = %layout.package_dir.display(),
            encode_secs = encoded.elapsed.as_secs_f64(),
            "video converted to mpeg-dash"
        );
        debug!(video_id = task.video_id, output = %encoded.output, "encoder output");

        log_stage(task, TaskStage::CleaningUp, &layout.merged_path);
        tokio::fs::remove_file(&layout.merged_path)
            .await
            .map_err(|source| PipelineError::Cleanup {
                path: layout.merged_path.clone(),
                source,
            })?;

        let report = ConversionReport {
            video_id: task.video_id,
            chunk_count: merged.chunk_count,
            merged_bytes: merged.bytes_written,
            package_dir: layout.package_dir,
            manifest_path: layout.manifest_path,
            elapsed: started.elapsed(),
        };
        info!(
            video_id = task.video_id,
            stage = %TaskStage::Complete,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "task complete"
        );
        Ok(report)
    }

    async fn merge(&self, layout: &TaskLayout) -> Result<MergeSummary, PipelineError> {
        let options = MergeOptions {
            extension: self.config.chunks.extension.clone(),
            reject_unnumbered: self.config.chunks.reject_unnumbered,
        };
        let source_dir = layout.source_dir.clone();
        let merged_path = layout.merged_path.clone();

        let summary =
            tokio::task::spawn_blocking(move || merge_chunks(&source_dir, &merged_path, &options))
                .await
                .map_err(|e| PipelineError::MergePanicked(e.to_string()))??;
        Ok(summary)
    }

    fn report(&self, video_id: Option<i64>, err: &PipelineError) {
        let record = ErrorRecord::new(video_id, err.stage(), err.details());
        self.sink.report(&record);
    }
}

fn log_stage(task: &VideoTask, stage: TaskStage, path: &Path) {
    info!(
        video_id = task.video_id,
        stage = %stage,
        path = %path.display(),
        "task stage"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemorySink;
    use std::fs;
    use tempfile::TempDir;

    fn pipeline_with(config: Config) -> (ConversionPipeline, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (ConversionPipeline::new(config, sink.clone()), sink)
    }

    /// Task directory holding `c0.chunk`="AA" and `c1.chunk`="BB"
    fn make_task_dir(root: &Path, video_id: i64) -> VideoTask {
        let dir = root.join(video_id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("c1.chunk"), b"BB").unwrap();
        fs::write(dir.join("c0.chunk"), b"AA").unwrap();
        VideoTask::new(video_id, dir)
    }

    #[test]
    fn test_layout_defaults() {
        let task = VideoTask::new(1, "/t/1");
        let layout = TaskLayout::for_task(&task, &OutputConfig::default());

        assert_eq!(layout.source_dir, PathBuf::from("/t/1"));
        assert_eq!(layout.merged_path, PathBuf::from("/t/1/merged.mp4"));
        assert_eq!(layout.package_dir, PathBuf::from("/t/1/mpeg-dash"));
        assert_eq!(
            layout.manifest_path,
            PathBuf::from("/t/1/mpeg-dash/output.mpd")
        );
    }

    #[test]
    fn test_error_stages() {
        let io_err = || std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(
            PipelineError::OutputDir {
                path: PathBuf::from("/t/1/mpeg-dash"),
                source: io_err(),
            }
            .stage(),
            TaskStage::PreparingOutput
        );
        assert_eq!(
            PipelineError::Cleanup {
                path: PathBuf::from("/t/1/merged.mp4"),
                source: io_err(),
            }
            .stage(),
            TaskStage::CleaningUp
        );
        assert_eq!(
            PipelineError::Encode(EncodeError::Timeout {
                secs: 3,
                output: String::new(),
            })
            .stage(),
            TaskStage::Transcoding
        );
    }

    #[test]
    fn test_details_include_encoder_output() {
        let err = PipelineError::Encode(EncodeError::Failed {
            code: 1,
            output: "Invalid data found when processing input\n".to_string(),
        });
        assert_eq!(
            err.details(),
            "Encoder failed with exit code: 1\nInvalid data found when processing input"
        );
    }

    #[tokio::test]
    async fn test_merge_failure_is_reported() {
        let root = TempDir::new().unwrap();
        let (pipeline, sink) = pipeline_with(Config::default());
        let task = VideoTask::new(11, root.path().join("missing"));

        let err = pipeline.process(&task).await.unwrap_err();

        assert_eq!(err.stage(), TaskStage::Merging);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].video_id, Some(11));
        assert_eq!(records[0].error, "failed to merge chunks");
        assert!(records[0].details.contains("missing"));
    }

    #[tokio::test]
    async fn test_parse_failure_short_circuits() {
        let root = TempDir::new().unwrap();
        let task = make_task_dir(root.path(), 1);
        let (pipeline, sink) = pipeline_with(Config::default());

        let payload = format!(
            r#"{{"video_id": "1", "path": "{}"}}"#,
            task.path.display()
        );
        let err = pipeline.handle(payload.as_bytes()).await.unwrap_err();

        assert_eq!(err.stage(), TaskStage::Parsing);
        assert!(!task.path.join("merged.mp4").exists());
        assert!(!task.path.join("mpeg-dash").exists());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error, "failed to unmarshal task");
        assert_eq!(records[0].video_id, None);
    }

    #[tokio::test]
    async fn test_empty_path_reports_video_id() {
        let (pipeline, sink) = pipeline_with(Config::default());

        let err = pipeline
            .handle(br#"{"video_id": 5, "path": ""}"#)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), TaskStage::Parsing);
        assert_eq!(sink.records()[0].video_id, Some(5));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::error_record::load_error_records;
        use crate::test_support::{copying_encoder, shell_encoder};

        fn config_with(encoder: crate::config::EncoderConfig) -> Config {
            Config {
                encoder,
                ..Config::default()
            }
        }

        #[tokio::test]
        async fn test_end_to_end_success() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 1);
            let (pipeline, sink) = pipeline_with(config_with(copying_encoder(root.path())));

            let report = pipeline.process(&task).await.expect("conversion succeeds");

            assert_eq!(report.video_id, 1);
            assert_eq!(report.chunk_count, 2);
            assert_eq!(report.merged_bytes, 4);
            assert!(!task.path.join("merged.mp4").exists());
            assert!(task.path.join("mpeg-dash").is_dir());
            assert_eq!(report.manifest_path, task.path.join("mpeg-dash/output.mpd"));
            assert_eq!(fs::read(&report.manifest_path).unwrap(), b"AABB");
            assert!(sink.records().is_empty());
        }

        #[tokio::test]
        async fn test_handle_runs_payload() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 2);
            let (pipeline, sink) = pipeline_with(config_with(copying_encoder(root.path())));

            let payload = serde_json::json!({ "video_id": 2, "path": task.path });
            let report = pipeline
                .handle(payload.to_string().as_bytes())
                .await
                .expect("conversion succeeds");

            assert_eq!(report.video_id, 2);
            assert!(report.manifest_path.exists());
            assert!(sink.records().is_empty());
        }

        #[tokio::test]
        async fn test_existing_package_dir_is_reused() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 3);
            fs::create_dir_all(task.path.join("mpeg-dash")).unwrap();
            let (pipeline, _sink) = pipeline_with(config_with(copying_encoder(root.path())));

            pipeline.process(&task).await.expect("conversion succeeds");
            assert!(task.path.join("mpeg-dash/output.mpd").exists());
        }

        #[tokio::test]
        async fn test_transcode_failure_keeps_merged_file() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 4);
            let encoder = shell_encoder(
                root.path(),
                "echo '[dash] could not write header' >&2\nexit 1",
            );
            let (pipeline, sink) = pipeline_with(config_with(encoder));

            let err = pipeline.process(&task).await.unwrap_err();

            assert_eq!(err.stage(), TaskStage::Transcoding);
            assert_eq!(fs::read(task.path.join("merged.mp4")).unwrap(), b"AABB");

            let records = sink.records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].error, "failed to convert");
            assert!(records[0].details.contains("could not write header"));
        }

        #[tokio::test]
        async fn test_output_dir_failure_skips_encoder() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 5);
            fs::write(task.path.join("mpeg-dash"), b"occupied").unwrap();
            let marker = root.path().join("encoder-ran");
            let encoder = shell_encoder(
                root.path(),
                &format!("touch '{}'\ncp \"$2\" \"$5\"", marker.display()),
            );
            let (pipeline, sink) = pipeline_with(config_with(encoder));

            let err = pipeline.process(&task).await.unwrap_err();

            assert_eq!(err.stage(), TaskStage::PreparingOutput);
            assert!(!marker.exists());
            let records = sink.records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].error, "failed to create output directory");
            assert_eq!(records[0].video_id, Some(5));
        }

        #[tokio::test]
        async fn test_cleanup_failure_keeps_package() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 6);
            // Encoder that consumes its input, so the merged file is already gone
            let encoder = shell_encoder(root.path(), "cp \"$2\" \"$5\"\nrm \"$2\"");
            let (pipeline, sink) = pipeline_with(config_with(encoder));

            let err = pipeline.process(&task).await.unwrap_err();

            assert_eq!(err.stage(), TaskStage::CleaningUp);
            assert!(task.path.join("mpeg-dash/output.mpd").exists());
            assert_eq!(sink.records()[0].error, "failed to remove merged file");
        }

        #[tokio::test]
        async fn test_encoder_timeout_is_distinct() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 7);
            let mut encoder = shell_encoder(
                root.path(),
                "echo 'stalled at frame 42' >&2\nexec sleep 30",
            );
            encoder.timeout_secs = 1;
            let (pipeline, sink) = pipeline_with(config_with(encoder));

            let err = pipeline.process(&task).await.unwrap_err();

            match &err {
                PipelineError::Encode(e) => assert_eq!(e.kind(), "timeout"),
                other => panic!("unexpected error: {other}"),
            }
            assert!(task.path.join("merged.mp4").exists());
            let details = &sink.records()[0].details;
            assert!(details.contains("timed out"));
            assert!(details.contains("stalled at frame 42"));
        }

        #[tokio::test]
        async fn test_from_config_persists_records() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 8);
            let log_file = root.path().join("state/errors.jsonl");
            let mut config = config_with(shell_encoder(root.path(), "exit 2"));
            config.errors.log_file = Some(log_file.clone());

            let pipeline = ConversionPipeline::from_config(config);
            pipeline.process(&task).await.unwrap_err();

            let records = load_error_records(&log_file).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].video_id, Some(8));
            assert_eq!(records[0].stage, TaskStage::Transcoding);
        }

        #[tokio::test]
        async fn test_custom_layout_names() {
            let root = TempDir::new().unwrap();
            let task = make_task_dir(root.path(), 9);
            let mut config = config_with(copying_encoder(root.path()));
            config.output.merged_file_name = "joined.mkv".to_string();
            config.output.package_dir = "dash".to_string();
            config.output.manifest_name = "stream.mpd".to_string();
            let (pipeline, _sink) = pipeline_with(config);

            let report = pipeline.process(&task).await.expect("conversion succeeds");

            assert_eq!(report.manifest_path, task.path.join("dash/stream.mpd"));
            assert_eq!(fs::read(&report.manifest_path).unwrap(), b"AABB");
            assert!(!task.path.join("joined.mkv").exists());
        }
    }
}
