//! Video converter
//!
//! Reassembles uploaded videos from numbered chunk files and packages them
//! for adaptive streaming with an external encoder.

pub mod chunks;
pub mod encode;
pub mod error_record;
pub mod pipeline;
pub mod startup;
pub mod task;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use video_converter_config as config;
pub use video_converter_config::Config;
pub use chunks::{
    chunk_sort_key, discover_chunks, merge_chunks, sequence_number, MergeError, MergeOptions,
    MergeSummary, UNNUMBERED_KEY,
};
pub use encode::{build_encoder_command, run_encoder, EncodeError, EncodeOutput, EncodeParams};
pub use error_record::{
    load_error_records, ErrorRecord, ErrorSink, FanoutSink, JsonLinesSink, LogSink,
};
pub use pipeline::{ConversionPipeline, ConversionReport, PipelineError, TaskLayout};
pub use startup::{check_encoder_available, run_startup_checks, StartupError};
pub use task::{parse_task, TaskError, TaskStage, VideoTask};
pub use worker::{SharedStats, Worker, WorkerError, WorkerStats};
