//! Encoder invocation for the video converter

pub mod ffmpeg;

pub use ffmpeg::{build_encoder_command, run_encoder, EncodeError, EncodeOutput, EncodeParams};
