//! External encoder module
//!
//! Builds and runs the command that turns a merged video into an MPEG-DASH
//! package. The encoder is treated as an opaque executable: the argument list
//! comes from configuration, with `{input}` and `{output}` substituted per task.

use crate::config::{EncoderConfig, INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be started
    #[error("Failed to launch encoder '{binary}': {source}")]
    Launch {
        binary: String,
        source: std::io::Error,
    },

    /// Waiting on the encoder process failed
    #[error("Failed to wait for encoder: {0}")]
    Wait(std::io::Error),

    /// Encoder exited with non-zero status
    #[error("Encoder failed with exit code: {code}")]
    Failed { code: i32, output: String },

    /// Encoder was terminated by a signal
    #[error("Encoder process was terminated by signal")]
    Terminated { output: String },

    /// Encoder ran past the configured limit and was killed
    #[error("Encoder timed out after {secs} seconds")]
    Timeout { secs: u64, output: String },
}

impl EncodeError {
    /// Captured stdout and stderr of the encoder, when the process was started
    pub fn output(&self) -> Option<&str> {
        match self {
            EncodeError::Failed { output, .. }
            | EncodeError::Terminated { output }
            | EncodeError::Timeout { output, .. } => Some(output.as_str()),
            EncodeError::Launch { .. } | EncodeError::Wait(_) => None,
        }
    }

    /// Short machine-readable name of the failure
    pub fn kind(&self) -> &'static str {
        match self {
            EncodeError::Launch { .. } => "launch",
            EncodeError::Wait(_) => "wait",
            EncodeError::Failed { .. } => "exit_status",
            EncodeError::Terminated { .. } => "signal",
            EncodeError::Timeout { .. } => "timeout",
        }
    }
}

/// Parameters for one encoder run
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Encoder executable
    pub binary: String,
    /// Argument template containing `{input}` and `{output}`
    pub args: Vec<String>,
    /// Merged video to encode
    pub input_path: PathBuf,
    /// Manifest path inside the package directory
    pub manifest_path: PathBuf,
    /// Upper bound on the encoder's run time
    pub timeout: Option<Duration>,
}

impl EncodeParams {
    /// Create parameters from the encoder configuration
    ///
    /// A `timeout_secs` of zero means the encoder may run indefinitely.
    pub fn from_config(config: &EncoderConfig, input_path: PathBuf, manifest_path: PathBuf) -> Self {
        let timeout = match config.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            binary: config.binary.clone(),
            args: config.args.clone(),
            input_path,
            manifest_path,
            timeout,
        }
    }

    /// Argument list with the placeholders substituted
    pub fn resolved_args(&self) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| substitute(arg, &self.input_path, &self.manifest_path))
            .collect()
    }
}

fn substitute(arg: &str, input: &Path, output: &Path) -> OsString {
    // Whole-argument placeholders keep non UTF-8 paths intact
    if arg == INPUT_PLACEHOLDER {
        return input.as_os_str().to_owned();
    }
    if arg == OUTPUT_PLACEHOLDER {
        return output.as_os_str().to_owned();
    }
    arg.replace(INPUT_PLACEHOLDER, &input.to_string_lossy())
        .replace(OUTPUT_PLACEHOLDER, &output.to_string_lossy())
        .into()
}

/// Captured result of a successful encoder run
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Captured stdout followed by stderr
    pub output: String,
    /// Wall time the encoder ran for
    pub elapsed: Duration,
}

/// Build the encoder command for the given parameters
///
/// With the default configuration this is
/// `ffmpeg -i <input> -f dash <package_dir>/output.mpd`.
pub fn build_encoder_command(params: &EncodeParams) -> Command {
    let mut cmd = Command::new(&params.binary);
    cmd.args(params.resolved_args());
    cmd
}

/// How long a killed encoder's pipes are drained before giving up
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(500);

type Captured = Arc<Mutex<Vec<u8>>>;

fn spawn_reader<R>(pipe: Option<R>, captured: Captured) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => captured
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&buf[..n]),
            }
        }
    })
}

/// Stdout and stderr of a running encoder, collected as they arrive
///
/// Bytes land in shared buffers, so whatever was read before a timeout is
/// still available after the readers are aborted.
struct OutputCapture {
    stdout: Captured,
    stderr: Captured,
    readers: [JoinHandle<()>; 2],
}

impl OutputCapture {
    fn start(child: &mut Child) -> Self {
        let stdout = Captured::default();
        let stderr = Captured::default();
        let readers = [
            spawn_reader(child.stdout.take(), stdout.clone()),
            spawn_reader(child.stderr.take(), stderr.clone()),
        ];
        Self {
            stdout,
            stderr,
            readers,
        }
    }

    /// Wait until both pipes reach end of file
    async fn drain(&mut self) {
        for reader in self.readers.iter_mut() {
            if !reader.is_finished() {
                let _ = reader.await;
            }
        }
    }

    fn abort(&self) {
        for reader in &self.readers {
            reader.abort();
        }
    }

    /// Stdout followed by stderr
    fn combined(&self) -> String {
        let mut bytes = self
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        bytes.extend_from_slice(&self.stderr.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Execute the encoder
///
/// Stdout and stderr are captured and attached to the error on failure. When
/// a timeout is set it bounds both the process and the draining of its
/// output; on expiry the process is killed and [`EncodeError::Timeout`] is
/// returned with whatever output was captured so far.
pub async fn run_encoder(params: &EncodeParams) -> Result<EncodeOutput, EncodeError> {
    let mut cmd = build_encoder_command(params);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        binary = %params.binary,
        args = ?params.resolved_args(),
        "running encoder"
    );

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| EncodeError::Launch {
        binary: params.binary.clone(),
        source,
    })?;
    let mut capture = OutputCapture::start(&mut child);

    let finished = async {
        let status = child.wait().await;
        capture.drain().await;
        status
    };
    let waited = match params.timeout {
        Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
        None => Some(finished.await),
    };

    let status = match waited {
        Some(status) => status.map_err(EncodeError::Wait)?,
        None => {
            let secs = params.timeout.map(|limit| limit.as_secs()).unwrap_or_default();
            warn!(secs, "encoder timed out, killing process");
            let _ = child.kill().await;
            // Processes spawned by the encoder may keep the pipes open
            let _ = tokio::time::timeout(KILL_DRAIN_GRACE, capture.drain()).await;
            capture.abort();
            return Err(EncodeError::Timeout {
                secs,
                output: capture.combined(),
            });
        }
    };

    let output = capture.combined();

    if status.success() {
        Ok(EncodeOutput {
            output,
            elapsed: started.elapsed(),
        })
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::Failed { code, output }),
            None => Err(EncodeError::Terminated { output }),
        }
    }
}
