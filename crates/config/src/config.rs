//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder substituted with the merged input file in encoder arguments
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Placeholder substituted with the manifest output path in encoder arguments
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Chunk discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunksConfig {
    /// File extension (without the dot) that marks a chunk file
    #[serde(default = "default_chunk_extension")]
    pub extension: String,
    /// Fail the merge when a chunk name carries no sequence number
    /// instead of sorting it ahead of the numbered chunks
    #[serde(default)]
    pub reject_unnumbered: bool,
}

fn default_chunk_extension() -> String {
    "chunk".to_string()
}

impl Default for ChunksConfig {
    fn default() -> Self {
        Self {
            extension: default_chunk_extension(),
            reject_unnumbered: false,
        }
    }
}

/// Layout of the files produced inside a task directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Name of the reassembled video written next to the chunks
    #[serde(default = "default_merged_file_name")]
    pub merged_file_name: String,
    /// Name of the streaming package directory
    #[serde(default = "default_package_dir")]
    pub package_dir: String,
    /// Manifest file name inside the package directory
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
}

fn default_merged_file_name() -> String {
    "merged.mp4".to_string()
}

fn default_package_dir() -> String {
    "mpeg-dash".to_string()
}

fn default_manifest_name() -> String {
    "output.mpd".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            merged_file_name: default_merged_file_name(),
            package_dir: default_package_dir(),
            manifest_name: default_manifest_name(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable, resolved through PATH when not absolute
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// Argument template; `{input}` and `{output}` are substituted per task
    #[serde(default = "default_encoder_args")]
    pub args: Vec<String>,
    /// Seconds before a running encode is killed (0 = no limit)
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_encoder_args() -> Vec<String> {
    ["-i", INPUT_PLACEHOLDER, "-f", "dash", OUTPUT_PLACEHOLDER]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            args: default_encoder_args(),
            timeout_secs: 0,
        }
    }
}

/// Error record sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ErrorsConfig {
    /// JSON-lines file that error records are appended to, if any
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub chunks: ChunksConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CHUNK_EXTENSION -> chunks.extension
    /// - CHUNK_REJECT_UNNUMBERED -> chunks.reject_unnumbered
    /// - OUTPUT_PACKAGE_DIR -> output.package_dir
    /// - ENCODER_BINARY -> encoder.binary
    /// - ENCODER_TIMEOUT_SECS -> encoder.timeout_secs
    /// - ERROR_LOG_FILE -> errors.log_file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CHUNK_EXTENSION") {
            let ext = val.trim().trim_start_matches('.');
            if !ext.is_empty() {
                self.chunks.extension = ext.to_string();
            }
        }

        if let Ok(val) = env::var("CHUNK_REJECT_UNNUMBERED") {
            if let Some(flag) = parse_bool(&val) {
                self.chunks.reject_unnumbered = flag;
            }
        }

        if let Ok(val) = env::var("OUTPUT_PACKAGE_DIR") {
            if !val.trim().is_empty() {
                self.output.package_dir = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("ENCODER_BINARY") {
            if !val.trim().is_empty() {
                self.encoder.binary = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("ENCODER_TIMEOUT_SECS") {
            if let Ok(secs) = val.trim().parse::<u64>() {
                self.encoder.timeout_secs = secs;
            }
        }

        // An empty value disables the file sink
        if let Ok(val) = env::var("ERROR_LOG_FILE") {
            let val = val.trim();
            self.errors.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Check that the configured names and templates are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunks.extension.is_empty() {
            return Err(ConfigError::Invalid(
                "chunks.extension must not be empty".to_string(),
            ));
        }

        let names = [
            ("output.merged_file_name", &self.output.merged_file_name),
            ("output.package_dir", &self.output.package_dir),
            ("output.manifest_name", &self.output.manifest_name),
        ];
        for (key, value) in names {
            if !is_plain_name(value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a single path component, got '{}'",
                    key, value
                )));
            }
        }

        if self.output.merged_file_name == self.output.package_dir {
            return Err(ConfigError::Invalid(
                "output.merged_file_name and output.package_dir must differ".to_string(),
            ));
        }

        if self.encoder.binary.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "encoder.binary must not be empty".to_string(),
            ));
        }

        for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
            if !self.encoder.args.iter().any(|arg| arg.contains(placeholder)) {
                return Err(ConfigError::Invalid(format!(
                    "encoder.args must reference {}",
                    placeholder
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
