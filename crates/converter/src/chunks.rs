//! Chunk discovery, ordering and reassembly.
//!
//! An upload arrives as a directory of `*.chunk` files whose names embed a
//! sequence number (`chunk_1.chunk`, `c10.chunk`, ...). This module finds those
//! files, orders them by that number and concatenates them into a single file.

use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Sort key given to chunks whose name has no usable sequence number.
///
/// It is lower than every real sequence number, so such chunks are merged first.
pub const UNNUMBERED_KEY: i64 = -1;

/// Error type for merge operations
#[derive(Debug, Error)]
pub enum MergeError {
    /// The chunk directory could not be listed
    #[error("Failed to find chunks in {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        source: walkdir::Error,
    },

    /// A chunk name carries no sequence number (strict numbering only)
    #[error("Chunk {} has no sequence number in its name", .path.display())]
    UnnumberedChunk { path: PathBuf },

    /// The merged file could not be created
    #[error("Failed to create output file {}: {source}", .path.display())]
    CreateOutput { path: PathBuf, source: io::Error },

    /// A chunk could not be opened
    #[error("Failed to open chunk file {}: {source}", .path.display())]
    OpenChunk { path: PathBuf, source: io::Error },

    /// Copying a chunk into the merged file failed
    #[error("Failed to write chunk {} to merged file: {source}", .path.display())]
    CopyChunk { path: PathBuf, source: io::Error },

    /// Buffered bytes could not be flushed to the merged file
    #[error("Failed to flush merged file {}: {source}", .path.display())]
    Flush { path: PathBuf, source: io::Error },
}

/// Options controlling which files count as chunks and how strictly they are numbered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Chunk file extension without the leading dot
    pub extension: String,
    /// Reject chunks without a sequence number instead of sorting them first
    pub reject_unnumbered: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            extension: "chunk".to_string(),
            reject_unnumbered: false,
        }
    }
}

/// Outcome of a successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    /// Path of the merged file
    pub output_path: PathBuf,
    /// Number of chunks concatenated
    pub chunk_count: usize,
    /// Total bytes written to the merged file
    pub bytes_written: u64,
}

fn digit_run() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new("[0-9]+").expect("digit pattern is valid"))
}

/// Extract the sequence number embedded in a chunk's file name.
///
/// Only the base name is inspected and only its first run of ASCII digits
/// counts. Returns `None` when there is no such run or it does not fit an `i64`.
pub fn sequence_number(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_string_lossy();
    let digits = digit_run().find(&name)?;
    digits.as_str().parse().ok()
}

/// Sort key for a chunk: its sequence number, or [`UNNUMBERED_KEY`]
pub fn chunk_sort_key(path: &Path) -> i64 {
    sequence_number(path).unwrap_or(UNNUMBERED_KEY)
}

/// Whether the file name ends in `.<extension>`.
///
/// Compared on raw name bytes, so names that are not valid UTF-8 still
/// match. A bare `.<extension>` counts as well.
fn has_chunk_extension(path: &Path, extension: &str) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.as_encoded_bytes();
    let extension = extension.as_bytes();
    name.len() > extension.len()
        && name.ends_with(extension)
        && name[name.len() - extension.len() - 1] == b'.'
}

/// Whether a directory entry can be opened as a chunk.
///
/// Symlinks are resolved only here, after the name matched. A dangling link
/// is kept so that opening it fails as [`MergeError::OpenChunk`].
fn is_chunk_candidate(entry: &walkdir::DirEntry) -> bool {
    let file_type = entry.file_type();
    if file_type.is_file() {
        return true;
    }
    if file_type.is_symlink() {
        return match fs::metadata(entry.path()) {
            Ok(target) => !target.is_dir(),
            Err(_) => true,
        };
    }
    false
}

/// List the chunk files directly inside `dir` in merge order.
///
/// Entries are read non-recursively and sorted by file name first, then
/// stable-sorted by [`chunk_sort_key`], so the result does not depend on the
/// order the filesystem returns entries in. Entries whose name does not carry
/// the extension are skipped without being inspected.
pub fn discover_chunks(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, MergeError> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut chunks = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| MergeError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        if has_chunk_extension(entry.path(), extension) && is_chunk_candidate(&entry) {
            chunks.push(entry.into_path());
        }
    }

    chunks.sort_by_key(|path| chunk_sort_key(path));
    Ok(chunks)
}

/// Concatenate every chunk in `source_dir` into `output_path`.
///
/// The output is created (or truncated) before the first chunk is read. On
/// failure the partially written output is left on disk; chunk files are never
/// modified.
pub fn merge_chunks(
    source_dir: &Path,
    output_path: &Path,
    options: &MergeOptions,
) -> Result<MergeSummary, MergeError> {
    let chunks: Vec<PathBuf> = discover_chunks(source_dir, &options.extension)?
        .into_iter()
        .filter(|path| path != output_path)
        .collect();

    for chunk in chunks.iter().filter(|path| sequence_number(path).is_none()) {
        if options.reject_unnumbered {
            return Err(MergeError::UnnumberedChunk {
                path: chunk.clone(),
            });
        }
        warn!(chunk = %chunk.display(), "chunk has no sequence number, merging it first");
    }

    if chunks.is_empty() {
        warn!(path = %source_dir.display(), "no chunks found, merged file will be empty");
    }

    let output = File::create(output_path).map_err(|source| MergeError::CreateOutput {
        path: output_path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(output);

    let mut bytes_written = 0u64;
    for chunk in &chunks {
        let mut input = File::open(chunk).map_err(|source| MergeError::OpenChunk {
            path: chunk.clone(),
            source,
        })?;

        let copied = io::copy(&mut input, &mut writer).map_err(|source| {
            MergeError::CopyChunk {
                path: chunk.clone(),
                source,
            }
        })?;
        debug!(chunk = %chunk.display(), bytes = copied, "appended chunk");
        bytes_written += copied;
    }

    writer.flush().map_err(|source| MergeError::Flush {
        path: output_path.to_path_buf(),
        source,
    })?;

    Ok(MergeSummary {
        output_path: output_path.to_path_buf(),
        chunk_count: chunks.len(),
        bytes_written,
    })
}
