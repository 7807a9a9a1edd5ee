//! Log Reader: incremental tail of one append-only JSONL session log.
//!
//! The byte offset is the only state carried between reads. A read consumes
//! whole newline-terminated lines only; a trailing line without its newline is
//! a write still in flight and is left for the next read.

use chrono::{DateTime, Utc};
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{LogError, ParseError};
use crate::parser::parse_line;
use crate::session::ConversationEntry;

/// Identity of the file behind a path; changes when the log is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

/// A line that could not be parsed, by byte offset of its first byte.
#[derive(Debug, Clone, PartialEq)]
pub struct LineError {
    pub offset: u64,
    pub error: ParseError,
}

/// Result of one incremental read.
#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub entries: Vec<ConversationEntry>,
    /// Offset the read started from (0 after a reset).
    pub start_offset: u64,
    /// Offset just past the last complete line consumed.
    pub new_offset: u64,
    /// Bytes after `new_offset` that lack a terminating newline.
    pub trailing_incomplete: bool,
    pub errors: Vec<LineError>,
    /// Well-formed records without conversation content.
    pub skipped: usize,
    /// The file shrank or was replaced; state built from earlier reads is void.
    pub reset: bool,
    pub identity: Option<FileIdentity>,
    pub file_len: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Read every complete line appended since `offset`.
pub fn read_new(path: &Path, offset: u64) -> Result<ReadBatch, LogError> {
    read_new_checked(path, offset, None)
}

/// Like `read_new`, but also treats a changed file identity as a replacement.
///
/// Truncation and replacement restart the read from offset 0 and flag the
/// batch with `reset`.
pub fn read_new_checked(
    path: &Path,
    offset: u64,
    expected: Option<FileIdentity>,
) -> Result<ReadBatch, LogError> {
    match read_from(path, offset, expected) {
        Err(LogError::Truncated { previous, current }) => {
            tracing::warn!(
                path = %path.display(),
                old_offset = previous,
                new_file_len = current,
                "log truncated or replaced, re-reading from start"
            );
            let mut batch = read_from(path, 0, None)?;
            batch.reset = true;
            Ok(batch)
        }
        other => other,
    }
}

fn read_from(
    path: &Path,
    offset: u64,
    expected: Option<FileIdentity>,
) -> Result<ReadBatch, LogError> {
    let mut file = File::open(path).map_err(|e| LogError::from_io(path, e))?;
    let metadata = file.metadata()?;
    let file_len = metadata.len();
    let identity = FileIdentity::of(&metadata);

    if offset > file_len {
        return Err(LogError::Truncated {
            previous: offset,
            current: file_len,
        });
    }
    let replaced = matches!((expected, identity), (Some(old), Some(new)) if old != new);
    if offset > 0 && replaced {
        return Err(LogError::Truncated {
            previous: offset,
            current: file_len,
        });
    }

    let mut batch = ReadBatch {
        entries: Vec::new(),
        start_offset: offset,
        new_offset: offset,
        trailing_incomplete: false,
        errors: Vec::new(),
        skipped: 0,
        reset: false,
        identity,
        file_len,
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
    };

    if offset == file_len {
        return Ok(batch);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::with_capacity(64 * 1024, file.take(file_len - offset));
    let mut line = Vec::new();
    let mut pos = offset;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            batch.trailing_incomplete = true;
            break;
        }

        let line_offset = pos;
        pos += n as u64;

        let content = trim_line_end(&line);
        if content.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        let parsed = match std::str::from_utf8(content) {
            Ok(text) => parse_line(text),
            Err(e) => Err(ParseError::Malformed(format!("invalid utf-8: {}", e))),
        };
        match parsed {
            Ok(entry) => batch.entries.push(entry),
            Err(ParseError::Skipped(_)) => batch.skipped += 1,
            Err(error) => batch.errors.push(LineError {
                offset: line_offset,
                error,
            }),
        }
    }

    batch.new_offset = pos;
    if !batch.errors.is_empty() {
        tracing::debug!(
            path = %path.display(),
            malformed = batch.errors.len(),
            parsed = batch.entries.len(),
            "skipped malformed lines"
        );
    }
    Ok(batch)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
