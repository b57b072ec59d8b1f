//! The file-backed fingerprint store.
//!
//! One text file maps `hostname:port` labels to certificate fingerprints,
//! one entry per line. Lookups scan the file; updates rewrite it through a
//! sibling temp file and an atomic rename, so readers always observe either
//! the old or the new file and a crashed update leaves the original intact.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::error;

/// Longest line, including its newline, that may hold a store entry.
pub const MAX_LINE_LENGTH: usize = 1024;

/// The error type for fingerprint store and host verification operations.
#[derive(Debug, Error)]
pub enum KnownHostsError {
    #[error("hostname must be non-empty and shorter than 256 bytes")]
    InvalidHostname,
    #[error("no home directory available for the default known hosts file")]
    NoDefaultPath,
    #[error("stored entry for '{host}' exceeds the maximum line length")]
    EntryTooLong { host: String },
    #[error("I/O error on the known hosts file: {0}")]
    Io(#[from] io::Error),
}

/// Looks up the fingerprint stored for `host`.
///
/// A missing file or absent entry is `Ok(None)`, not an error. The stored
/// fingerprint comes back with surrounding whitespace trimmed. An entry too
/// long to have been written by the store is rejected rather than silently
/// truncated.
pub fn lookup(file: &Path, host: &str) -> Result<Option<String>, KnownHostsError> {
    let stream = match File::open(file) {
        Ok(stream) => stream,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            error!(file = %file.display(), error = %err, "failed to open known hosts file");
            return Err(err.into());
        }
    };

    for line in BufReader::new(stream).lines() {
        let line = line.inspect_err(|err| {
            error!(file = %file.display(), error = %err, "failed reading known hosts file");
        })?;
        let Some(rest) = entry_remainder(&line, host) else {
            continue;
        };
        if line.len() + 1 > MAX_LINE_LENGTH {
            return Err(KnownHostsError::EntryTooLong {
                host: host.to_string(),
            });
        }
        return Ok(Some(rest.trim().to_string()));
    }

    Ok(None)
}

/// Stores `fingerprint` for `host`, replacing any existing entry.
///
/// The containing directory is created if needed (with restrictive
/// permissions). The whole file is rewritten into a uniquely-named temp file
/// in the same directory, which is then renamed over the target; same-
/// filesystem rename makes the swap atomic. On any error the temp file is
/// removed and the original file is left untouched.
///
/// Concurrent replacers are not serialized against each other: the last
/// rename wins. Callers needing multi-process safety should hold an external
/// advisory lock around the lookup/replace pair.
pub fn replace(file: &Path, host: &str, fingerprint: &str) -> Result<(), KnownHostsError> {
    let dir = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir_restricted(dir).map_err(|err| {
        error!(dir = %dir.display(), error = %err, "failed to create known hosts directory");
        err
    })?;

    let mut out = NamedTempFile::new_in(dir).map_err(|err| {
        error!(dir = %dir.display(), error = %err, "failed to create temp file");
        err
    })?;

    match File::open(file) {
        Ok(existing) => {
            for line in BufReader::new(existing).lines() {
                let line = line?;
                if entry_remainder(&line, host).is_some() {
                    continue;
                }
                writeln!(out, "{line}")?;
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            error!(file = %file.display(), error = %err, "failed to open known hosts file");
            return Err(err.into());
        }
    }

    writeln!(out, "{host} {fingerprint}")?;
    out.flush()?;

    out.persist(file).map_err(|err| {
        error!(file = %file.display(), error = %err.error, "failed to replace known hosts file");
        err.error
    })?;
    Ok(())
}

/// Returns the remainder of `line` after `host` if the line is an entry for
/// it: the label must start the line and be followed by whitespace (or
/// nothing at all).
fn entry_remainder<'a>(line: &'a str, host: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(host)?;
    if rest.is_empty() || rest.starts_with(|c: char| c.is_ascii_whitespace()) {
        Some(rest)
    } else {
        None
    }
}

fn create_dir_restricted(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
