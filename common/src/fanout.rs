//! Single-pass fan-out of walked files into every active archive writer.

use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::archive::{ArchiveEntry, WriterSet};
use crate::walk::{self, PathRecord, PathWalker};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Walk(#[from] walk::Error),
    #[error("cannot open {path:?} for reading")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path:?} into {writer} archive")]
    Write {
        path: PathBuf,
        writer: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no archive writers to stream into")]
    NoWriters,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Abort when a walked file cannot be opened; otherwise skip it with a warning
    pub fail_fast: bool,
    /// Print `<source> -> <name>` for every file
    pub print_progress: bool,
    /// Absolute paths that are never archived, such as the archives being written
    pub exclude: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_fast: true,
            print_progress: false,
            exclude: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files: usize,
    pub bytes: u64,
    pub skipped: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files: self.files + other.files,
            bytes: self.bytes + other.bytes,
            skipped: self.skipped + other.skipped,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files archived: {}\n\
            bytes archived: {}\n\
            files skipped: {}",
            self.files,
            bytesize::ByteSize(self.bytes),
            self.skipped,
        )
    }
}

fn open_entries(record: &PathRecord, count: usize) -> Result<Vec<ArchiveEntry<'_>>, Error> {
    (0..count)
        .map(|_| {
            ArchiveEntry::open(record).map_err(|source| Error::Open {
                path: record.path.clone(),
                source,
            })
        })
        .collect()
}

/// Walks `roots` once and writes every regular file into each writer of `writers`.
///
/// Writers receive a file one after another in set order before the walk advances. On error
/// the writers are left as they are; the caller decides whether to abort or close them.
#[instrument(skip(writers), fields(writers = ?writers.labels()))]
pub fn stream(
    roots: &[PathBuf],
    base: Option<&Path>,
    writers: &mut WriterSet,
    settings: &Settings,
) -> Result<Summary, Error> {
    if writers.is_empty() {
        return Err(Error::NoWriters);
    }
    let mut summary = Summary::default();
    for record in PathWalker::new(roots.iter().cloned(), base) {
        let record = record?;
        if settings.exclude.contains(&record.path) {
            tracing::debug!("not archiving {:?} into itself", record.path);
            continue;
        }
        let entries = match open_entries(&record, writers.len()) {
            Ok(entries) => entries,
            Err(error) if !settings.fail_fast => {
                tracing::warn!("skipping {:?}: {:#}", record.path, anyhow::Error::from(error));
                summary.skipped += 1;
                continue;
            }
            Err(error) => return Err(error),
        };
        if settings.print_progress {
            println!("{} -> {}", record.path.display(), record.name);
        }
        for (named, entry) in writers.iter_mut().zip(entries) {
            named
                .writer
                .write(entry)
                .map_err(|source| Error::Write {
                    path: record.path.clone(),
                    writer: named.label.clone(),
                    source,
                })?;
        }
        tracing::trace!("archived {:?} as {:?}", record.path, record.name);
        summary.files += 1;
        summary.bytes += record.size;
    }
    Ok(summary)
}
