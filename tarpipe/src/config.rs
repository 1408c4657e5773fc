//! Immutable description of one transfer.

use std::path::PathBuf;

use common::archive::{ArchiveKind, MAX_COMPRESSION_LEVEL, WriterOptions};

/// Destination meaning "the remote login directory"; no directory is created for it
pub const DEFAULT_REMOTE_HOME: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no paths to transfer")]
    NoPaths,
    #[error("destination path is empty")]
    EmptyDestination,
    #[error("compression level {0} is out of range 0-{MAX_COMPRESSION_LEVEL}")]
    CompressionLevel(u32),
    #[error("remote stream cannot be a {0} archive")]
    RemoteFormat(ArchiveKind),
    #[error("local {0} archive requires a file name")]
    MissingArtifactName(ArchiveKind),
    #[error("local {0} archives are not supported")]
    ArtifactFormat(ArchiveKind),
    #[error("local {kind} archive path {path:?} does not name a file")]
    ArtifactPath { kind: ArchiveKind, path: PathBuf },
    #[error("local {0} archive requested more than once")]
    DuplicateArtifact(ArchiveKind),
    #[error("local archives {first:?} and {second:?} would both be delivered as {name:?}")]
    ArtifactNameClash {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// A local archive produced alongside the remote stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub kind: ArchiveKind,
    pub path: PathBuf,
}

impl LocalArtifact {
    /// Pairs an artifact flag with its file name; a requested artifact must be named.
    pub fn requested(
        kind: ArchiveKind,
        requested: bool,
        name: Option<PathBuf>,
    ) -> Result<Option<Self>, Error> {
        match (requested, name) {
            (false, _) => Ok(None),
            (true, None) => Err(Error::MissingArtifactName(kind)),
            (true, Some(path)) => Ok(Some(Self { kind, path })),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Files and directories to send
    pub paths: Vec<PathBuf>,
    /// Prefix removed from archive names
    pub base_path: Option<PathBuf>,
    /// Extraction directory on the remote host
    pub dest: String,
    /// Run `mkdir -p <dest>` before extracting
    pub prepare_destination: bool,
    /// Format of the remote stream: tar.gz, or plain tar
    pub remote_format: ArchiveKind,
    /// Level for the remote stream and the local artifacts
    pub compression_level: u32,
    pub artifacts: Vec<LocalArtifact>,
    /// Replace existing local artifacts instead of failing
    pub overwrite: bool,
    pub print_progress: bool,
}

impl TransferConfig {
    pub fn new(paths: Vec<PathBuf>, dest: impl Into<String>) -> Self {
        Self {
            paths,
            base_path: None,
            dest: dest.into(),
            prepare_destination: true,
            remote_format: ArchiveKind::TarGz,
            compression_level: common::archive::DEFAULT_COMPRESSION_LEVEL,
            artifacts: Vec::new(),
            overwrite: true,
            print_progress: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.paths.is_empty() {
            return Err(Error::NoPaths);
        }
        if self.dest.trim().is_empty() {
            return Err(Error::EmptyDestination);
        }
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(Error::CompressionLevel(self.compression_level));
        }
        if !self.remote_format.is_streamable() {
            return Err(Error::RemoteFormat(self.remote_format));
        }
        let mut seen = Vec::new();
        let mut delivered: Vec<&LocalArtifact> = Vec::new();
        for artifact in &self.artifacts {
            if !matches!(artifact.kind, ArchiveKind::Zip | ArchiveKind::TarGz) {
                return Err(Error::ArtifactFormat(artifact.kind));
            }
            let Some(name) = artifact.path.file_name() else {
                return Err(Error::ArtifactPath {
                    kind: artifact.kind,
                    path: artifact.path.clone(),
                });
            };
            if seen.contains(&artifact.kind) {
                return Err(Error::DuplicateArtifact(artifact.kind));
            }
            seen.push(artifact.kind);
            // artifacts land in the destination under their file name
            if let Some(other) = delivered
                .iter()
                .find(|other| other.path.file_name() == Some(name))
            {
                return Err(Error::ArtifactNameClash {
                    name: name.to_string_lossy().into_owned(),
                    first: other.path.clone(),
                    second: artifact.path.clone(),
                });
            }
            delivered.push(artifact);
        }
        Ok(())
    }

    /// Whether destination preparation runs before streaming
    #[must_use]
    pub fn needs_mkdir(&self) -> bool {
        self.prepare_destination && self.dest != DEFAULT_REMOTE_HOME
    }

    /// Local artifacts in the order they are written and appended: zip, then tar.gz
    #[must_use]
    pub fn ordered_artifacts(&self) -> Vec<LocalArtifact> {
        let mut artifacts = self.artifacts.clone();
        artifacts.sort_by_key(|artifact| artifact.kind);
        artifacts
    }

    #[must_use]
    pub fn remote_options(&self) -> WriterOptions {
        WriterOptions {
            compression_level: self.compression_level,
            ..WriterOptions::default()
        }
    }

    #[must_use]
    pub fn local_options(&self) -> WriterOptions {
        WriterOptions {
            compression_level: self.compression_level,
            overwrite: self.overwrite,
            mkdir_all: true,
            selective_compression: true,
        }
    }
}
