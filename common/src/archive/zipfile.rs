use std::io::{Seek, Write};
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, Timelike};
use zip::CompressionMethod;
use zip::write::FileOptions;

use super::sink::{AbortHandle, AbortableSink};
use super::{ArchiveEntry, ArchiveWriter, WriterOptions, check_level};

/// Extensions of formats that are already compressed; deflating them again only costs time.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "7z", "aac", "apk", "avi", "br", "bz2", "cab", "docx", "epub", "flac", "gif", "gz", "heic",
    "jar", "jpeg", "jpg", "lz", "lz4", "lzma", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "odt",
    "ogg", "png", "pptx", "rar", "sz", "tbz2", "tgz", "txz", "webm", "webp", "xlsx", "xz", "zip",
    "zst", "zstd",
];

fn is_precompressed(name: &str) -> bool {
    let Some((_, extension)) = name.rsplit_once('.') else {
        return false;
    };
    COMPRESSED_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(extension))
}

fn zip_time(modified: std::time::SystemTime) -> Option<zip::DateTime> {
    let local: chrono::DateTime<chrono::Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        u8::try_from(local.month()).ok()?,
        u8::try_from(local.day()).ok()?,
        u8::try_from(local.hour()).ok()?,
        u8::try_from(local.minute()).ok()?,
        u8::try_from(local.second()).ok()?,
    )
    .ok()
}

/// Zip archive with per-entry compression selection.
pub struct ZipArchiveWriter<W: Write + Seek> {
    zip: Option<zip::ZipWriter<AbortableSink<W>>>,
    aborted: AbortHandle,
    level: u32,
    selective: bool,
}

impl<W: Write + Seek> ZipArchiveWriter<W> {
    pub fn new(sink: W, options: &WriterOptions) -> Self {
        let sink = AbortableSink::new(sink);
        Self {
            aborted: sink.abort_handle(),
            zip: Some(zip::ZipWriter::new(sink)),
            level: options.compression_level,
            selective: options.selective_compression,
        }
    }

    fn method_for(&self, name: &str) -> CompressionMethod {
        if self.level == 0 || (self.selective && is_precompressed(name)) {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        }
    }
}

impl<W: Write + Seek + Send> ArchiveWriter for ZipArchiveWriter<W> {
    fn write(&mut self, entry: ArchiveEntry<'_>) -> Result<()> {
        let name = entry.name();
        let method = self.method_for(name);
        let zip = self
            .zip
            .as_mut()
            .ok_or_else(|| anyhow!("archive is already closed"))?;
        let mut options = FileOptions::default()
            .compression_method(method)
            .unix_permissions(entry.metadata().mode() & 0o7777)
            .large_file(entry.size() >= u64::from(u32::MAX));
        if method == CompressionMethod::Deflated {
            options = options.compression_level(i32::try_from(self.level).ok());
        }
        if let Some(time) = entry.metadata().modified().ok().and_then(zip_time) {
            options = options.last_modified_time(time);
        }
        zip.start_file(name, options)
            .with_context(|| format!("failed to start zip entry {name:?}"))?;
        std::io::copy(&mut entry.into_content(), zip)
            .with_context(|| format!("failed to append {name:?}"))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut zip) = self.zip.take() else {
            return Ok(());
        };
        let mut sink = zip
            .finish()
            .context("failed to write zip central directory")?
            .into_inner();
        sink.flush().context("failed to flush archive")
    }

    fn abort(&mut self) {
        self.aborted.abort();
        // ZipWriter writes its central directory on drop; the poisoned sink discards it
        self.zip = None;
    }

    fn set_compression_level(&mut self, level: u32) -> Result<()> {
        check_level(level)?;
        self.level = level;
        Ok(())
    }

    fn compression_level(&self) -> u32 {
        self.level
    }
}

impl<W: Write + Seek> Drop for ZipArchiveWriter<W> {
    fn drop(&mut self) {
        if self.zip.is_some() {
            tracing::debug!("zip writer dropped before close, aborting");
            self.aborted.abort();
            self.zip = None;
        }
    }
}
