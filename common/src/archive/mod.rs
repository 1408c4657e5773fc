//! Archive writers shared by every destination of a transfer.
//!
//! All container formats sit behind [`ArchiveWriter`], so callers never depend on a concrete
//! format. A writer only produces a complete archive when [`ArchiveWriter::close`] succeeds:
//! dropping a writer that was not closed aborts it, and aborted output never carries an
//! end-of-archive marker.

use std::io::{self, Read, Seek, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::walk::PathRecord;

mod sink;
mod tarball;
mod zipfile;

pub use tarball::{TarGzWriter, TarWriter};
pub use zipfile::ZipArchiveWriter;

/// Compression level used when none is configured
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;

/// Highest accepted compression level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Container formats a writer can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    /// Whether the format can be written to a sink that cannot seek
    #[must_use]
    pub fn is_streamable(self) -> bool {
        !matches!(self, ArchiveKind::Zip)
    }
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Tar => "tar",
        };
        write!(f, "{name}")
    }
}

/// Options applied when a writer is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// 0 stores entries, 1-9 selects a deflate level
    pub compression_level: u32,
    /// Truncate an existing archive file instead of failing
    pub overwrite: bool,
    /// Create missing parent directories of an archive file
    pub mkdir_all: bool,
    /// Store entries whose extension marks them as already compressed (zip only)
    pub selective_compression: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            overwrite: true,
            mkdir_all: true,
            selective_compression: true,
        }
    }
}

/// One file ready to be written into exactly one archive.
///
/// Each destination gets its own entry with its own open handle; the handle is closed when
/// the entry is consumed by [`ArchiveWriter::write`].
#[derive(Debug)]
pub struct ArchiveEntry<'a> {
    record: &'a PathRecord,
    reader: std::fs::File,
    metadata: std::fs::Metadata,
}

impl<'a> ArchiveEntry<'a> {
    pub fn open(record: &'a PathRecord) -> io::Result<Self> {
        let reader = std::fs::File::open(&record.path)?;
        let metadata = reader.metadata()?;
        Ok(Self {
            record,
            reader,
            metadata,
        })
    }

    #[must_use]
    pub fn name(&self) -> &'a str {
        &self.record.name
    }

    #[must_use]
    pub fn record(&self) -> &'a PathRecord {
        self.record
    }

    /// Metadata of the open handle, which is what the entry header describes
    #[must_use]
    pub fn metadata(&self) -> &std::fs::Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.metadata.len()
    }

    /// Content reader that yields exactly [`Self::size`] bytes or fails
    pub fn into_content(self) -> impl Read {
        ExactReader {
            remaining: self.metadata.len(),
            inner: self.reader,
        }
    }
}

/// Fails with `UnexpectedEof` if the file shrinks while its content is copied, so a header
/// never promises more bytes than the archive holds.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let read = self.inner.read(&mut buf[..max])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while it was being archived",
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// Capability shared by every container format.
pub trait ArchiveWriter: Send {
    /// Appends one entry after all previously written ones.
    fn write(&mut self, entry: ArchiveEntry<'_>) -> Result<()>;

    /// Writes the trailer and flushes the destination. Closing a closed writer does nothing.
    fn close(&mut self) -> Result<()>;

    /// Poisons the destination and releases it without writing a trailer.
    fn abort(&mut self);

    /// Compression level for entries written from now on.
    fn set_compression_level(&mut self, level: u32) -> Result<()>;

    fn compression_level(&self) -> u32;
}

fn check_level(level: u32) -> Result<()> {
    if level > MAX_COMPRESSION_LEVEL {
        anyhow::bail!("compression level {level} is out of range 0-{MAX_COMPRESSION_LEVEL}");
    }
    Ok(())
}

/// Opens a writer over a sink that cannot seek, such as the input of a remote command.
pub fn open_stream<W>(kind: ArchiveKind, sink: W, options: &WriterOptions) -> Result<Box<dyn ArchiveWriter>>
where
    W: Write + Send + 'static,
{
    check_level(options.compression_level)?;
    match kind {
        ArchiveKind::TarGz => Ok(Box::new(TarGzWriter::new(sink, options.compression_level))),
        ArchiveKind::Tar => Ok(Box::new(TarWriter::new(sink))),
        ArchiveKind::Zip => Err(anyhow!("{kind} archives need a seekable destination")),
    }
}

/// Creates an archive file on the local filesystem.
pub fn create_file(kind: ArchiveKind, path: &Path, options: &WriterOptions) -> Result<Box<dyn ArchiveWriter>> {
    check_level(options.compression_level)?;
    if options.mkdir_all {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
    }
    let mut open_options = std::fs::OpenOptions::new();
    open_options.write(true);
    if options.overwrite {
        open_options.create(true).truncate(true);
    } else {
        open_options.create_new(true);
    }
    let file = open_options
        .open(path)
        .with_context(|| format!("cannot create {kind} archive {path:?}"))?;
    tracing::debug!("created {} archive {:?}", kind, path);
    let file = io::BufWriter::new(file);
    match kind {
        ArchiveKind::Zip => Ok(Box::new(ZipArchiveWriter::new(file, options))),
        _ => open_stream(kind, file, options),
    }
}

/// Opens a zip writer over any seekable sink.
pub fn open_seekable<W>(sink: W, options: &WriterOptions) -> Result<Box<dyn ArchiveWriter>>
where
    W: Write + Seek + Send + 'static,
{
    check_level(options.compression_level)?;
    Ok(Box::new(ZipArchiveWriter::new(sink, options)))
}

/// A writer with the label used to identify it in errors and logs.
pub struct NamedWriter {
    pub label: String,
    pub writer: Box<dyn ArchiveWriter>,
}

impl std::fmt::Debug for NamedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedWriter")
            .field("label", &self.label)
            .field("level", &self.writer.compression_level())
            .finish()
    }
}

/// The writers active during one phase, driven in insertion order.
#[derive(Debug, Default)]
pub struct WriterSet {
    writers: Vec<NamedWriter>,
}

impl WriterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, writer: Box<dyn ArchiveWriter>) {
        self.writers.push(NamedWriter {
            label: label.into(),
            writer,
        });
    }

    pub fn extend(&mut self, other: WriterSet) {
        self.writers.extend(other.writers);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NamedWriter> {
        self.writers.iter_mut()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.writers.iter().map(|named| named.label.as_str()).collect()
    }

    /// Separates the first writer from the rest.
    #[must_use]
    pub fn split_first(mut self) -> Option<(NamedWriter, WriterSet)> {
        if self.writers.is_empty() {
            return None;
        }
        let first = self.writers.remove(0);
        Some((first, self))
    }

    /// Closes every writer in order. On the first failure the remaining writers are aborted.
    pub fn close_all(&mut self) -> Result<()> {
        let mut writers = self.writers.iter_mut();
        for named in writers.by_ref() {
            if let Err(error) = named.writer.close() {
                let error = error.context(format!("failed to finalize {} archive", named.label));
                for rest in writers {
                    rest.writer.abort();
                }
                return Err(error);
            }
            tracing::debug!("finalized {} archive", named.label);
        }
        Ok(())
    }

    pub fn abort_all(&mut self) {
        for named in &mut self.writers {
            tracing::debug!("aborting {} archive", named.label);
            named.writer.abort();
        }
    }
}

impl From<NamedWriter> for WriterSet {
    fn from(named: NamedWriter) -> Self {
        Self {
            writers: vec![named],
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Sink whose bytes stay readable after the writer that owns it is gone.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn tar_gz_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>, u32)> {
        let decoder = flate2::read::MultiGzDecoder::new(bytes);
        tar_entries_from(decoder)
    }

    pub fn tar_entries_from<R: io::Read>(reader: R) -> Vec<(String, Vec<u8>, u32)> {
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mode = entry.header().mode().unwrap();
                let mut content = Vec::new();
                io::Read::read_to_end(&mut entry, &mut content).unwrap();
                (name, content, mode)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::walk::PathWalker;
    use std::os::unix::fs::PermissionsExt;

    fn records(dir: &Path) -> Vec<PathRecord> {
        let mut records = PathWalker::new([dir.to_path_buf()], Some(dir))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(tmp.path().join("sub/b.sh"), "#!/bin/sh\necho b\n").unwrap();
        std::fs::set_permissions(
            tmp.path().join("sub/b.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        tmp
    }

    #[test]
    fn tar_gz_round_trips_content_and_mode() {
        let tmp = fixture();
        let buffer = SharedBuffer::default();
        let mut writer = open_stream(ArchiveKind::TarGz, buffer.clone(), &WriterOptions::default()).unwrap();
        for record in &records(tmp.path()) {
            writer.write(ArchiveEntry::open(record).unwrap()).unwrap();
        }
        writer.close().unwrap();
        let entries = tar_gz_entries(&buffer.bytes());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a.txt");
        assert_eq!(entries[0].1, b"alpha");
        assert_eq!(entries[1].0, "sub/b.sh");
        assert_eq!(entries[1].2 & 0o777, 0o755);
    }

    #[test]
    fn empty_archives_have_valid_trailers() {
        for kind in [ArchiveKind::TarGz, ArchiveKind::Tar] {
            let buffer = SharedBuffer::default();
            let mut writer = open_stream(kind, buffer.clone(), &WriterOptions::default()).unwrap();
            writer.close().unwrap();
            let bytes = buffer.bytes();
            assert!(!bytes.is_empty(), "{kind} archive has no trailer");
            let entries = match kind {
                ArchiveKind::TarGz => tar_gz_entries(&bytes),
                _ => tar_entries_from(&bytes[..]),
            };
            assert!(entries.is_empty());
        }
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.zip");
        let mut writer = create_file(ArchiveKind::Zip, &path, &WriterOptions::default()).unwrap();
        writer.close().unwrap();
        let archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[test]
    fn close_is_idempotent_and_write_after_close_fails() {
        let tmp = fixture();
        let records = records(tmp.path());
        let buffer = SharedBuffer::default();
        let mut writer = open_stream(ArchiveKind::TarGz, buffer.clone(), &WriterOptions::default()).unwrap();
        writer.close().unwrap();
        let len = buffer.bytes().len();
        writer.close().unwrap();
        assert_eq!(buffer.bytes().len(), len);
        assert!(writer.write(ArchiveEntry::open(&records[0]).unwrap()).is_err());
    }

    #[test]
    fn dropped_writer_emits_no_trailer() {
        let tmp = fixture();
        let records = records(tmp.path());
        let buffer = SharedBuffer::default();
        {
            let options = WriterOptions {
                compression_level: 0,
                ..WriterOptions::default()
            };
            let mut writer = open_stream(ArchiveKind::Tar, buffer.clone(), &options).unwrap();
            writer.write(ArchiveEntry::open(&records[0]).unwrap()).unwrap();
        }
        // one 512 byte header plus one padded data block, no end-of-archive blocks
        assert_eq!(buffer.bytes().len(), 1024);
    }

    #[test]
    fn aborted_tar_gz_is_not_a_complete_stream() {
        let tmp = fixture();
        let records = records(tmp.path());
        let complete = SharedBuffer::default();
        let mut writer = open_stream(ArchiveKind::TarGz, complete.clone(), &WriterOptions::default()).unwrap();
        writer.write(ArchiveEntry::open(&records[0]).unwrap()).unwrap();
        writer.close().unwrap();

        let aborted = SharedBuffer::default();
        let mut writer = open_stream(ArchiveKind::TarGz, aborted.clone(), &WriterOptions::default()).unwrap();
        writer.write(ArchiveEntry::open(&records[0]).unwrap()).unwrap();
        writer.abort();
        assert!(writer.write(ArchiveEntry::open(&records[1]).unwrap()).is_err());
        drop(writer);
        let (complete, aborted) = (complete.bytes(), aborted.bytes());
        assert!(aborted.len() < complete.len());
        assert!(complete.starts_with(&aborted));
    }

    #[test]
    fn level_zero_stores_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zeros.bin");
        std::fs::write(&path, vec![0u8; 256 * 1024]).unwrap();
        let records = records(tmp.path());
        let sizes = [0, 9].map(|level| {
            let buffer = SharedBuffer::default();
            let options = WriterOptions {
                compression_level: level,
                ..WriterOptions::default()
            };
            let mut writer = open_stream(ArchiveKind::TarGz, buffer.clone(), &options).unwrap();
            writer.write(ArchiveEntry::open(&records[0]).unwrap()).unwrap();
            writer.close().unwrap();
            buffer.bytes().len()
        });
        assert!(sizes[0] > 256 * 1024);
        assert!(sizes[1] < 16 * 1024);
    }

    #[test]
    fn level_switch_keeps_single_archive() {
        let tmp = fixture();
        let records = records(tmp.path());
        let buffer = SharedBuffer::default();
        let mut writer = open_stream(ArchiveKind::TarGz, buffer.clone(), &WriterOptions::default()).unwrap();
        writer.write(ArchiveEntry::open(&records[0]).unwrap()).unwrap();
        writer.set_compression_level(0).unwrap();
        assert_eq!(writer.compression_level(), 0);
        writer.write(ArchiveEntry::open(&records[1]).unwrap()).unwrap();
        writer.close().unwrap();
        let names = tar_gz_entries(&buffer.bytes())
            .into_iter()
            .map(|(name, _, _)| name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt", "sub/b.sh"]);
    }

    #[test]
    fn rejects_out_of_range_levels() {
        let options = WriterOptions {
            compression_level: 10,
            ..WriterOptions::default()
        };
        assert!(open_stream(ArchiveKind::TarGz, Vec::new(), &options).is_err());
        let mut writer = open_stream(ArchiveKind::TarGz, Vec::new(), &WriterOptions::default()).unwrap();
        assert!(writer.set_compression_level(12).is_err());
    }

    #[test]
    fn zip_needs_seekable_sink() {
        assert!(open_stream(ArchiveKind::Zip, Vec::new(), &WriterOptions::default()).is_err());
    }

    #[test]
    fn create_file_respects_overwrite_and_mkdir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/out.tar.gz");
        let mut writer = create_file(ArchiveKind::TarGz, &path, &WriterOptions::default()).unwrap();
        writer.close().unwrap();
        assert!(path.exists());
        let options = WriterOptions {
            overwrite: false,
            ..WriterOptions::default()
        };
        assert!(create_file(ArchiveKind::TarGz, &path, &options).is_err());
        let options = WriterOptions {
            mkdir_all: false,
            ..WriterOptions::default()
        };
        assert!(create_file(ArchiveKind::TarGz, &tmp.path().join("missing/x.tgz"), &options).is_err());
    }

    #[test]
    fn close_all_aborts_remaining_writers() {
        struct FailingClose;
        impl ArchiveWriter for FailingClose {
            fn write(&mut self, _entry: ArchiveEntry<'_>) -> Result<()> {
                Ok(())
            }
            fn close(&mut self) -> Result<()> {
                anyhow::bail!("disk full")
            }
            fn abort(&mut self) {}
            fn set_compression_level(&mut self, _level: u32) -> Result<()> {
                Ok(())
            }
            fn compression_level(&self) -> u32 {
                0
            }
        }
        let buffer = SharedBuffer::default();
        let mut set = WriterSet::new();
        set.push("broken", Box::new(FailingClose));
        set.push(
            "tail",
            open_stream(ArchiveKind::Tar, buffer.clone(), &WriterOptions::default()).unwrap(),
        );
        let error = set.close_all().unwrap_err();
        assert!(format!("{error:#}").contains("broken"));
        drop(set);
        assert!(buffer.bytes().is_empty());
    }
}
