use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::Compression;
use flate2::write::GzEncoder;

fn aborted() -> io::Error {
    io::Error::other("archive stream was aborted")
}

/// Byte sink that can be poisoned so nothing further reaches the destination.
///
/// Encoders write their trailers when dropped. Once a sink is aborted those writes fail
/// without touching the inner writer, so a half-written archive never gains an end marker.
#[derive(Debug)]
pub(crate) struct AbortableSink<W> {
    inner: W,
    aborted: AbortHandle,
}

/// Aborts a sink that is owned by an encoder without a way to reach it.
#[derive(Debug, Clone, Default)]
pub(crate) struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub(crate) fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl<W> AbortableSink<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            aborted: AbortHandle::default(),
        }
    }

    pub(crate) fn abort(&mut self) {
        self.aborted.abort();
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.aborted.clone()
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for AbortableSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.aborted.is_aborted() {
            return Err(aborted());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.aborted.is_aborted() {
            return Err(aborted());
        }
        self.inner.flush()
    }
}

impl<W: Seek> Seek for AbortableSink<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.aborted.is_aborted() {
            return Err(aborted());
        }
        self.inner.seek(pos)
    }
}

/// Gzip stream whose compression level can change between entries.
///
/// A level change finishes the current gzip member and starts a new one, so the output is a
/// multi-member gzip file. `gzip -d`, GNU tar and libarchive read it as one continuous stream.
pub(crate) struct GzStream<W: Write> {
    encoder: Option<GzEncoder<AbortableSink<W>>>,
    level: u32,
}

impl<W: Write> GzStream<W> {
    pub(crate) fn new(inner: W, level: u32) -> Self {
        Self {
            encoder: Some(GzEncoder::new(
                AbortableSink::new(inner),
                Compression::new(level),
            )),
            level,
        }
    }

    pub(crate) fn level(&self) -> u32 {
        self.level
    }

    fn encoder(&mut self) -> io::Result<&mut GzEncoder<AbortableSink<W>>> {
        self.encoder
            .as_mut()
            .ok_or_else(|| io::Error::other("gzip stream is already finished"))
    }

    fn take_encoder(&mut self) -> io::Result<GzEncoder<AbortableSink<W>>> {
        self.encoder
            .take()
            .ok_or_else(|| io::Error::other("gzip stream is already finished"))
    }

    pub(crate) fn set_level(&mut self, level: u32) -> io::Result<()> {
        if level == self.level {
            return Ok(());
        }
        let sink = self.take_encoder()?.finish()?;
        tracing::debug!("gzip level {} -> {}, starting new member", self.level, level);
        self.encoder = Some(GzEncoder::new(sink, Compression::new(level)));
        self.level = level;
        Ok(())
    }

    pub(crate) fn abort(&mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.get_mut().abort();
        }
    }

    pub(crate) fn finish(mut self) -> io::Result<W> {
        let mut sink = self.take_encoder()?.finish()?;
        sink.flush()?;
        Ok(sink.into_inner())
    }
}

impl<W: Write> Write for GzStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder()?.flush()
    }
}
