use std::io::Write;

use anyhow::{Context, Result, anyhow};

use super::sink::{AbortableSink, GzStream};
use super::{ArchiveEntry, ArchiveWriter, check_level};

fn append<W: Write>(builder: &mut tar::Builder<W>, entry: ArchiveEntry<'_>) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(entry.metadata(), tar::HeaderMode::Complete);
    let name = entry.name();
    builder
        .append_data(&mut header, name, entry.into_content())
        .with_context(|| format!("failed to append {name:?}"))
}

fn closed() -> anyhow::Error {
    anyhow!("archive is already closed")
}

/// Gzip-compressed tar written strictly front to back.
pub struct TarGzWriter<W: Write> {
    builder: Option<tar::Builder<GzStream<W>>>,
    level: u32,
}

impl<W: Write> TarGzWriter<W> {
    pub fn new(sink: W, level: u32) -> Self {
        Self {
            builder: Some(tar::Builder::new(GzStream::new(sink, level))),
            level,
        }
    }

    /// Closes the archive and hands back the sink.
    pub fn finish(mut self) -> Result<W> {
        let builder = self.builder.take().ok_or_else(closed)?;
        let stream = builder.into_inner().context("failed to write tar trailer")?;
        stream.finish().context("failed to finish gzip stream")
    }
}

impl<W: Write + Send> ArchiveWriter for TarGzWriter<W> {
    fn write(&mut self, entry: ArchiveEntry<'_>) -> Result<()> {
        append(self.builder.as_mut().ok_or_else(closed)?, entry)
    }

    fn close(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        let stream = builder.into_inner().context("failed to write tar trailer")?;
        let mut sink = stream.finish().context("failed to finish gzip stream")?;
        sink.flush().context("failed to flush archive")
    }

    fn abort(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            builder.get_mut().abort();
        }
    }

    fn set_compression_level(&mut self, level: u32) -> Result<()> {
        check_level(level)?;
        let builder = self.builder.as_mut().ok_or_else(closed)?;
        builder
            .get_mut()
            .set_level(level)
            .context("failed to switch compression level")?;
        self.level = builder.get_ref().level();
        Ok(())
    }

    fn compression_level(&self) -> u32 {
        self.level
    }
}

impl<W: Write> Drop for TarGzWriter<W> {
    fn drop(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            tracing::debug!("tar.gz writer dropped before close, aborting");
            builder.get_mut().abort();
        }
    }
}

/// Uncompressed tar.
pub struct TarWriter<W: Write> {
    builder: Option<tar::Builder<AbortableSink<W>>>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            builder: Some(tar::Builder::new(AbortableSink::new(sink))),
        }
    }
}

impl<W: Write + Send> ArchiveWriter for TarWriter<W> {
    fn write(&mut self, entry: ArchiveEntry<'_>) -> Result<()> {
        append(self.builder.as_mut().ok_or_else(closed)?, entry)
    }

    fn close(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        let mut sink = builder
            .into_inner()
            .context("failed to write tar trailer")?
            .into_inner();
        sink.flush().context("failed to flush archive")
    }

    fn abort(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            builder.get_mut().abort();
        }
    }

    fn set_compression_level(&mut self, level: u32) -> Result<()> {
        check_level(level)?;
        if level > 0 {
            tracing::debug!("plain tar ignores compression level {}", level);
        }
        Ok(())
    }

    fn compression_level(&self) -> u32 {
        0
    }
}

impl<W: Write> Drop for TarWriter<W> {
    fn drop(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            tracing::debug!("tar writer dropped before close, aborting");
            builder.get_mut().abort();
        }
    }
}
