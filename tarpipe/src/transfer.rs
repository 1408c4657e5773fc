//! The transfer state machine.
//!
//! ```text
//! Init -> EnsureDest -> Phase1Stream -> Phase1Drain -> Phase2Decide -> [Phase2Stream] -> Done
//!                                  any error -> Failed
//! ```
//!
//! One walk feeds the remote extraction command together with the optional local zip and
//! tar.gz artifacts. Once the local artifacts are complete they are appended, stored without
//! recompression, to the same remote archive before it is finalized.
//!
//! Archive encoders are synchronous. They run on blocking threads and reach the remote
//! command's input through [`SyncIoBridge`], whose buffer bounds how far the walk can get
//! ahead of the remote side.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use common::archive::{self, ArchiveKind, NamedWriter, WriterSet};
use common::fanout::{self, Summary};
use common::phase::Phase;
use common::walk;
use remote::{Connection, RemoteCommand, RemoteProcess, Transport};
use tokio_util::io::SyncIoBridge;
use tracing::instrument;

use crate::config::{LocalArtifact, TransferConfig};

/// How long a failed transfer waits for the remote command to exit once its input is closed
const REMOTE_EXIT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    EnsureDest,
    Phase1Stream,
    Phase1Drain,
    Phase2Decide,
    Phase2Stream,
    Done,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Init => "INIT",
            State::EnsureDest => "ENSURE_DEST",
            State::Phase1Stream => "PHASE1_STREAM",
            State::Phase1Drain => "PHASE1_DRAIN",
            State::Phase2Decide => "PHASE2_DECIDE",
            State::Phase2Stream => "PHASE2_STREAM",
            State::Done => "DONE",
            State::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

fn enter(state: State) {
    tracing::info!("transfer state: {}", state);
}

/// What the remote phase's tasks produce.
#[derive(Debug)]
enum RemoteOutcome {
    /// The extraction command exited successfully
    Extracted,
    /// The remote archive was finalized without appending anything
    Finalized,
    /// Local artifacts were appended, then the remote archive was finalized
    Appended(Summary),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Files sent by the first pass
    pub streamed: Summary,
    /// Local artifacts appended by the second pass, if any were produced
    pub appended: Option<Summary>,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.streamed)?;
        if let Some(appended) = &self.appended {
            write!(f, "\nlocal archives appended: {}", appended.files)?;
        }
        Ok(())
    }
}

/// Runs one transfer described by `config` over `transport`.
#[instrument(skip(transport), fields(remote = %transport.describe()))]
pub async fn transfer<T: Transport>(config: &TransferConfig, transport: &T) -> Result<Report> {
    let result = run(config, transport).await;
    match &result {
        Ok(_) => enter(State::Done),
        Err(error) => tracing::info!("transfer state: {}: {:#}", State::Failed, error),
    }
    result
}

async fn run<T: Transport>(config: &TransferConfig, transport: &T) -> Result<Report> {
    enter(State::Init);
    config.validate().context("invalid transfer configuration")?;

    enter(State::EnsureDest);
    ensure_destination(config, transport).await?;

    enter(State::Phase1Stream);
    // local artifacts first: an unwritable artifact fails before the remote side is touched
    let artifacts = config.ordered_artifacts();
    let exclude = artifacts
        .iter()
        .map(|artifact| walk::absolute(&artifact.path))
        .collect::<Result<Vec<_>, _>>()?;
    let locals = {
        let artifacts = artifacts.clone();
        let options = config.local_options();
        tokio::task::spawn_blocking(move || create_local_writers(&artifacts, &options))
            .await
            .context("local archive setup did not complete")??
    };
    let connection = transport
        .connect()
        .await
        .context("failed to open session for extraction")?;
    let command = RemoteCommand::Extract {
        dest: config.dest.clone(),
        gzip: config.remote_format == ArchiveKind::TarGz,
    };
    let (stdin, process) = connection.spawn(&command).await?;
    let mut remote_phase = Phase::new("remote", 2);
    remote_phase.spawn(async move {
        process.wait().await?;
        Ok(RemoteOutcome::Extracted)
    })?;
    let remote_writer = archive::open_stream(
        config.remote_format,
        SyncIoBridge::new(stdin),
        &config.remote_options(),
    )?;
    let mut writers = WriterSet::new();
    writers.push(format!("remote {}", config.remote_format), remote_writer);
    writers.extend(locals);

    let settings = fanout::Settings {
        fail_fast: true,
        print_progress: config.print_progress,
        exclude,
    };
    let mut stream_phase = Phase::new("stream", 1);
    {
        let roots = config.paths.clone();
        let base = config.base_path.clone();
        let settings = settings.clone();
        stream_phase.spawn_blocking(move || {
            match fanout::stream(&roots, base.as_deref(), &mut writers, &settings) {
                Ok(summary) => Ok((summary, writers)),
                Err(error) => {
                    writers.abort_all();
                    Err(error.into())
                }
            }
        })?;
    }

    enter(State::Phase1Drain);
    let (streamed, writers) = match stream_phase.wait().await {
        Ok(mut outputs) => outputs.pop().context("stream phase produced no output")?,
        Err(error) => return Err(abandon(remote_phase, error).await),
    };
    tracing::info!("streamed {} file(s)", streamed.files);
    let Some((remote_writer, mut locals)) = writers.split_first() else {
        anyhow::bail!("remote writer missing after streaming");
    };
    let drained = tokio::task::spawn_blocking(move || locals.close_all())
        .await
        .context("finalizing local archives did not complete")
        .and_then(|closed| closed);
    if let Err(error) = drained {
        drop(remote_writer);
        return Err(abandon(remote_phase, error).await);
    }

    enter(State::Phase2Decide);
    let appended_paths: Vec<PathBuf> = artifacts.into_iter().map(|artifact| artifact.path).collect();
    if appended_paths.is_empty() {
        remote_phase.spawn_blocking(move || finalize_remote(remote_writer))?;
    } else {
        enter(State::Phase2Stream);
        remote_phase.spawn_blocking(move || append_artifacts(remote_writer, &appended_paths, &settings))?;
    }

    let outcomes = remote_phase.wait().await?;
    let appended = outcomes.into_iter().find_map(|outcome| match outcome {
        RemoteOutcome::Appended(summary) => Some(summary),
        RemoteOutcome::Extracted | RemoteOutcome::Finalized => None,
    });
    Ok(Report { streamed, appended })
}

#[instrument(skip(config, transport))]
async fn ensure_destination<T: Transport>(config: &TransferConfig, transport: &T) -> Result<()> {
    if !config.needs_mkdir() {
        tracing::info!("destination {:?} needs no preparation", config.dest);
        return Ok(());
    }
    let connection = transport
        .connect()
        .await
        .context("failed to open session for destination preparation")?;
    connection
        .run(&RemoteCommand::MakeDir {
            path: config.dest.clone(),
        })
        .await
        .with_context(|| format!("failed to create remote directory {:?}", config.dest))
}

fn create_local_writers(artifacts: &[LocalArtifact], options: &archive::WriterOptions) -> Result<WriterSet> {
    let mut writers = WriterSet::new();
    for artifact in artifacts {
        let writer = archive::create_file(artifact.kind, &artifact.path, options)?;
        writers.push(format!("local {} {:?}", artifact.kind, artifact.path), writer);
    }
    Ok(writers)
}

fn finalize_remote(mut remote: NamedWriter) -> Result<RemoteOutcome> {
    remote
        .writer
        .close()
        .with_context(|| format!("failed to finalize {} archive", remote.label))?;
    Ok(RemoteOutcome::Finalized)
}

/// Appends the finished local archives to the still-open remote archive, then closes it.
///
/// Each archive is stored under its file name, whatever directory it was written to.
fn append_artifacts(remote: NamedWriter, paths: &[PathBuf], settings: &fanout::Settings) -> Result<RemoteOutcome> {
    let mut writers = WriterSet::from(remote);
    for named in writers.iter_mut() {
        // the artifacts are compressed already
        named.writer.set_compression_level(0)?;
    }
    let settings = fanout::Settings {
        exclude: Vec::new(),
        ..settings.clone()
    };
    let mut appended = Summary::default();
    for path in paths {
        let base = path.parent().filter(|parent| !parent.as_os_str().is_empty());
        appended = appended + fanout::stream(std::slice::from_ref(path), base, &mut writers, &settings)?;
    }
    writers.close_all()?;
    Ok(RemoteOutcome::Appended(appended))
}

/// Gives the remote command a bounded time to exit after its input was closed, then lets go.
///
/// A remote failure is attached to `error`: when the remote command dies first, the local
/// side usually only sees a broken pipe.
async fn abandon(remote_phase: Phase<RemoteOutcome>, error: anyhow::Error) -> anyhow::Error {
    match tokio::time::timeout(REMOTE_EXIT_GRACE, remote_phase.wait()).await {
        Ok(Ok(_)) => {
            tracing::warn!("remote command exited successfully after the transfer failed");
            error
        }
        Ok(Err(remote_error)) => {
            tracing::debug!("remote side: {:#}", remote_error);
            error.context(format!("remote side: {remote_error:#}"))
        }
        Err(_) => {
            tracing::warn!(
                "remote command did not exit within {:?}, abandoning it",
                REMOTE_EXIT_GRACE
            );
            error
        }
    }
}
