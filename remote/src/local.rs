//! Loopback transport: runs the remote commands on this host.
//!
//! The root directory plays the part of the remote home, so relative destinations resolve
//! against it the way they resolve against the login directory over SSH.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use tracing::instrument;

use crate::{Connection, RemoteCommand, RemoteProcess, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTransport {
    pub root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn command(&self, command: &RemoteCommand) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(command.program());
        process
            .args(command.args())
            .current_dir(&self.root)
            .kill_on_drop(true);
        process
    }
}

impl Transport for LocalTransport {
    type Connection = LocalTransport;

    async fn connect(&self) -> anyhow::Result<LocalTransport> {
        anyhow::ensure!(
            self.root.is_dir(),
            "local root {:?} is not a directory",
            self.root
        );
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

impl Connection for LocalTransport {
    type Stdin = tokio::process::ChildStdin;
    type Process = LocalProcess;

    #[instrument]
    async fn run(self, command: &RemoteCommand) -> anyhow::Result<()> {
        let output = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run `{command}`"))?;
        crate::check_status(command, output.status, &output.stderr)
    }

    #[instrument]
    async fn spawn(
        self,
        command: &RemoteCommand,
    ) -> anyhow::Result<(tokio::process::ChildStdin, LocalProcess)> {
        let mut child = self
            .command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start `{command}`"))?;
        let stdin = child
            .stdin
            .take()
            .context("failed to get stdin for local command")?;
        Ok((
            stdin,
            LocalProcess {
                child,
                command: command.clone(),
            },
        ))
    }
}

#[derive(Debug)]
pub struct LocalProcess {
    child: tokio::process::Child,
    command: RemoteCommand,
}

impl RemoteProcess for LocalProcess {
    async fn wait(self) -> anyhow::Result<()> {
        let output = self
            .child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to wait for `{}` completion", self.command))?;
        crate::check_status(&self.command, output.status, &output.stderr)
    }
}
