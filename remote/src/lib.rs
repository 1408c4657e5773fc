//! Remote command sessions.
//!
//! A [`Transport`] opens [`Connection`]s. Each connection runs exactly one command: either to
//! completion ([`Connection::run`]) or as a long-running process whose input is streamed by
//! the caller ([`Connection::spawn`]). Taking the connection by value is what keeps a second
//! command from ever being outstanding on it.

use tracing::instrument;

pub mod local;
pub mod ssh;

pub use local::LocalTransport;
pub use ssh::SshSession;

/// The commands a transfer issues on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// `mkdir -p <path>`
    MakeDir { path: String },
    /// `tar -xzf - -C <dest>`, or `tar -xf - -C <dest>` for an uncompressed stream
    Extract { dest: String, gzip: bool },
}

impl RemoteCommand {
    #[must_use]
    pub fn program(&self) -> &'static str {
        match self {
            RemoteCommand::MakeDir { .. } => "mkdir",
            RemoteCommand::Extract { .. } => "tar",
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            RemoteCommand::MakeDir { path } => vec!["-p".to_string(), path.clone()],
            RemoteCommand::Extract { dest, gzip } => vec![
                if *gzip { "-xzf" } else { "-xf" }.to_string(),
                "-".to_string(),
                "-C".to_string(),
                dest.clone(),
            ],
        }
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Joins the non-empty lines of a command's output with `; `.
fn single_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fails with the command's stderr when it did not exit successfully.
#[instrument(skip(stderr))]
pub fn check_status(
    command: &RemoteCommand,
    status: std::process::ExitStatus,
    stderr: &[u8],
) -> anyhow::Result<()> {
    if status.success() {
        tracing::debug!("`{}` succeeded", command);
        return Ok(());
    }
    anyhow::bail!(
        "remote command `{}` failed, status code: {:?}, stderr: {}",
        command,
        status.code(),
        single_line(&String::from_utf8_lossy(stderr))
    )
}

/// Opens connections to one remote endpoint.
pub trait Transport: Send + Sync {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = anyhow::Result<Self::Connection>> + Send;

    /// Human readable endpoint, such as `user@host`
    fn describe(&self) -> String;
}

/// One open session that can run a single command.
pub trait Connection: Send + Sized {
    /// Input of a spawned command; dropping it signals end of input
    type Stdin: tokio::io::AsyncWrite + Unpin + Send + 'static;
    type Process: RemoteProcess;

    /// Runs `command` to completion.
    fn run(self, command: &RemoteCommand) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Starts `command` with a piped input stream.
    fn spawn(
        self,
        command: &RemoteCommand,
    ) -> impl Future<Output = anyhow::Result<(Self::Stdin, Self::Process)>> + Send;
}

/// A spawned remote command.
pub trait RemoteProcess: Send + 'static {
    /// Waits for exit; a non-zero status is an error carrying the command's stderr.
    fn wait(self) -> impl Future<Output = anyhow::Result<()>> + Send;
}
