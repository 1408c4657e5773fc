use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::instrument;

use crate::{Connection, RemoteCommand, RemoteProcess, Transport};

/// SSH endpoint and the credentials used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Private key; the ssh client configuration decides when unset
    pub identity: Option<PathBuf>,
    /// Known hosts file; the ssh client configuration decides when unset
    pub known_hosts: Option<PathBuf>,
    /// Reject hosts whose key is unknown or changed
    pub verify_host_key: bool,
    pub connect_timeout: Duration,
}

impl SshSession {
    pub const DEFAULT_USER: &'static str = "root";
    pub const DEFAULT_PORT: u16 = 22;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            user: Self::DEFAULT_USER.to_string(),
            host: host.into(),
            port: Self::DEFAULT_PORT,
            identity: None,
            known_hosts: None,
            verify_host_key: true,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn builder(&self) -> openssh::SessionBuilder {
        let mut builder = openssh::SessionBuilder::default();
        builder
            .user(self.user.clone())
            .port(self.port)
            .connect_timeout(self.connect_timeout);
        if let Some(identity) = &self.identity {
            builder.keyfile(identity);
        }
        if self.verify_host_key {
            builder.known_hosts_check(openssh::KnownHosts::Strict);
            if let Some(known_hosts) = &self.known_hosts {
                builder.user_known_hosts_file(known_hosts);
            }
        } else {
            tracing::warn!("host key verification is disabled for {}", self.host);
            builder
                .known_hosts_check(openssh::KnownHosts::Add)
                .user_known_hosts_file("/dev/null");
        }
        builder
    }
}

impl Transport for SshSession {
    type Connection = SshConnection;

    #[instrument]
    async fn connect(&self) -> anyhow::Result<SshConnection> {
        tracing::debug!("connecting to {}:{}", self.host, self.port);
        let session = self
            .builder()
            .connect(&self.host)
            .await
            .with_context(|| format!("failed to establish SSH connection to {}", self.describe()))?;
        Ok(SshConnection {
            session: Arc::new(session),
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

async fn close_session(session: Arc<openssh::Session>) {
    match Arc::try_unwrap(session) {
        Ok(session) => {
            if let Err(error) = session.close().await {
                tracing::warn!("failed to close SSH session cleanly: {:#}", error);
            }
        }
        Err(_) => tracing::debug!("SSH session still shared, leaving it to drop"),
    }
}

#[derive(Debug)]
pub struct SshConnection {
    session: Arc<openssh::Session>,
}

impl Connection for SshConnection {
    type Stdin = openssh::ChildStdin;
    type Process = SshProcess;

    #[instrument(skip(self))]
    async fn run(self, command: &RemoteCommand) -> anyhow::Result<()> {
        tracing::info!("running `{}`", command);
        let mut remote = Arc::clone(&self.session).arc_command(command.program());
        remote.args(command.args());
        let output = remote
            .output()
            .await
            .with_context(|| format!("failed to run `{command}` on remote host"))?;
        drop(remote);
        let status = crate::check_status(command, output.status, &output.stderr);
        close_session(self.session).await;
        status
    }

    #[instrument(skip(self))]
    async fn spawn(self, command: &RemoteCommand) -> anyhow::Result<(openssh::ChildStdin, SshProcess)> {
        tracing::info!("starting `{}`", command);
        let mut remote = Arc::clone(&self.session).arc_command(command.program());
        remote
            .args(command.args())
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::null())
            .stderr(openssh::Stdio::piped());
        let mut child = remote
            .spawn()
            .await
            .with_context(|| format!("failed to start `{command}` on remote host"))?;
        let stdin = child
            .stdin()
            .take()
            .context("failed to get stdin for remote command")?;
        Ok((
            stdin,
            SshProcess {
                child,
                session: self.session,
                command: command.clone(),
            },
        ))
    }
}

#[derive(Debug)]
pub struct SshProcess {
    child: openssh::Child<Arc<openssh::Session>>,
    session: Arc<openssh::Session>,
    command: RemoteCommand,
}

impl RemoteProcess for SshProcess {
    #[instrument(skip(self), fields(command = %self.command))]
    async fn wait(self) -> anyhow::Result<()> {
        tracing::info!("waiting on `{}`", self.command);
        let output = self
            .child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to wait for `{}` completion", self.command))?;
        let status = crate::check_status(&self.command, output.status, &output.stderr);
        close_session(self.session).await;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli() {
        let session = SshSession::new("example.com");
        assert_eq!(session.user, "root");
        assert_eq!(session.port, 22);
        assert_eq!(session.connect_timeout, Duration::from_secs(60));
        assert!(session.verify_host_key);
        assert_eq!(session.describe(), "root@example.com");
    }
}
