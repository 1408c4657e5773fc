use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::archive::{ArchiveKind, DEFAULT_COMPRESSION_LEVEL};
use tracing::instrument;

use tarpipe::config::{LocalArtifact, TransferConfig};
use tarpipe::transfer::{Report, transfer};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tarpipe",
    version,
    about = "Stream files to a remote host as a tar.gz over SSH",
    long_about = "`tarpipe` walks local files and directories once and streams them into `tar -xzf -` on a remote host.

Optionally writes local zip and tar.gz archives of the same files during the same walk. Those archives are \
then appended, without recompression, to the remote stream so they land in the destination directory too.

EXAMPLES:
    # Upload a build directory
    tarpipe --host web1 --dest /srv/app build/

    # Strip the build/ prefix and keep a local zip
    tarpipe --host web1 --dest /srv/app --base-path build --create-zip --zip-name release.zip build/

    # Read the paths from a file
    tarpipe --host web1 --dest /srv/app --from-file files.txt"
)]
struct Args {
    // Remote host
    /// Remote host name or address
    #[arg(
        long,
        value_name = "HOST",
        required_unless_present = "local_root",
        help_heading = "Remote host"
    )]
    host: Option<String>,

    /// Login user
    #[arg(long, default_value = remote::SshSession::DEFAULT_USER, value_name = "USER", help_heading = "Remote host")]
    user: String,

    /// SSH port
    #[arg(long, default_value_t = remote::SshSession::DEFAULT_PORT, value_name = "PORT", help_heading = "Remote host")]
    port: u16,

    /// Private key used to authenticate
    #[arg(short = 'i', long, value_name = "FILE", help_heading = "Remote host")]
    identity: Option<PathBuf>,

    /// Known hosts file used to verify the host key
    #[arg(long, value_name = "FILE", help_heading = "Remote host")]
    known_hosts: Option<PathBuf>,

    /// Accept any host key
    ///
    /// Only meant for throwaway hosts: the connection is open to man-in-the-middle attacks.
    #[arg(long, help_heading = "Remote host")]
    no_verify_host_key: bool,

    /// SSH connection timeout
    ///
    /// Accepts human-readable durations like "30s", "2m".
    #[arg(long, default_value = "1m", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Remote host")]
    connect_timeout: Duration,

    /// Run the remote commands on this machine, inside the given directory, instead of over SSH
    #[arg(long, value_name = "DIR", help_heading = "Remote host")]
    local_root: Option<PathBuf>,

    // Transfer options
    /// Extraction directory on the remote host ("." is the login directory)
    #[arg(short, long, value_name = "DIR", help_heading = "Transfer options")]
    dest: String,

    /// Prefix removed from the archive names of the transferred files
    #[arg(long, value_name = "DIR", help_heading = "Transfer options")]
    base_path: Option<PathBuf>,

    /// Do not create the destination directory before extracting
    #[arg(long, help_heading = "Transfer options")]
    skip_mkdir: bool,

    /// Compression level, 0 (store) to 9
    #[arg(
        long,
        default_value_t = DEFAULT_COMPRESSION_LEVEL,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(0..=9),
        help_heading = "Transfer options"
    )]
    compression_level: u32,

    /// Send a plain tar stream instead of tar.gz
    #[arg(long, help_heading = "Transfer options")]
    no_compress: bool,

    /// Read the paths to transfer from a file, one per line
    #[arg(long, value_name = "FILE", conflicts_with = "paths", help_heading = "Transfer options")]
    from_file: Option<PathBuf>,

    // Local archives
    /// Also write a local zip archive of the transferred files
    #[arg(long, requires = "zip_name", help_heading = "Local archives")]
    create_zip: bool,

    /// Path of the local zip archive
    #[arg(long, value_name = "FILE", requires = "create_zip", help_heading = "Local archives")]
    zip_name: Option<PathBuf>,

    /// Also write a local tar.gz archive of the transferred files
    #[arg(long, requires = "targz_name", help_heading = "Local archives")]
    create_targz: bool,

    /// Path of the local tar.gz archive
    #[arg(long, value_name = "FILE", requires = "create_targz", help_heading = "Local archives")]
    targz_name: Option<PathBuf>,

    /// Fail instead of replacing existing local archives
    #[arg(long, help_heading = "Local archives")]
    no_overwrite: bool,

    // Progress & output
    /// Print each file as it is archived
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Files and directories to transfer
    #[arg()]
    paths: Vec<PathBuf>,
}

impl Args {
    fn artifacts(&self) -> anyhow::Result<Vec<LocalArtifact>> {
        let requested = [
            LocalArtifact::requested(ArchiveKind::Zip, self.create_zip, self.zip_name.clone())?,
            LocalArtifact::requested(ArchiveKind::TarGz, self.create_targz, self.targz_name.clone())?,
        ];
        Ok(requested.into_iter().flatten().collect())
    }

    fn ssh_session(&self, host: &str) -> remote::SshSession {
        remote::SshSession {
            user: self.user.clone(),
            port: self.port,
            identity: self.identity.clone(),
            known_hosts: self.known_hosts.clone(),
            verify_host_key: !self.no_verify_host_key,
            connect_timeout: self.connect_timeout,
            ..remote::SshSession::new(host)
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<Report> {
    let paths = match &args.from_file {
        Some(list) => tarpipe::paths::read_path_list(list).await?,
        None => args.paths.clone(),
    };
    let mut config = TransferConfig::new(paths, args.dest.clone());
    config.base_path = args.base_path.clone();
    config.prepare_destination = !args.skip_mkdir;
    config.remote_format = if args.no_compress {
        ArchiveKind::Tar
    } else {
        ArchiveKind::TarGz
    };
    config.compression_level = args.compression_level;
    config.artifacts = args.artifacts()?;
    config.overwrite = !args.no_overwrite;
    config.print_progress = args.progress;

    let (report, endpoint) = match (&args.local_root, &args.host) {
        (Some(root), _) => {
            let transport = remote::LocalTransport::new(root);
            (transfer(&config, &transport).await?, transport.root.display().to_string())
        }
        (None, Some(host)) => {
            let transport = args.ssh_session(host);
            let endpoint = remote::Transport::describe(&transport);
            (transfer(&config, &transport).await?, endpoint)
        }
        (None, None) => anyhow::bail!("either --host or --local-root must be given"),
    };
    if !args.quiet {
        println!("successfully uploaded to {}:{}", endpoint, config.dest);
    }
    Ok(report)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
