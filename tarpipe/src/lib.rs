//! Stream files to a remote host as an archive over SSH - `tarpipe`
//!
//! `tarpipe` walks a set of local files and directories once and streams them straight into
//! `tar -xzf - -C <dest>` running on the remote host. Nothing is staged on the local disk unless
//! a local copy is requested.
//!
//! # Usage
//!
//! ```bash
//! # Send two directories into /srv/app, creating it first
//! tarpipe --host web1 --dest /srv/app build/ static/
//!
//! # Strip a prefix from the archive names
//! tarpipe --host web1 --dest /srv/app --base-path build build/bin build/etc
//!
//! # Keep local zip and tar.gz copies; both are also delivered to /srv/app
//! tarpipe --host web1 --dest /srv/app --create-zip --zip-name out/release.zip \
//!     --create-targz --targz-name out/release.tar.gz build/
//! ```
//!
//! # How it works
//!
//! A transfer runs in two phases:
//!
//! 1. A single walk feeds every file to the remote stream and to each requested local archive.
//! 2. Once the local archives are complete, they are appended to the remote stream without
//!    recompression, and the remote archive is finalized.
//!
//! If anything fails, the remote stream is cut off without an archive trailer, so the remote
//! `tar` exits with an error instead of accepting a truncated upload. Local archives of a failed
//! transfer are left incomplete and must not be used.
//!
//! # Modules
//!
//! - [`config`] describes one transfer
//! - [`paths`] reads path lists
//! - [`transfer`] runs the transfer state machine over any [`remote::Transport`]

pub mod config;
pub mod paths;
pub mod transfer;
