//! Error taxonomy (spec.md §7).
//!
//! `ConfigError` and `PrivilegeError` are fatal: they terminate startup
//! and are surfaced through `anyhow` at the `main` boundary. Everything
//! else (`PeerLost`, `TableFull`, `UnknownResponseId`) is recovered
//! locally inside the event loop and only ever reaches `log::warn!`.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot bind UDP socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot read resolver file {path}: {source}")]
    ResolverFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("resolver file {0} contained no usable upstream addresses")]
    EmptyRoster(PathBuf),

    #[error("invalid command line arguments: {0}")]
    Cli(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("must run as root to bind port {0} or to chroot")]
    RootRequired(u16),

    #[error("chroot to {path} failed: {source}")]
    Chroot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("dropping privileges to nobody:nogroup failed: {0}")]
    Drop(io::Error),

    #[error("cannot write PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
