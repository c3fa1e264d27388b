//! CLI surface (C6, spec.md §6).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

/// A single-threaded UDP-to-TCP DNS forwarding multiplexer.
#[derive(Parser, Debug)]
#[command(
    name = "ttdnsd",
    version,
    about = "Forwards UDP DNS queries to upstream resolvers over TCP"
)]
pub struct Args {
    /// local IP to bind to
    #[arg(short = 'b', default_value = "127.0.0.1")]
    pub bind_ip: Ipv4Addr,

    /// bind to port (values < 1 are ignored and the default is kept)
    #[arg(short = 'p', default_value_t = 53)]
    pub bind_port: u16,

    /// filename to read resolver IP(s) from
    #[arg(short = 'f', default_value = "ttdnsd.conf")]
    pub resolvers: PathBuf,

    /// file to store the process ID in, written before chroot
    #[arg(short = 'P')]
    pub pid_file: Option<PathBuf>,

    /// chroot(2) to <dir> instead of the default chroot directory
    #[arg(short = 'C')]
    pub chroot_dir: Option<PathBuf>,

    /// don't chroot(2) at all
    #[arg(short = 'c')]
    pub no_chroot: bool,

    /// debug: don't fork, don't chroot, log to stdout
    #[arg(short = 'd')]
    pub debug: bool,

    /// write a log to the default log file path, in addition to stdout in debug mode
    #[arg(short = 'l')]
    pub log_file: bool,
}

impl Args {
    pub fn effective_port(&self) -> u16 {
        if self.bind_port < 1 {
            crate::DEFAULT_BIND_PORT
        } else {
            self.bind_port
        }
    }
}
