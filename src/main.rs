#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::UdpSocket;

use ttdnsd::cli::Args;
use ttdnsd::error::{ConfigError, PrivilegeError};
use ttdnsd::forwarder::Forwarder;
use ttdnsd::peer::PeerPool;
use ttdnsd::request_table::{RequestTable, DEFAULT_CAPACITY};
use ttdnsd::roster::Roster;
use ttdnsd::DEFAULT_BIND_PORT;

/// Number of concurrently-connected upstream TCP peers. The original
/// ships with exactly one; the design permits more (spec.md §4.3).
const PEER_POOL_SIZE: usize = 1;

const DEFAULT_CHROOT_DIR: &str = "/var/run/ttdnsd";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    ttdnsd::logger::init(&args)?;

    if let Err(e) = run(args).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let port = args.effective_port();
    let will_chroot = !args.no_chroot && !args.debug;

    if (port == DEFAULT_BIND_PORT || will_chroot) && !ttdnsd::privilege::running_as_root() {
        return Err(PrivilegeError::RootRequired(port).into());
    }

    if let Some(pid_path) = &args.pid_file {
        ttdnsd::privilege::write_pid_file(pid_path)?;
    }

    let roster = Roster::load(&args.resolvers)?;
    log::info!("loaded {} upstream resolver(s) from {}", roster.len(), args.resolvers.display());

    let bind_addr = SocketAddr::new(args.bind_ip.into(), port);
    let udp = UdpSocket::bind(bind_addr)
        .await
        .map_err(|source| ConfigError::Bind { addr: bind_addr, source })?;
    log::info!("listening on udp {}", bind_addr);

    if will_chroot {
        let chroot_dir = args
            .chroot_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_CHROOT_DIR.into());
        ttdnsd::privilege::chroot_and_drop(&chroot_dir)?;
        log::info!("chrooted to {}", chroot_dir.display());
        verify_tsocks_conf_readable();
    }

    let table = RequestTable::new(DEFAULT_CAPACITY);
    let peers = PeerPool::new(PEER_POOL_SIZE);

    Forwarder::new(udp, table, peers, roster).run().await
}

/// The TCP egress is expected to be tunneled transparently (spec.md
/// §1); `TSOCKS_CONF_FILE` names that tunnel's own configuration file.
/// This process never parses it, it only checks it is readable after
/// chroot so a misconfiguration is visible in the log immediately.
fn verify_tsocks_conf_readable() {
    if let Ok(path) = std::env::var("TSOCKS_CONF_FILE") {
        if std::fs::metadata(&path).is_err() {
            log::warn!("TSOCKS_CONF_FILE={} is not readable", path);
        }
    }
}
