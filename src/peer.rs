//! Peer pool (C3, spec.md §4.3).
//!
//! Each peer is a single non-blocking TCP session to an upstream
//! resolver, framed per RFC 1035 §4.2.2 (2-byte big-endian length
//! prefix). The pool holds a small, fixed number of peers (default 1);
//! a peer is created lazily when a request needs a destination and no
//! peer is already `CONNECTED`, and torn down on EOF, send failure, or
//! failed connect.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::time::Instant;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;

/// Bytes reserved for a peer's receive buffer; matches the datagram
/// budget (1500-byte DNS payload + 2-byte length prefix) with headroom.
const RECV_BUF_CAPACITY: usize = 1502;

/// Upstream resolvers are always contacted on the standard DNS port.
const RESOLVER_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Dead,
    Connecting,
    /// Collapsed into `Connecting` in this implementation; kept as a
    /// named state so a staged-connect transport (e.g. a SOCKS
    /// handshake sitting between the raw connect and DNS traffic) has
    /// somewhere to live without renaming the public state machine.
    Connecting2,
    Connected,
}

/// What a peer's readiness future resolved to.
#[derive(Debug, Clone, Copy)]
pub enum PeerReady {
    Readable,
    Writable,
}

pub struct Peer {
    pub addr: Option<Ipv4Addr>,
    pub state: PeerState,
    stream: Option<TcpStream>,
    recv_buf: BytesMut,
    outbound: VecDeque<Vec<u8>>,
    /// Byte offset already written of `outbound.front()`.
    cursor: usize,
    pub last_activity: Instant,
}

impl Peer {
    pub fn new() -> Self {
        Self {
            addr: None,
            state: PeerState::Dead,
            stream: None,
            recv_buf: BytesMut::with_capacity(RECV_BUF_CAPACITY),
            outbound: VecDeque::new(),
            cursor: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, PeerState::Dead)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Starts a non-blocking connect to `addr:53`. A no-op if the peer
    /// is already connecting or connected. Spurious immediate errors
    /// other than "in progress" leave the peer `DEAD`.
    pub fn connect(&mut self, addr: Ipv4Addr) -> io::Result<()> {
        self.connect_to(SocketAddr::new(IpAddr::V4(addr), RESOLVER_PORT))
    }

    /// Lower-level connect taking the full remote address. `connect`
    /// is the production entry point (always port 53, per the resolver
    /// roster); this seam exists so tests can point a peer at a mock
    /// TCP listener on an arbitrary port without binding to 53.
    pub fn connect_to(&mut self, remote: SocketAddr) -> io::Result<()> {
        if matches!(self.state, PeerState::Connecting | PeerState::Connecting2 | PeerState::Connected) {
            return Ok(());
        }

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("connect to {} failed immediately: {}", remote, e);
                return Err(e);
            }
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        self.stream = Some(stream);
        self.addr = match remote.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        };
        self.state = PeerState::Connecting;
        self.last_activity = Instant::now();
        self.recv_buf.clear();
        self.outbound.clear();
        self.cursor = 0;
        Ok(())
    }

    /// Closes the peer's socket and resets it to `DEAD`.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = PeerState::Dead;
        self.addr = None;
        self.recv_buf.clear();
        self.outbound.clear();
        self.cursor = 0;
    }

    /// Reads the socket's pending error after writable-readiness fires
    /// during `CONNECTING`. Zero pending error means the non-blocking
    /// connect completed; nonzero (or a failure to even ask) closes the
    /// peer and returns `Err`.
    pub fn complete_connect(&mut self) -> io::Result<()> {
        let stream = self.stream.as_ref().expect("complete_connect on peer with no socket");
        match stream.take_error() {
            Ok(None) => {
                self.state = PeerState::Connected;
                self.last_activity = Instant::now();
                Ok(())
            }
            Ok(Some(err)) => {
                self.close();
                Err(err)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Queues a length-prefixed message for send. Actual writes happen
    /// from `drain_send` once the socket is writable; a short write
    /// leaves the remainder queued behind `cursor` rather than spinning.
    pub fn queue_send(&mut self, message: Vec<u8>) {
        self.outbound.push_back(message);
    }

    /// Attempts to drain as much of the outbound queue as the socket
    /// will currently accept without blocking. Returns `Ok(())` on a
    /// clean drain or a `WouldBlock`-terminated partial drain; any other
    /// error (or a zero-byte write) closes the peer and is returned.
    pub fn drain_send(&mut self) -> io::Result<()> {
        loop {
            let Some(front) = self.outbound.front() else {
                return Ok(());
            };

            let stream = self.stream.as_ref().expect("drain_send on peer with no socket");
            match stream.try_write(&front[self.cursor..]) {
                Ok(0) => {
                    self.close();
                    return Err(io::Error::new(ErrorKind::WriteZero, "peer wrote 0 bytes"));
                }
                Ok(n) => {
                    self.cursor += n;
                    if self.cursor == front.len() {
                        self.outbound.pop_front();
                        self.cursor = 0;
                    }
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Reads whatever is currently available into the receive buffer.
    /// EOF closes the peer. `WouldBlock` is not an error: it means
    /// "nothing more right now," and the caller should just wait for
    /// the next readiness event.
    pub fn recv_available(&mut self) -> io::Result<()> {
        let stream = self.stream.as_ref().expect("recv_available on peer with no socket");
        let mut chunk = [0u8; 4096];

        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.close();
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed connection"));
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Pulls every complete length-prefixed frame currently buffered,
    /// compacting the buffer as it goes. Multiple frames coalesced in a
    /// single TCP read are all returned, not just the first.
    pub fn drain_frames(&mut self) -> Vec<BytesMut> {
        let mut frames = Vec::new();
        loop {
            if self.recv_buf.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.recv_buf[0], self.recv_buf[1]]) as usize;
            if self.recv_buf.len() < len + 2 {
                break;
            }
            let _prefix = self.recv_buf.split_to(2);
            frames.push(self.recv_buf.split_to(len));
        }
        frames
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PeerPool {
    peers: Vec<Peer>,
}

impl PeerPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "peer pool must contain at least one peer");
        Self {
            peers: (0..size).map(|_| Peer::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, index: usize) -> &Peer {
        &self.peers[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Peer {
        &mut self.peers[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    pub fn any_connected(&self) -> Option<usize> {
        self.peers.iter().position(|p| p.state == PeerState::Connected)
    }

    pub fn first_dead(&self) -> Option<usize> {
        self.peers.iter().position(Peer::is_dead)
    }

    /// Waits for the next readiness event across the whole pool: a
    /// `CONNECTING` peer waits to become writable (the completion
    /// probe), a `CONNECTED` peer waits to become readable, and also
    /// writable if it has data queued. Peers with no live socket never
    /// contribute a future, so a pool that is entirely `DEAD` makes
    /// this resolve only when the caller races it against something
    /// else (e.g. the UDP socket) in a `select!`.
    pub async fn wait_ready(&self) -> (usize, io::Result<PeerReady>) {
        let mut futures: Vec<Pin<Box<dyn Future<Output = (usize, io::Result<PeerReady>)> + '_>>> = Vec::new();

        for (i, peer) in self.peers.iter().enumerate() {
            let Some(stream) = peer.stream.as_ref() else {
                continue;
            };

            match peer.state {
                PeerState::Connecting | PeerState::Connecting2 => {
                    futures.push(Box::pin(async move {
                        (i, stream.writable().await.map(|_| PeerReady::Writable))
                    }));
                }
                PeerState::Connected => {
                    let want_write = peer.has_pending_writes();
                    futures.push(Box::pin(async move {
                        if want_write {
                            tokio::select! {
                                r = stream.readable() => (i, r.map(|_| PeerReady::Readable)),
                                r = stream.writable() => (i, r.map(|_| PeerReady::Writable)),
                            }
                        } else {
                            (i, stream.readable().await.map(|_| PeerReady::Readable))
                        }
                    }));
                }
                PeerState::Dead => {}
            }
        }

        if futures.is_empty() {
            std::future::pending().await
        } else {
            futures::future::select_all(futures).await.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_is_dead() {
        let peer = Peer::new();
        assert!(peer.is_dead());
    }

    #[test]
    fn frame_extraction_waits_for_full_length_prefix() {
        let mut peer = Peer::new();
        peer.recv_buf.extend_from_slice(&[0x00]);
        assert!(peer.drain_frames().is_empty());
    }

    #[test]
    fn frame_extraction_waits_for_full_body() {
        let mut peer = Peer::new();
        // length says 5, but only 3 bytes of body are present
        peer.recv_buf.extend_from_slice(&[0x00, 0x05, 1, 2, 3]);
        assert!(peer.drain_frames().is_empty());
    }

    #[test]
    fn coalesced_frames_are_all_extracted_in_one_pass() {
        let mut peer = Peer::new();
        peer.recv_buf.extend_from_slice(&[0x00, 0x02, 0xAA, 0xBB]);
        peer.recv_buf.extend_from_slice(&[0x00, 0x03, 1, 2, 3]);

        let frames = peer.drain_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0xAA, 0xBB]);
        assert_eq!(&frames[1][..], &[1, 2, 3]);
        assert!(peer.recv_buf.is_empty());
    }

    #[test]
    fn partial_trailing_frame_is_left_buffered() {
        let mut peer = Peer::new();
        peer.recv_buf.extend_from_slice(&[0x00, 0x02, 0xAA, 0xBB, 0x00, 0x05, 1, 2]);
        let frames = peer.drain_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&peer.recv_buf[..], &[0x00, 0x05, 1, 2]);
    }
}
