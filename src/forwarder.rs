//! Event loop (C4, spec.md §4.4). Owns the UDP socket, the request
//! table and the peer pool, and is the only thing that ever touches
//! them (spec.md §5: "the request table and peer pool are process-
//! global to the core and mutated only inside the loop"). Bundling
//! them into one value instead of module-level statics is the one
//! deliberate structural change from the original noted in spec.md §9.

use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::ThreadRng;
use tokio::net::UdpSocket;

use crate::peer::{PeerPool, PeerReady, PeerState};
use crate::request_table::{InsertOutcome, RequestState, RequestTable};
use crate::roster::Roster;

/// Datagram payload budget: a typical Ethernet-MTU-sized DNS query.
/// Larger queries are truncated by the kernel at `recv_from`.
const MAX_DNS_PAYLOAD: usize = 1500;

pub struct Forwarder {
    udp: UdpSocket,
    table: RequestTable,
    peers: PeerPool,
    roster: Roster,
    rng: ThreadRng,
}

impl Forwarder {
    pub fn new(udp: UdpSocket, table: RequestTable, peers: PeerPool, roster: Roster) -> Self {
        Self {
            udp,
            table,
            peers,
            roster,
            rng: rand::rng(),
        }
    }

    /// Runs the loop until a hard I/O error prevents it from continuing
    /// (a bound UDP socket going away, essentially never in practice).
    /// Every steady-state error taxonomy member from spec.md §7 is
    /// handled inline and never escapes this function.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut udp_buf = vec![0u8; 2 + MAX_DNS_PAYLOAD];

        loop {
            tokio::select! {
                readable = self.udp.readable() => {
                    readable?;
                    self.handle_udp_readable(&mut udp_buf);
                }

                (index, ready) = self.peers.wait_ready() => {
                    self.handle_peer_ready(index, ready);
                }
            }
        }
    }

    /// UDP ingress: `recv_from` one datagram into a fresh request
    /// buffer at wire offset 2 (leaving room for the TCP length
    /// prefix), stamps the length prefix, and hands it to the table.
    fn handle_udp_readable(&mut self, udp_buf: &mut [u8]) {
        let (len, client) = match self.udp.try_recv_from(&mut udp_buf[2..]) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("udp recv error: {}", e);
                return;
            }
        };

        if len < 2 {
            log::debug!("udp datagram from {} too short to carry a transaction id, dropped", client);
            return;
        }

        let total = len as u16;
        udp_buf[0] = (total >> 8) as u8;
        udp_buf[1] = (total & 0xff) as u8;
        let buf = udp_buf[..2 + len].to_vec();

        let client_id = u16::from_be_bytes([buf[2], buf[3]]);
        self.on_query(client, client_id, buf);
    }

    fn on_query(&mut self, client: SocketAddr, client_id: u16, buf: Vec<u8>) {
        let now = Instant::now();
        let outcome = self
            .table
            .insert(client, client_id, client_id, buf, now, &mut self.rng);

        let index = match outcome {
            InsertOutcome::Inserted(index) => index,
            InsertOutcome::DuplicateDropped => {
                log::debug!("duplicate in-flight query from {} id={:#06x}, dropped", client, client_id);
                return;
            }
            InsertOutcome::TableFull => {
                log::warn!("request table full, dropping query from {} id={:#06x}", client, client_id);
                return;
            }
        };

        if let Some(peer_index) = self.peers.any_connected() {
            self.dispatch_to_peer(peer_index, index);
            return;
        }

        if self.roster.is_empty() {
            log::warn!("upstream roster is empty, dropping query from {}", client);
            self.table.release(index);
            return;
        }

        match self.peers.first_dead() {
            Some(peer_index) => {
                let Some(addr) = self.roster.select(&mut self.rng) else {
                    self.table.release(index);
                    return;
                };
                if let Err(e) = self.peers.get_mut(peer_index).connect(addr) {
                    log::warn!("connect to {} failed: {}", addr, e);
                }
            }
            None => {
                // every peer is already CONNECTING; the request stays
                // WAITING and will be drained by handle_outstanding
                // once one of them finishes connecting.
            }
        }
    }

    fn dispatch_to_peer(&mut self, peer_index: usize, table_index: usize) {
        let Some(slot) = self.table.get_mut(table_index) else {
            return;
        };
        let message = slot.buf.clone();
        slot.state = RequestState::Sent;
        self.peers.get_mut(peer_index).queue_send(message);
    }

    fn handle_peer_ready(&mut self, index: usize, ready: std::io::Result<PeerReady>) {
        let ready = match ready {
            Ok(r) => r,
            Err(e) => {
                log::warn!("peer {} readiness error: {}", index, e);
                self.peers.get_mut(index).close();
                return;
            }
        };

        match self.peers.get(index).state {
            PeerState::Connecting | PeerState::Connecting2 => self.handle_peer_connecting(index),
            PeerState::Connected => self.handle_peer_connected(index, ready),
            PeerState::Dead => {}
        }
    }

    fn handle_peer_connecting(&mut self, index: usize) {
        match self.peers.get_mut(index).complete_connect() {
            Ok(()) => {
                log::info!("peer {} connected to {:?}", index, self.peers.get(index).addr);
                self.handle_outstanding(index);
            }
            Err(e) => {
                log::warn!("peer {} failed to connect: {}", index, e);
            }
        }
    }

    fn handle_peer_connected(&mut self, index: usize, ready: PeerReady) {
        match ready {
            PeerReady::Writable => {
                if let Err(e) = self.peers.get_mut(index).drain_send() {
                    log::warn!("peer {} lost while writing: {}", index, e);
                }
            }
            PeerReady::Readable => self.handle_peer_recv(index),
        }
    }

    fn handle_peer_recv(&mut self, index: usize) {
        if let Err(e) = self.peers.get_mut(index).recv_available() {
            log::warn!("peer {} lost while reading: {}", index, e);
            return;
        }

        let frames = self.peers.get_mut(index).drain_frames();
        for frame in frames {
            self.deliver_response(&frame);
        }
    }

    /// Restores the original transaction id, forwards the answer to the
    /// originating UDP client, and evicts the table slot. A response
    /// whose id matches nothing in the table is silently discarded: it
    /// may belong to a request that already timed out or was dropped.
    fn deliver_response(&mut self, frame: &[u8]) {
        if frame.len() < 2 {
            log::debug!("upstream response too short to carry a transaction id, discarded");
            return;
        }

        let response_id = u16::from_be_bytes([frame[0], frame[1]]);
        let Some(table_index) = self.table.find(response_id) else {
            log::debug!("response id={:#06x} matches no in-flight request, discarded", response_id);
            return;
        };

        let Some(slot) = self.table.get(table_index) else {
            return;
        };
        let client = slot.client;
        let rid = slot.rid;

        let mut answer = frame.to_vec();
        answer[0] = (rid >> 8) as u8;
        answer[1] = (rid & 0xff) as u8;

        match self.udp.try_send_to(&answer, client) {
            Ok(_) => {}
            Err(e) => log::warn!("udp send to {} failed: {}", client, e),
        }

        self.table.release(table_index);
    }

    /// Scans the table for `WAITING` entries and sends each via the
    /// peer that just became `CONNECTED`. If several peers connect
    /// concurrently, all current waiters go to whichever wins first;
    /// spec.md §4.3 leaves this open and this implementation keeps
    /// that behavior.
    fn handle_outstanding(&mut self, peer_index: usize) {
        let waiting: Vec<usize> = self.table.waiting().collect();
        for table_index in waiting {
            self.dispatch_to_peer(peer_index, table_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn query_buf(id: u16, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 2 + payload_len];
        let total = payload_len as u16;
        buf[0] = (total >> 8) as u8;
        buf[1] = (total & 0xff) as u8;
        buf[2] = (id >> 8) as u8;
        buf[3] = (id & 0xff) as u8;
        buf
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let len = body.len() as u16;
        let mut out = vec![(len >> 8) as u8, (len & 0xff) as u8];
        out.extend_from_slice(body);
        out
    }

    /// Scenario 1 from spec.md §8: a single query answered end-to-end,
    /// with the client's original transaction id preserved on the way out.
    #[tokio::test]
    async fn single_query_round_trip() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let server_udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client_udp = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client_addr = client_udp.local_addr().unwrap();

        let table = RequestTable::new(7);
        let mut peers = PeerPool::new(1);
        peers.get_mut(0).connect_to(listener_addr).unwrap();

        let mut fw = Forwarder::new(server_udp, table, peers, crate::roster::Roster::from_addrs(std::iter::empty()));

        let (mut upstream, _) = listener.accept().await.unwrap();

        let (idx, ready) = fw.peers.wait_ready().await;
        fw.handle_peer_ready(idx, ready);
        assert_eq!(fw.peers.get(0).state, PeerState::Connected);

        let client_id = 0x1234u16;
        fw.on_query(client_addr, client_id, query_buf(client_id, 30));
        fw.peers.get_mut(0).drain_send().unwrap();

        let mut len_buf = [0u8; 2];
        upstream.read_exact(&mut len_buf).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        upstream.read_exact(&mut body).await.unwrap();
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), client_id);

        let mut response = vec![0u8; 48];
        response[0] = body[0];
        response[1] = body[1];
        upstream.write_all(&frame(&response)).await.unwrap();

        let (idx, ready) = fw.peers.wait_ready().await;
        fw.handle_peer_ready(idx, ready);

        let mut out = [0u8; 128];
        let (n, _) = client_udp.recv_from(&mut out).await.unwrap();
        assert_eq!(n, 48);
        assert_eq!(&out[..2], &client_id.to_be_bytes());
    }

    /// Scenario 3 from spec.md §8: two responses coalesced into a single
    /// TCP read both get delivered within the same call.
    #[tokio::test]
    async fn coalesced_responses_both_delivered() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let server_udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client_a = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client_b = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        let table = RequestTable::new(7);
        let mut peers = PeerPool::new(1);
        peers.get_mut(0).connect_to(listener_addr).unwrap();

        let mut fw = Forwarder::new(server_udp, table, peers, crate::roster::Roster::from_addrs(std::iter::empty()));

        let (mut upstream, _) = listener.accept().await.unwrap();
        let (idx, ready) = fw.peers.wait_ready().await;
        fw.handle_peer_ready(idx, ready);

        fw.on_query(client_a.local_addr().unwrap(), 0x0001, query_buf(0x0001, 10));
        fw.on_query(client_b.local_addr().unwrap(), 0x0002, query_buf(0x0002, 10));
        fw.peers.get_mut(0).drain_send().unwrap();

        // drain both queries off the mock upstream so their ids are known
        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut len_buf = [0u8; 2];
            upstream.read_exact(&mut len_buf).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            upstream.read_exact(&mut body).await.unwrap();
            ids.push(u16::from_be_bytes([body[0], body[1]]));
        }

        let mut coalesced = Vec::new();
        for id in &ids {
            let mut body = vec![0u8; 4];
            body[0] = (*id >> 8) as u8;
            body[1] = (*id & 0xff) as u8;
            coalesced.extend_from_slice(&frame(&body));
        }
        upstream.write_all(&coalesced).await.unwrap();

        let (idx, ready) = fw.peers.wait_ready().await;
        fw.handle_peer_ready(idx, ready);

        let mut out = [0u8; 64];
        let (n_a, _) = client_a.recv_from(&mut out).await.unwrap();
        assert_eq!(n_a, 4);
        let (n_b, _) = client_b.recv_from(&mut out).await.unwrap();
        assert_eq!(n_b, 4);
    }

    /// Scenario 4 from spec.md §8: a failed non-blocking connect returns
    /// the peer to DEAD without touching the table. A refused loopback
    /// connect may fail either synchronously at `connect()` or later via
    /// the writable-readiness completion probe, depending on the OS; both
    /// outcomes must leave the peer DEAD.
    #[tokio::test]
    async fn failed_connect_returns_peer_to_dead() {
        let doomed_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut peers = PeerPool::new(1);
        let failed_immediately = peers.get_mut(0).connect_to(doomed_addr).is_err();

        if failed_immediately {
            assert!(peers.get(0).is_dead());
            return;
        }

        let server_udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let table = RequestTable::new(7);
        let mut fw = Forwarder::new(server_udp, table, peers, crate::roster::Roster::from_addrs(std::iter::empty()));

        let (idx, ready) = fw.peers.wait_ready().await;
        fw.handle_peer_ready(idx, ready);
        assert!(fw.peers.get(0).is_dead());
    }
}
