//! One record per peer socket.
//!
//! The send and receive halves run as independent tasks that share this
//! record. Outbound traffic is staged in `send_buf` under the state lock and
//! drained by the send loop; whichever loop exits last runs the manager's
//! cleanup.

use crate::hash::Hash256;
use crate::p2p::codec::encode_frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Dial in progress.
    Connecting,
    /// Socket up, version/verack not yet exchanged.
    Handshaking,
    /// Handshake complete, requests allowed.
    Synced,
    Closed,
}

/// Everything the two I/O loops and the manager mutate, under one lock.
pub struct ConnState {
    pub phase: ConnPhase,
    /// Fatal protocol violation or I/O error; both loops exit on sight.
    pub broken: bool,
    pub closed_recv: bool,
    pub closed_send: bool,
    /// A getheaders we sent and have not yet been answered.
    pub headers_in_flight: bool,
    /// Blocks requested from this peer, by request time.
    pub blocks_in_flight: HashMap<Hash256, Instant>,
    pub send_buf: Vec<u8>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_at: Instant,
    pub last_data_at: Instant,
    pub peer_version: u32,
    pub peer_user_agent: String,
}

const PING_SAMPLES: usize = 8;

/// Rolling window of block download latencies, used to rank peers.
#[derive(Default)]
pub struct PingStats {
    samples: Vec<u32>,
    next: usize,
}

impl PingStats {
    pub fn record(&mut self, ms: u32) {
        if self.samples.len() < PING_SAMPLES {
            self.samples.push(ms);
        } else {
            self.samples[self.next] = ms;
        }
        self.next = (self.next + 1) % PING_SAMPLES;
    }

    /// Mean of the window; `None` until the first sample.
    pub fn average(&self) -> Option<u32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|&s| s as u64).sum();
        Some((sum / self.samples.len() as u64) as u32)
    }
}

pub struct PeerConn {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    magic: [u8; 4],
    pub(crate) state: Mutex<ConnState>,
    ping: Mutex<PingStats>,
}

impl PeerConn {
    pub fn new(id: u64, addr: SocketAddr, inbound: bool, magic: [u8; 4]) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(PeerConn {
            id,
            addr,
            inbound,
            magic,
            state: Mutex::new(ConnState {
                phase: ConnPhase::Connecting,
                broken: false,
                closed_recv: false,
                closed_send: false,
                headers_in_flight: false,
                blocks_in_flight: HashMap::new(),
                send_buf: Vec::new(),
                bytes_received: 0,
                bytes_sent: 0,
                connected_at: now,
                last_data_at: now,
                peer_version: 0,
                peer_user_agent: String::new(),
            }),
            ping: Mutex::new(PingStats::default()),
        })
    }

    /// Frame a message and queue it for the send loop.
    pub fn send_msg(&self, command: &str, payload: &[u8]) {
        let frame = encode_frame(self.magic, command, payload);
        self.state.lock().send_buf.extend_from_slice(&frame);
    }

    pub fn phase(&self) -> ConnPhase {
        self.state.lock().phase
    }

    pub fn set_phase(&self, phase: ConnPhase) {
        self.state.lock().phase = phase;
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Flag the connection for teardown. Idempotent.
    pub fn set_broken(&self, reason: &str) {
        let mut st = self.state.lock();
        if !st.broken {
            st.broken = true;
            debug!(target: "p2p::conn", conn = self.id, peer = %self.addr, reason, "breaking connection");
        }
    }

    pub fn note_recv(&self, n: usize) {
        let mut st = self.state.lock();
        st.bytes_received += n as u64;
        st.last_data_at = Instant::now();
    }

    /// The receive loop has exited. True when the send loop is already gone,
    /// i.e. the caller owns cleanup.
    pub fn mark_closed_recv(&self) -> bool {
        let mut st = self.state.lock();
        st.closed_recv = true;
        st.closed_send
    }

    /// The send loop has exited. True when the receive loop is already gone.
    pub fn mark_closed_send(&self) -> bool {
        let mut st = self.state.lock();
        st.closed_send = true;
        st.closed_recv
    }

    pub fn has_block_in_flight(&self, hash: &Hash256) -> bool {
        self.state.lock().blocks_in_flight.contains_key(hash)
    }

    /// Note a block request going out. False if it was already in flight.
    pub fn mark_block_in_flight(&self, hash: Hash256) -> bool {
        self.state
            .lock()
            .blocks_in_flight
            .insert(hash, Instant::now())
            .is_none()
    }

    /// Remove an in-flight marker, returning when the request was sent.
    pub fn take_block_in_flight(&self, hash: &Hash256) -> Option<Instant> {
        self.state.lock().blocks_in_flight.remove(hash)
    }

    pub fn blocks_in_flight_count(&self) -> usize {
        self.state.lock().blocks_in_flight.len()
    }

    /// Drop in-flight markers older than `age` and return their hashes so
    /// the acquisition layer can re-request elsewhere.
    pub fn expire_blocks_in_flight(&self, age: Duration) -> Vec<Hash256> {
        let mut st = self.state.lock();
        let now = Instant::now();
        let expired: Vec<Hash256> = st
            .blocks_in_flight
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= age)
            .map(|(h, _)| *h)
            .collect();
        for h in &expired {
            st.blocks_in_flight.remove(h);
        }
        expired
    }

    pub fn record_latency(&self, ms: u32) {
        self.ping.lock().record(ms);
    }

    pub fn avg_ping(&self) -> Option<u32> {
        self.ping.lock().average()
    }
}
