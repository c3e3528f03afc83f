//! Peer networking: connection lifecycle, message dispatch, admission
//! control, and the single task that feeds received blocks into the chain.
//!
//! Each peer gets one [`PeerConn`] and two tokio tasks (receive and send)
//! that poll with short deadlines so the abort and broken flags are observed
//! promptly. Whichever task exits last removes the connection from the
//! manager. Block commits are serialized through one mpsc channel into
//! [`SyncNode::run_chain_task`].

pub mod codec;
pub mod connection;

mod acquisition;
mod responder;

use crate::chain::block::Block;
use crate::chain::Chain;
use crate::config::Config;
use crate::counters::Counters;
use crate::external::{AddrPool, BlockStore, TxPool};
use crate::hash::Hash256;
use codec::{
    build_version_payload, parse_addr_payload, parse_inv, parse_version_payload, FrameDecoder,
    RawMessage, VersionInfo, INV_BLOCK, INV_TX,
};
use connection::{ConnPhase, PeerConn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub(crate) struct ReceivedBlockMsg {
    pub(crate) conn_id: u64,
    pub(crate) block: Block,
    pub(crate) raw: Vec<u8>,
}

/// Everything the chain task reacts to. Tip movement happens only on this
/// task, so a header batch that completes a downloaded branch must pass
/// through here as well.
pub(crate) enum ChainEvent {
    Block(ReceivedBlockMsg),
    HeadersAttached,
}

pub struct SyncNode {
    pub(crate) cfg: Config,
    pub(crate) counters: Arc<Counters>,
    pub(crate) chain: Arc<Chain>,
    pub(crate) blocks: Arc<dyn BlockStore>,
    pub(crate) txs: Arc<dyn TxPool>,
    pub(crate) addrs: Arc<dyn AddrPool>,
    pub(crate) conns: Mutex<HashMap<u64, Arc<PeerConn>>>,
    pub(crate) acquisition: acquisition::Acquisition,
    abort: Arc<AtomicBool>,
    headers_done: AtomicBool,
    next_conn_id: AtomicU64,
    block_tx: mpsc::UnboundedSender<ChainEvent>,
    block_rx: Mutex<Option<mpsc::UnboundedReceiver<ChainEvent>>>,
}

impl SyncNode {
    pub fn new(
        cfg: Config,
        chain: Arc<Chain>,
        blocks: Arc<dyn BlockStore>,
        txs: Arc<dyn TxPool>,
        addrs: Arc<dyn AddrPool>,
        abort: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let (block_tx, block_rx) = mpsc::unbounded_channel();
        Arc::new(SyncNode {
            cfg,
            counters,
            chain,
            blocks,
            txs,
            addrs,
            conns: Mutex::new(HashMap::new()),
            acquisition: acquisition::Acquisition::default(),
            abort,
            headers_done: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            block_tx,
            block_rx: Mutex::new(Some(block_rx)),
        })
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Raise the abort flag and break every connection. The polling loops
    /// notice within one deadline.
    pub fn close_all(&self) {
        self.abort.store(true, Ordering::Relaxed);
        for conn in self.conns.lock().values() {
            conn.set_broken("shutting down");
        }
    }

    pub fn headers_done(&self) -> bool {
        self.headers_done.load(Ordering::Relaxed)
    }

    /// Leave the headers phase: connection caps widen and the request loops
    /// switch from getheaders to getdata.
    pub fn mark_all_headers_done(&self) {
        if !self.headers_done.swap(true, Ordering::Relaxed) {
            info!(target: "p2p::sync", "headers phase complete");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.conns.lock().values().any(|c| c.addr == addr)
    }

    fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.conns.lock().values().map(|c| c.addr).collect()
    }

    // ------------------------------------------------------------ lifecycle

    /// Register an outbound connection and dial it in the background.
    /// False when already connected to `addr` or shutting down.
    pub fn start_connection(self: &Arc<Self>, addr: SocketAddr) -> bool {
        if self.aborted() || self.is_connected(addr) {
            return false;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = PeerConn::new(id, addr, false, self.cfg.magic);
        self.conns.lock().insert(id, conn.clone());
        self.counters.bump("conn_dial");
        let node = self.clone();
        tokio::spawn(async move { node.dial(conn).await });
        true
    }

    /// Adopt an inbound socket, subject to the connection cap.
    pub fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.connection_count() >= self.connection_cap() {
            self.counters.bump("conn_refused");
            return;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = PeerConn::new(id, addr, true, self.cfg.magic);
        conn.set_phase(ConnPhase::Handshaking);
        self.conns.lock().insert(id, conn.clone());
        self.counters.bump("conn_accept");
        self.spawn_loops(stream, conn);
    }

    async fn dial(self: Arc<Self>, conn: Arc<PeerConn>) {
        let deadline = Duration::from_millis(self.cfg.dial_timeout_ms);
        match timeout(deadline, TcpStream::connect(conn.addr)).await {
            Ok(Ok(stream)) => {
                conn.set_phase(ConnPhase::Handshaking);
                self.spawn_loops(stream, conn);
            }
            Ok(Err(e)) => {
                debug!(target: "p2p::conn", peer = %conn.addr, error = %e, "dial failed");
                self.counters.bump("dial_failed");
                self.cleanup(&conn);
            }
            Err(_) => {
                self.counters.bump("dial_timeout");
                self.cleanup(&conn);
            }
        }
    }

    fn spawn_loops(self: &Arc<Self>, stream: TcpStream, conn: Arc<PeerConn>) {
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let node = self.clone();
        let c = conn.clone();
        tokio::spawn(async move { node.run_recv(rd, c).await });
        let node = self.clone();
        tokio::spawn(async move { node.run_send(wr, conn).await });
    }

    async fn run_recv(self: Arc<Self>, mut rd: OwnedReadHalf, conn: Arc<PeerConn>) {
        let mut dec = FrameDecoder::new(self.cfg.magic, self.cfg.max_payload_len);
        let mut buf = vec![0u8; 16 * 1024];
        let deadline = Duration::from_millis(self.cfg.io_deadline_ms);

        while !self.aborted() && !conn.is_broken() {
            if conn.phase() == ConnPhase::Synced {
                self.issue_requests(&conn);
            }
            let n = match timeout(deadline, rd.read(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    conn.set_broken("peer closed");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(target: "p2p::conn", conn = conn.id, error = %e, "read error");
                    self.counters.bump("recv_error");
                    conn.set_broken("read error");
                    break;
                }
            };
            conn.note_recv(n);
            match dec.absorb(&buf[..n]) {
                Ok(msgs) => {
                    for msg in msgs {
                        self.dispatch(&conn, msg);
                    }
                }
                Err(e) => {
                    warn!(target: "p2p::conn", conn = conn.id, peer = %conn.addr, error = %e, "protocol violation");
                    self.counters.bump("protocol_violation");
                    conn.set_broken("protocol violation");
                    break;
                }
            }
        }

        if conn.mark_closed_recv() {
            self.cleanup(&conn);
        }
    }

    async fn run_send(self: Arc<Self>, mut wr: OwnedWriteHalf, conn: Arc<PeerConn>) {
        self.send_version(&conn);
        let deadline = Duration::from_millis(self.cfg.io_deadline_ms);
        let idle = Duration::from_millis(self.cfg.idle_sleep_ms);

        while !self.aborted() && !conn.is_broken() {
            let chunk: Vec<u8> = {
                let st = conn.state.lock();
                let n = st.send_buf.len().min(16 * 1024);
                st.send_buf[..n].to_vec()
            };
            if chunk.is_empty() {
                sleep(idle).await;
                continue;
            }
            // a deadline expiry means the socket was not writable; nothing
            // was consumed, the same bytes go out on the next pass
            match timeout(deadline, wr.write(&chunk)).await {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    conn.set_broken("write stalled");
                    break;
                }
                Ok(Ok(n)) => {
                    let mut st = conn.state.lock();
                    st.send_buf.drain(..n);
                    st.bytes_sent += n as u64;
                }
                Ok(Err(e)) => {
                    debug!(target: "p2p::conn", conn = conn.id, error = %e, "write error");
                    self.counters.bump("send_error");
                    conn.set_broken("write error");
                    break;
                }
            }
        }

        if conn.mark_closed_send() {
            self.cleanup(&conn);
        }
    }

    fn send_version(&self, conn: &PeerConn) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let (_, height) = self.chain.tip();
        let info = VersionInfo {
            version: self.cfg.protocol_version,
            services: self.cfg.services,
            timestamp: now.as_secs() as i64,
            nonce: now.subsec_nanos() as u64 ^ (conn.id << 32),
            user_agent: self.cfg.user_agent.clone(),
            start_height: height as i32,
        };
        conn.send_msg("version", &build_version_payload(&info));
    }

    /// Drop the connection from the manager and release anything it was
    /// downloading. Called exactly once, by the last I/O loop to exit (or by
    /// the dialer when the socket never came up).
    fn cleanup(&self, conn: &Arc<PeerConn>) {
        self.conns.lock().remove(&conn.id);
        conn.set_phase(ConnPhase::Closed);
        let pending: Vec<Hash256> = conn.state.lock().blocks_in_flight.keys().copied().collect();
        for hash in &pending {
            self.acquisition.release(hash, conn.id);
        }
        self.acquisition.release_conn(conn.id);
        self.counters.bump("conn_closed");
        debug!(target: "p2p::conn", conn = conn.id, peer = %conn.addr, released = pending.len(), "connection closed");
    }

    /// Count a misbehaving peer and break its connection.
    pub(crate) fn penalize(&self, conn: &PeerConn, reason: &str) {
        self.counters.bump("peer_misbehaving");
        conn.set_broken(reason);
    }

    // ------------------------------------------------------------- dispatch

    fn dispatch(&self, conn: &Arc<PeerConn>, msg: RawMessage) {
        match msg.command.as_str() {
            "version" => match parse_version_payload(&msg.payload) {
                Ok(info) => {
                    {
                        let mut st = conn.state.lock();
                        st.peer_version = info.version;
                        st.peer_user_agent = info.user_agent;
                    }
                    conn.send_msg("verack", &[]);
                }
                Err(e) => {
                    debug!(target: "p2p::conn", conn = conn.id, error = %e, "bad version payload");
                    self.penalize(conn, "bad version payload");
                }
            },
            "verack" => {
                conn.set_phase(ConnPhase::Synced);
                if self.addrs.count() < self.cfg.addr_pool_low_water {
                    conn.send_msg("getaddr", &[]);
                }
            }
            "ping" => conn.send_msg("pong", &msg.payload),
            "pong" => {}
            "headers" => {
                let solicited = {
                    let mut st = conn.state.lock();
                    std::mem::take(&mut st.headers_in_flight)
                };
                if solicited {
                    self.headers_received(conn, &msg.payload);
                } else {
                    self.counters.bump("headers_unsolicited");
                }
            }
            "block" => self.net_block_received(conn, msg.payload),
            "inv" => match parse_inv(&msg.payload) {
                // headers-first sync: inventories are only counted, blocks
                // are fetched off the header tree
                Ok(entries) => {
                    for e in &entries {
                        match e.kind {
                            INV_BLOCK => self.counters.bump("inv_block"),
                            INV_TX => self.counters.bump("inv_tx"),
                            _ => self.counters.bump("inv_other"),
                        }
                    }
                }
                Err(_) => self.penalize(conn, "bad inv payload"),
            },
            "notfound" => match parse_inv(&msg.payload) {
                Ok(entries) => {
                    for e in entries.iter().filter(|e| e.kind == INV_BLOCK) {
                        if conn.take_block_in_flight(&e.hash).is_some() {
                            self.acquisition.release(&e.hash, conn.id);
                        }
                        self.counters.bump("block_notfound");
                    }
                }
                Err(_) => self.penalize(conn, "bad notfound payload"),
            },
            "getheaders" => self.process_getheaders(conn, &msg.payload),
            "getdata" => self.process_getdata(conn, &msg.payload),
            "getaddr" => self.counters.bump("getaddr_ignored"),
            "addr" => match parse_addr_payload(&msg.payload) {
                Ok(addrs) => {
                    for a in addrs {
                        self.addrs.add(a);
                    }
                }
                Err(_) => self.penalize(conn, "bad addr payload"),
            },
            other => {
                debug!(target: "p2p::conn", conn = conn.id, command = other, "unhandled message");
                self.counters.bump("msg_unknown");
            }
        }
    }

    // ------------------------------------------------------------ admission

    fn connection_cap(&self) -> usize {
        if self.headers_done() {
            self.cfg.max_connections
        } else if self.cfg.seed_node.is_some() {
            // a trusted seed is the sole header source
            1
        } else {
            self.cfg.headers_phase_connections
        }
    }

    /// Top the connection set up to the current cap.
    fn add_new_connections(self: &Arc<Self>) {
        let cap = self.connection_cap();
        loop {
            if self.aborted() || self.connection_count() >= cap {
                return;
            }
            let addr = if !self.headers_done() && self.cfg.seed_node.is_some() {
                match self.cfg.seed_node.as_deref().unwrap_or_default().parse() {
                    Ok(a) => Some(a),
                    Err(_) => {
                        self.counters.bump("seed_unparseable");
                        None
                    }
                }
            } else {
                self.addrs.best_untried(&self.connected_addrs())
            };
            let Some(addr) = addr else { return };
            if !self.start_connection(addr) {
                return;
            }
        }
    }

    /// Keep the connection set topped up until shutdown.
    pub async fn run_admission(self: Arc<Self>) {
        while !self.aborted() {
            self.add_new_connections();
            sleep(Duration::from_millis(500)).await;
        }
    }

    /// Accept inbound peers until shutdown.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.aborted() {
            match timeout(Duration::from_millis(500), listener.accept()).await {
                Ok(Ok((stream, addr))) => self.accept(stream, addr),
                Ok(Err(e)) => {
                    debug!(target: "p2p::conn", error = %e, "accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
                Err(_) => {}
            }
        }
    }

    // ----------------------------------------------------------- chain task

    /// Commit received blocks, one at a time, until shutdown. The single
    /// consumer is what keeps apply/undo strictly sequential.
    pub async fn run_chain_task(self: Arc<Self>) {
        let mut rx = self
            .block_rx
            .lock()
            .take()
            .expect("run_chain_task started twice");
        while let Some(ev) = rx.recv().await {
            if self.aborted() {
                break;
            }
            self.handle_chain_event(ev);
        }
    }

    pub(crate) fn queue_block(&self, msg: ReceivedBlockMsg) {
        let _ = self.block_tx.send(ChainEvent::Block(msg));
    }

    pub(crate) fn queue_headers_attached(&self) {
        let _ = self.block_tx.send(ChainEvent::HeadersAttached);
    }

    pub(crate) fn handle_chain_event(&self, ev: ChainEvent) {
        match ev {
            ChainEvent::Block(msg) => self.ingest_block(msg),
            // newly attached headers can complete an already-downloaded
            // branch; re-run the fork choice
            ChainEvent::HeadersAttached => self.advance_tip(),
        }
    }

    /// Store a block, attach its header if new, and advance the tip when the
    /// best fully-downloaded branch got deeper.
    pub(crate) fn ingest_block(&self, msg: ReceivedBlockMsg) {
        let hash = msg.block.hash;
        self.blocks.put(&hash, &msg.raw);
        self.chain.accept_header(msg.block.header);
        if !self.chain.contains(&hash) {
            // parent unknown; the header walk will pick it up again later
            self.counters.bump("block_orphan");
            debug!(target: "p2p::sync", block = %hash, conn = msg.conn_id, "orphan block stored");
            return;
        }
        self.chain
            .note_block(&hash, msg.raw.len() as u32, msg.block.tx_count());
        self.advance_tip();
    }

    fn advance_tip(&self) {
        if let Some(dst) = self.fully_received_destination() {
            self.chain.move_to_block(dst);
        }
    }

    /// Fork choice: the deepest node, on the path from the tip's common
    /// ancestor with the farthest leaf, whose blocks have all arrived.
    /// `None` when that is not deeper than the current tip.
    fn fully_received_destination(&self) -> Option<Hash256> {
        self.chain.with_state(|st| {
            let (far, far_height) = st.tree.find_farthest(&st.tree.root());
            let tip_height = st.tree.height_of(&st.tip)?;
            if far_height <= tip_height {
                return None;
            }
            let anchor = st.tree.first_common_parent(&st.tip, &far)?;

            let mut path = Vec::new();
            let mut cur = far;
            while cur != anchor {
                path.push(cur);
                cur = st.tree.get(&cur)?.parent?;
            }

            let mut dst = None;
            for hash in path.iter().rev() {
                if !self.acquisition.already_received(hash) {
                    break;
                }
                dst = Some(*hash);
            }
            match dst {
                Some(d) if st.tree.height_of(&d)? > tip_height => Some(d),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn test_conn(rig: &NodeRig, id: u64) -> Arc<PeerConn> {
        let conn = PeerConn::new(
            id,
            format!("127.0.0.{}:7072", id).parse().unwrap(),
            false,
            rig.node.cfg.magic,
        );
        conn.set_phase(ConnPhase::Handshaking);
        rig.node.conns.lock().insert(id, conn.clone());
        conn
    }

    fn staged_commands(conn: &PeerConn, magic: [u8; 4]) -> Vec<String> {
        let buf = std::mem::take(&mut conn.state.lock().send_buf);
        let mut dec = FrameDecoder::new(magic, 32 * 1024 * 1024);
        dec.absorb(&buf)
            .unwrap()
            .into_iter()
            .map(|m| m.command)
            .collect()
    }

    #[test]
    fn handshake_verack_then_getaddr() {
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);

        let info = VersionInfo {
            version: 70001,
            services: 1,
            timestamp: 0,
            nonce: 7,
            user_agent: "/other:1.0/".into(),
            start_height: 0,
        };
        rig.node.dispatch(
            &conn,
            RawMessage {
                command: "version".into(),
                payload: build_version_payload(&info),
            },
        );
        rig.node.dispatch(
            &conn,
            RawMessage {
                command: "verack".into(),
                payload: vec![],
            },
        );

        assert_eq!(conn.phase(), ConnPhase::Synced);
        assert_eq!(conn.state.lock().peer_user_agent, "/other:1.0/");
        // the address pool is empty, so the handshake asks for more peers
        assert_eq!(
            staged_commands(&conn, rig.node.cfg.magic),
            vec!["verack", "getaddr"]
        );
    }

    #[test]
    fn ping_echoes_the_nonce() {
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);
        rig.node.dispatch(
            &conn,
            RawMessage {
                command: "ping".into(),
                payload: vec![9; 8],
            },
        );
        let buf = std::mem::take(&mut conn.state.lock().send_buf);
        let mut dec = FrameDecoder::new(rig.node.cfg.magic, 1024);
        let msgs = dec.absorb(&buf).unwrap();
        assert_eq!(msgs[0].command, "pong");
        assert_eq!(msgs[0].payload, vec![9; 8]);
    }

    #[test]
    fn unsolicited_headers_are_dropped() {
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);
        let (header, hash) = child_header(&rig.root, 1);
        rig.node.dispatch(
            &conn,
            RawMessage {
                command: "headers".into(),
                payload: codec::build_headers_payload(&[header]),
            },
        );
        assert!(!rig.chain.contains(&hash));
        assert_eq!(rig.counters.get("headers_unsolicited"), 1);
    }

    #[test]
    fn connection_cap_follows_the_sync_phase() {
        let mut cfg = Config::default();
        cfg.seed_node = Some("10.0.0.1:7072".into());
        let rig = NodeRig::new(cfg);
        assert_eq!(rig.node.connection_cap(), 1, "seeded headers phase");
        rig.node.mark_all_headers_done();
        assert_eq!(rig.node.connection_cap(), Config::default().max_connections);

        let rig = NodeRig::new(Config::default());
        assert_eq!(
            rig.node.connection_cap(),
            Config::default().headers_phase_connections
        );
    }

    #[test]
    fn tip_advances_only_over_contiguous_downloads() {
        let rig = NodeRig::new(Config::default());
        // headers known for three blocks, none downloaded yet
        let mut headers = Vec::new();
        let mut parent = rig.root;
        for i in 0..3u64 {
            let (header, hash) = child_header(&parent, i);
            assert!(rig.chain.accept_header(header));
            headers.push((header, hash));
            parent = hash;
        }

        let ingest = |i: usize| {
            let (header, hash) = headers[i];
            let raw = raw_block(&header);
            let block = crate::chain::block::Block::decode(&raw).unwrap();
            rig.node.acquisition.record_receipt(hash, 0);
            rig.node.ingest_block(ReceivedBlockMsg {
                conn_id: 1,
                block,
                raw,
            });
        };

        // out of order: the gap at the bottom holds the tip back
        ingest(2);
        ingest(1);
        assert_eq!(rig.chain.tip(), (rig.root, 0));

        ingest(0);
        assert_eq!(rig.chain.tip(), (headers[2].1, 3));
        assert_eq!(rig.ledger.applied().len(), 3);
    }

    #[test]
    fn late_headers_unlock_orphaned_blocks() {
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);
        let (h1, hash1) = child_header(&rig.root, 1);
        let (h2, hash2) = child_header(&hash1, 2);

        let ingest = |header: &[u8; 80]| {
            let raw = raw_block(header);
            let block = crate::chain::block::Block::decode(&raw).unwrap();
            rig.node.acquisition.record_receipt(block.hash, 0);
            rig.node.ingest_block(ReceivedBlockMsg {
                conn_id: 1,
                block,
                raw,
            });
        };

        // the second block arrives before anything is known about the first
        ingest(&h2);
        assert_eq!(rig.counters.get("block_orphan"), 1);
        ingest(&h1);
        assert_eq!(rig.chain.tip(), (hash1, 1));

        // the missing header attaches; the queued event moves the tip over
        // the block that was already on disk
        rig.node
            .headers_received(&conn, &codec::build_headers_payload(&[h2]));
        let mut rx = rig.node.block_rx.lock().take().unwrap();
        rig.node.handle_chain_event(rx.try_recv().unwrap());
        assert_eq!(rig.chain.tip(), (hash2, 2));
    }

    #[test]
    fn addr_messages_feed_the_pool() {
        use crate::external::AddrPool;
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);
        let payload = codec::build_addr_payload(&[
            (0, 1, "10.1.2.3:7072".parse().unwrap()),
            (0, 1, "10.1.2.4:7072".parse().unwrap()),
        ]);
        rig.node.dispatch(
            &conn,
            RawMessage {
                command: "addr".into(),
                payload,
            },
        );
        assert_eq!(rig.addrs.count(), 2);
    }

    #[test]
    fn cleanup_forgets_the_connection_and_its_requests() {
        let rig = NodeRig::new(Config::default());
        let conn = test_conn(&rig, 1);
        let hash = crate::hash::sha256d(b"wanted");
        conn.mark_block_in_flight(hash);
        rig.node.acquisition.note_requested(hash, conn.id);

        rig.node.cleanup(&conn);
        assert_eq!(rig.node.connection_count(), 0);
        assert_eq!(conn.phase(), ConnPhase::Closed);
        assert_eq!(rig.node.acquisition.requesters(&hash), 0);
    }
}
