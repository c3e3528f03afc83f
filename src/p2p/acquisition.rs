//! What to download, from whom.
//!
//! One shared ledger of block receipts and outstanding requests keeps every
//! connection's request loop from fetching the same data twice: a block is
//! requested from at most `max_block_at_once` peers, and a received block is
//! never requested again.

use super::codec::{
    build_inv, build_locators, parse_headers_payload, InvEntry, Locators, INV_BLOCK,
    MAX_HEADERS_PER_MSG,
};
use super::connection::PeerConn;
use super::{ReceivedBlockMsg, SyncNode};
use crate::chain::block::Block;
use crate::hash::Hash256;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub(crate) struct ReceivedBlock {
    pub(crate) at: Instant,
    /// Copies that arrived after the first one.
    pub(crate) duplicates: u32,
    pub(crate) download_ms: u32,
}

pub(crate) enum Receipt {
    New,
    Duplicate(u32),
}

/// Cross-connection download state. `received` outlives the connections that
/// filled it; `in_progress` maps a block to the connections currently
/// fetching it.
#[derive(Default)]
pub(crate) struct Acquisition {
    received: Mutex<HashMap<Hash256, ReceivedBlock>>,
    in_progress: Mutex<HashMap<Hash256, HashSet<u64>>>,
}

impl Acquisition {
    pub(crate) fn already_received(&self, hash: &Hash256) -> bool {
        self.received.lock().contains_key(hash)
    }

    /// Record a block arrival. The first copy clears the in-progress entry;
    /// later copies only bump the duplicate count.
    pub(crate) fn record_receipt(&self, hash: Hash256, download_ms: u32) -> Receipt {
        let mut received = self.received.lock();
        match received.entry(hash) {
            Entry::Occupied(mut e) => {
                let r = e.get_mut();
                r.duplicates += 1;
                Receipt::Duplicate(r.duplicates)
            }
            Entry::Vacant(v) => {
                v.insert(ReceivedBlock {
                    at: Instant::now(),
                    duplicates: 0,
                    download_ms,
                });
                self.in_progress.lock().remove(&hash);
                Receipt::New
            }
        }
    }

    pub(crate) fn note_requested(&self, hash: Hash256, conn_id: u64) {
        self.in_progress.lock().entry(hash).or_default().insert(conn_id);
    }

    /// Forget that `conn_id` is fetching `hash` (timeout, notfound, teardown).
    pub(crate) fn release(&self, hash: &Hash256, conn_id: u64) {
        let mut in_progress = self.in_progress.lock();
        if let Some(set) = in_progress.get_mut(hash) {
            set.remove(&conn_id);
            if set.is_empty() {
                in_progress.remove(hash);
            }
        }
    }

    /// Forget every request owned by a connection.
    pub(crate) fn release_conn(&self, conn_id: u64) {
        let mut in_progress = self.in_progress.lock();
        in_progress.retain(|_, set| {
            set.remove(&conn_id);
            !set.is_empty()
        });
    }

    /// How many connections are fetching `hash` right now.
    pub(crate) fn requesters(&self, hash: &Hash256) -> usize {
        self.in_progress.lock().get(hash).map_or(0, |s| s.len())
    }

    pub(crate) fn received_stats(&self, hash: &Hash256) -> Option<(Instant, u32, u32)> {
        self.received
            .lock()
            .get(hash)
            .map(|r| (r.at, r.duplicates, r.download_ms))
    }
}

impl SyncNode {
    /// Should this block be requested at all?
    pub(crate) fn block_wanted(&self, hash: &Hash256) -> bool {
        if !self.chain.contains(hash) {
            self.counters.bump("block_unknown_header");
            return false;
        }
        if self.acquisition.already_received(hash) {
            self.counters.bump("block_unwanted");
            return false;
        }
        if self.blocks_limit_reached(hash) {
            self.counters.bump("block_in_progress");
            return false;
        }
        self.counters.bump("block_wanted");
        true
    }

    /// True once `max_block_at_once` connections are already fetching the
    /// block. Zero disables the limit.
    pub(crate) fn blocks_limit_reached(&self, hash: &Hash256) -> bool {
        let max = self.cfg.max_block_at_once as usize;
        max != 0 && self.acquisition.requesters(hash) >= max
    }

    /// A block payload arrived. Decodes, dedups, measures the download and
    /// hands the block to the chain task.
    pub(crate) fn net_block_received(&self, conn: &Arc<PeerConn>, payload: Vec<u8>) {
        let block = match Block::decode(&payload) {
            Ok(b) => b,
            Err(e) => {
                debug!(target: "p2p::sync", conn = conn.id, error = %e, "malformed block");
                self.counters.bump("block_malformed");
                self.penalize(conn, "malformed block");
                return;
            }
        };

        let latency = conn
            .take_block_in_flight(&block.hash)
            .map(|at| at.elapsed().as_millis() as u32);
        match latency {
            Some(ms) => conn.record_latency(ms),
            None => self.counters.bump("block_unexpected"),
        }

        if let Receipt::Duplicate(n) = self
            .acquisition
            .record_receipt(block.hash, latency.unwrap_or(0))
        {
            debug!(target: "p2p::sync", block = %block.hash, copies = n + 1, "duplicate block");
            self.counters.bump("block_same_rcvd");
            return;
        }
        self.counters.bump("block_new");
        self.queue_block(ReceivedBlockMsg {
            conn_id: conn.id,
            block,
            raw: payload,
        });
    }

    /// Called by the receive loop on every pass once the handshake is done.
    pub(crate) fn issue_requests(&self, conn: &Arc<PeerConn>) {
        if self.headers_done() {
            self.request_blocks(conn);
        } else {
            self.request_headers(conn);
        }
    }

    /// One getheaders at a time per connection; the in-flight flag is cleared
    /// when the response (or any headers message) arrives.
    fn request_headers(&self, conn: &Arc<PeerConn>) {
        {
            let mut st = conn.state.lock();
            if st.headers_in_flight {
                return;
            }
            st.headers_in_flight = true;
        }
        let loc = Locators {
            version: self.cfg.protocol_version,
            hashes: self.chain.build_locator(),
            stop: Hash256::ZERO,
        };
        self.counters.bump("getheaders_sent");
        conn.send_msg("getheaders", &build_locators(&loc));
    }

    /// Fill the connection's request window with blocks from the path the
    /// tip is heading along, skipping anything received or saturated.
    fn request_blocks(&self, conn: &Arc<PeerConn>) {
        let stale = conn.expire_blocks_in_flight(Duration::from_millis(self.cfg.block_retry_ms));
        for hash in &stale {
            self.acquisition.release(hash, conn.id);
            self.counters.bump("block_retry");
        }

        let room = self
            .cfg
            .block_window
            .saturating_sub(conn.blocks_in_flight_count());
        if room == 0 {
            return;
        }

        // look a few windows ahead so saturated blocks do not stall the walk
        let lookahead = 4 * self.cfg.block_window;
        let candidates: Vec<Hash256> = self.chain.with_state(|st| {
            let (far, _) = st.tree.find_farthest(&st.tree.root());
            let mut out = Vec::new();
            let mut cur = st.tip;
            while out.len() < lookahead {
                match st.tree.find_path_to(&cur, &far) {
                    Ok(Some(next)) => {
                        out.push(next);
                        cur = next;
                    }
                    _ => break,
                }
            }
            out
        });

        let mut request = Vec::new();
        for hash in candidates {
            if request.len() >= room {
                break;
            }
            if conn.has_block_in_flight(&hash) || !self.block_wanted(&hash) {
                continue;
            }
            self.acquisition.note_requested(hash, conn.id);
            conn.mark_block_in_flight(hash);
            request.push(InvEntry {
                kind: INV_BLOCK,
                hash,
            });
        }
        if request.is_empty() {
            return;
        }
        self.counters.bump_by("block_requested", request.len() as u64);
        conn.send_msg("getdata", &build_inv(&request));
    }

    /// A solicited headers batch. A short batch ends the headers phase.
    pub(crate) fn headers_received(&self, conn: &Arc<PeerConn>, payload: &[u8]) {
        let headers = match parse_headers_payload(payload) {
            Ok(h) => h,
            Err(e) => {
                debug!(target: "p2p::sync", conn = conn.id, error = %e, "malformed headers");
                self.penalize(conn, "malformed headers");
                return;
            }
        };
        let mut accepted = 0u64;
        for header in &headers {
            if self.chain.accept_header(*header) {
                accepted += 1;
            }
        }
        self.counters.bump_by("headers_received", headers.len() as u64);
        self.counters
            .bump_by("headers_rejected", headers.len() as u64 - accepted);
        debug!(target: "p2p::sync", conn = conn.id, got = headers.len(), accepted, "headers batch");
        if accepted > 0 {
            // an attached header may be the one an orphaned block was
            // waiting for; let the chain task reconsider the tip
            self.queue_headers_attached();
        }

        if headers.len() < MAX_HEADERS_PER_MSG {
            self.mark_all_headers_done();
        }
    }
}
