//! Serving peers: getdata and getheaders.
//!
//! Responses go straight into the connection's send buffer. A getheaders
//! request always gets an answer, even an empty one, so the remote's
//! in-flight flag clears; the only exception is a locator naming nothing we
//! know, which is treated as misbehavior.

use super::codec::{
    build_headers_payload, build_inv, parse_inv, parse_locators, INV_BLOCK, INV_FILTERED_BLOCK,
    INV_TX, MAX_HEADERS_PER_MSG,
};
use super::connection::PeerConn;
use super::SyncNode;
use std::sync::Arc;
use tracing::warn;

impl SyncNode {
    /// Answer a getdata with the blocks and transactions we have; everything
    /// else is aggregated into a single notfound.
    pub(crate) fn process_getdata(&self, conn: &Arc<PeerConn>, payload: &[u8]) {
        let entries = match parse_inv(payload) {
            Ok(e) => e,
            Err(_) => {
                self.penalize(conn, "bad getdata payload");
                return;
            }
        };
        let mut notfound = Vec::new();
        for e in entries {
            match e.kind {
                INV_BLOCK => {
                    self.counters.bump("getdata_block");
                    match self.blocks.get(&e.hash) {
                        Ok(stored) => conn.send_msg("block", &stored.raw),
                        Err(_) => notfound.push(e),
                    }
                }
                INV_TX => {
                    self.counters.bump("getdata_tx");
                    match self.txs.get(&e.hash) {
                        Some(tx) if !tx.withheld => {
                            conn.send_msg("tx", &tx.raw);
                            self.txs.mark_sent(&e.hash);
                        }
                        _ => notfound.push(e),
                    }
                }
                INV_FILTERED_BLOCK => {
                    // merkle filtering is not offered
                    self.counters.bump("getdata_filtered");
                    notfound.push(e);
                }
                _ => self.counters.bump("getdata_unknown_type"),
            }
        }
        if !notfound.is_empty() {
            conn.send_msg("notfound", &build_inv(&notfound));
        }
    }

    /// Answer a getheaders: headers above the best locator match, along the
    /// path to our tip, capped per message.
    pub(crate) fn process_getheaders(&self, conn: &Arc<PeerConn>, payload: &[u8]) {
        let loc = match parse_locators(payload) {
            Ok(l) => l,
            Err(_) => {
                self.penalize(conn, "bad getheaders payload");
                return;
            }
        };
        self.counters.bump("getheaders_served");

        // the response is assembled and sent under the chain lock, so the
        // headers reflect one consistent tip
        self.chain.with_state(|st| {
            // peer ordering is not trusted; the highest known locator wins
            let start = loc
                .hashes
                .iter()
                .filter(|h| st.tree.contains(h))
                .max_by_key(|h| st.tree.height_of(h).unwrap_or(0))
                .copied();
            let start = match start {
                Some(s) => s,
                // no locators at all: the stop block, when we have it, is
                // where the walk starts
                None if loc.hashes.is_empty() && st.tree.contains(&loc.stop) => loc.stop,
                None => {
                    self.counters.bump("getheaders_bad_locator");
                    self.penalize(conn, "getheaders names nothing we know");
                    return;
                }
            };

            let mut headers: Vec<[u8; 80]> = Vec::new();
            let mut cur = start;
            while headers.len() < MAX_HEADERS_PER_MSG {
                match st.tree.find_path_to(&cur, &st.tip) {
                    Ok(Some(next)) => {
                        let node = st.tree.get(&next).expect("path node not in index");
                        headers.push(node.header);
                        if next == loc.stop {
                            break;
                        }
                        cur = next;
                    }
                    Ok(None) => break,
                    Err(fault) => {
                        // locator on a dead side branch; answer with what we
                        // accumulated so the peer's request flag clears
                        self.counters.bump("getheaders_walk_fault");
                        warn!(target: "p2p::serve", conn = conn.id, %fault, "getheaders walk stopped");
                        break;
                    }
                }
            }
            conn.send_msg("headers", &build_headers_payload(&headers));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::external::BlockStore;
    use crate::hash::{sha256d, Hash256};
    use crate::p2p::codec::{
        build_locators, parse_headers_payload, FrameDecoder, InvEntry, Locators, RawMessage,
    };
    use crate::p2p::connection::ConnPhase;
    use crate::testutil::*;

    fn test_conn(rig: &NodeRig) -> Arc<PeerConn> {
        let conn = PeerConn::new(
            1,
            "127.0.0.1:7072".parse().unwrap(),
            true,
            rig.node.cfg.magic,
        );
        conn.set_phase(ConnPhase::Synced);
        conn
    }

    fn staged(conn: &PeerConn, magic: [u8; 4]) -> Vec<RawMessage> {
        let buf = std::mem::take(&mut conn.state.lock().send_buf);
        FrameDecoder::new(magic, 32 * 1024 * 1024).absorb(&buf).unwrap()
    }

    fn locator_payload(hashes: Vec<Hash256>, stop: Hash256) -> Vec<u8> {
        build_locators(&Locators {
            version: 70001,
            hashes,
            stop,
        })
    }

    #[test]
    fn getheaders_serves_everything_above_the_best_locator() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 20, 0);
        rig.chain.move_to_block(chain[20]);
        let conn = test_conn(&rig);

        // lowest first: the height decides, not the peer's ordering
        rig.node.process_getheaders(
            &conn,
            &locator_payload(vec![chain[2], chain[5]], Hash256::ZERO),
        );

        let msgs = staged(&conn, rig.node.cfg.magic);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command, "headers");
        let headers = parse_headers_payload(&msgs[0].payload).unwrap();
        assert_eq!(headers.len(), 15, "heights 6 through 20");
        assert_eq!(sha256d(&headers[0]), chain[6]);
        assert_eq!(sha256d(headers.last().unwrap()), chain[20]);
    }

    #[test]
    fn getheaders_honors_the_stop_hash() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 10, 0);
        rig.chain.move_to_block(chain[10]);
        let conn = test_conn(&rig);

        rig.node
            .process_getheaders(&conn, &locator_payload(vec![chain[2]], chain[5]));

        let headers = parse_headers_payload(&staged(&conn, rig.node.cfg.magic)[0].payload).unwrap();
        assert_eq!(headers.len(), 3, "heights 3 through 5");
        assert_eq!(sha256d(headers.last().unwrap()), chain[5]);
    }

    #[test]
    fn getheaders_without_locators_walks_up_from_the_stop() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 5, 0);
        rig.chain.move_to_block(chain[5]);
        let conn = test_conn(&rig);

        rig.node
            .process_getheaders(&conn, &locator_payload(vec![], chain[3]));

        let headers = parse_headers_payload(&staged(&conn, rig.node.cfg.magic)[0].payload).unwrap();
        assert_eq!(headers.len(), 2, "heights 4 and 5");
        assert_eq!(sha256d(&headers[0]), chain[4]);
        assert_eq!(sha256d(&headers[1]), chain[5]);
        assert!(!conn.is_broken());
    }

    #[test]
    fn getheaders_naming_nothing_known_is_misbehavior() {
        let rig = NodeRig::new(Config::default());
        rig.extend_received(rig.root, 5, 0);
        let conn = test_conn(&rig);

        rig.node
            .process_getheaders(&conn, &locator_payload(vec![sha256d(b"alien")], Hash256::ZERO));

        assert!(staged(&conn, rig.node.cfg.magic).is_empty(), "no response");
        assert!(conn.is_broken());
        assert_eq!(rig.counters.get("getheaders_bad_locator"), 1);
    }

    #[test]
    fn getheaders_with_unknown_locators_gets_no_stop_fallback() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 5, 0);
        rig.chain.move_to_block(chain[5]);
        let conn = test_conn(&rig);

        // the stop is ours, but the claimed history is alien
        rig.node
            .process_getheaders(&conn, &locator_payload(vec![sha256d(b"alien")], chain[3]));

        assert!(staged(&conn, rig.node.cfg.magic).is_empty());
        assert!(conn.is_broken());
        assert_eq!(rig.counters.get("getheaders_bad_locator"), 1);
    }

    #[test]
    fn getheaders_at_the_tip_gets_an_empty_answer() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 5, 0);
        rig.chain.move_to_block(chain[5]);
        let conn = test_conn(&rig);

        rig.node
            .process_getheaders(&conn, &locator_payload(vec![chain[5]], Hash256::ZERO));

        let msgs = staged(&conn, rig.node.cfg.magic);
        assert_eq!(msgs[0].command, "headers");
        assert!(parse_headers_payload(&msgs[0].payload).unwrap().is_empty());
    }

    #[test]
    fn getdata_one_known_one_unknown_block() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 1, 0);
        let conn = test_conn(&rig);
        let unknown = sha256d(b"never heard of it");

        let request = build_inv(&[
            InvEntry { kind: INV_BLOCK, hash: chain[1] },
            InvEntry { kind: INV_BLOCK, hash: unknown },
        ]);
        rig.node.process_getdata(&conn, &request);

        let msgs = staged(&conn, rig.node.cfg.magic);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command, "block");
        assert_eq!(msgs[1].command, "notfound");
        let nf = parse_inv(&msgs[1].payload).unwrap();
        assert_eq!(nf, vec![InvEntry { kind: INV_BLOCK, hash: unknown }]);
    }

    #[test]
    fn getdata_serves_what_it_has_and_notfound_for_the_rest() {
        let rig = NodeRig::new(Config::default());
        let chain = rig.extend_received(rig.root, 2, 0);
        let conn = test_conn(&rig);

        let t1 = sha256d(b"tx1");
        let t2 = sha256d(b"tx2");
        rig.txpool.insert(t1, vec![0xaa, 0xbb], false);
        rig.txpool.insert(t2, vec![0xcc], true); // withheld

        let unknown_block = sha256d(b"nope");
        let filtered = sha256d(b"filtered");
        let request = build_inv(&[
            InvEntry { kind: INV_BLOCK, hash: chain[1] },
            InvEntry { kind: INV_BLOCK, hash: unknown_block },
            InvEntry { kind: INV_TX, hash: t1 },
            InvEntry { kind: INV_TX, hash: t2 },
            InvEntry { kind: INV_FILTERED_BLOCK, hash: filtered },
        ]);
        rig.node.process_getdata(&conn, &request);

        let msgs = staged(&conn, rig.node.cfg.magic);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].command, "block");
        assert_eq!(msgs[0].payload, rig.store.get(&chain[1]).unwrap().raw);
        assert_eq!(msgs[1].command, "tx");
        assert_eq!(msgs[1].payload, vec![0xaa, 0xbb]);
        assert_eq!(msgs[2].command, "notfound");
        let nf = parse_inv(&msgs[2].payload).unwrap();
        assert_eq!(
            nf.iter().map(|e| e.hash).collect::<Vec<_>>(),
            vec![unknown_block, t2, filtered]
        );
        assert_eq!(rig.txpool.sent(), vec![t1]);
    }
}
