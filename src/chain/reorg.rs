//! Moving the active tip: undo down to the common ancestor, re-apply up to
//! the destination, invalidate branches that fail, fall back to the deepest
//! reachable node.
//!
//! Block commit and undo are strictly sequential; the chain-state lock is
//! taken per step and never held across block-store or ledger I/O.

use super::block::Block;
use super::Chain;
use crate::hash::Hash256;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROGRESS_EVERY: Duration = Duration::from_secs(10);

/// One decision of the rewind loop, taken under the chain-state lock.
enum Rewind {
    AtAncestor,
    /// Undo the tip; the cursor stays (the tip is still above it).
    UndoTip,
    /// Undo the tip and step the cursor back to this parent.
    UndoBoth(Hash256),
}

impl Chain {
    /// Move the active tip to `dst`, undoing and applying blocks as needed.
    ///
    /// If `dst` turns out to be unreachable (a branch fails to decode or to
    /// apply), the branch is invalidated and the tip moves to the deepest
    /// reachable node instead. The ledger and block store are synced on
    /// completion either way.
    pub fn move_to_block(&self, dst: Hash256) {
        // Rewind a cursor from the destination down to the tip's height;
        // a pure pointer walk, no side effects yet.
        let mut cur = dst;
        {
            let st = self.state();
            let tip_height = st.tree.height_of(&st.tip).expect("tip not in index");
            while st.tree.height_of(&cur).expect("destination not in index") > tip_height {
                cur = st
                    .tree
                    .get(&cur)
                    .expect("cursor not in index")
                    .parent
                    .expect("walked below the root");
            }
        }

        // Undo one block at a time, in strict reverse height order, until
        // the tip meets the cursor at the common ancestor.
        loop {
            if self.aborted() {
                return;
            }
            let step = {
                let st = self.state();
                if st.tip == cur {
                    Rewind::AtAncestor
                } else {
                    let tip_height = st.tree.height_of(&st.tip).expect("tip not in index");
                    let cur_height = st.tree.height_of(&cur).expect("cursor not in index");
                    if tip_height > cur_height {
                        Rewind::UndoTip
                    } else if tip_height == cur_height {
                        Rewind::UndoBoth(
                            st.tree
                                .get(&cur)
                                .expect("cursor not in index")
                                .parent
                                .expect("rewind walked below the root"),
                        )
                    } else {
                        // the rewind above put the cursor at or below the tip
                        panic!(
                            "reorg navigation out of step: tip at {}, cursor at {}",
                            tip_height, cur_height
                        );
                    }
                }
            };
            match step {
                Rewind::AtAncestor => break,
                Rewind::UndoTip => self.undo_last_block(),
                Rewind::UndoBoth(parent) => {
                    self.undo_last_block();
                    cur = parent;
                }
            }
        }

        self.parse_till_block(dst);
    }

    /// Advance the tip towards `end`, fetching, decoding and applying each
    /// block on the path. A failing block takes its whole branch with it and
    /// redirects the walk to the deepest node still reachable.
    fn parse_till_block(&self, end: Hash256) {
        let mut last_report = Instant::now();

        while !self.aborted() {
            let next = {
                let st = self.state();
                if st.tip == end {
                    break;
                }
                match st.tree.find_path_to(&st.tip, &end) {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(fault) => {
                        self.counters.bump("reorg_path_fault");
                        warn!(target: "chain::reorg", %fault, "cannot continue towards destination");
                        break;
                    }
                }
            };

            if last_report.elapsed() >= PROGRESS_EVERY {
                let (_, height) = self.tip();
                let end_height = self.with_state(|st| st.tree.height_of(&end));
                info!(target: "chain::reorg", height, end_height, "still applying blocks");
                last_report = Instant::now();
            }

            let stored = match self.blocks.get(&next) {
                Ok(s) => s,
                Err(e) => {
                    warn!(target: "chain::reorg", block = %next, error = %e, "block store failed; failing branch");
                    self.delete_branch(&next);
                    break;
                }
            };

            let block = match Block::decode(&stored.raw) {
                Ok(b) => b,
                Err(e) => {
                    warn!(target: "chain::reorg", block = %next, error = %e, "undecodable block; failing branch");
                    self.delete_branch(&next);
                    break;
                }
            };

            if let Err(e) = self.ledger.apply_block(&block, &next) {
                warn!(target: "chain::reorg", block = %next, error = %e, "ledger rejected block; failing branch");
                self.delete_branch(&next);
                break;
            }
            if !stored.trusted {
                self.blocks.mark_trusted(&next);
            }

            let mut st = self.state();
            st.tree
                .note_block_stats(&next, block.raw_len as u32, block.tx_count());
            st.tip = next;
        }

        // Destination unreachable: settle for the deepest node still in the
        // tree and recurse into moving there.
        let arrived = self.with_state(|st| st.tip == end);
        if !self.aborted() && !arrived {
            let fallback = self.with_state(|st| st.tree.find_farthest(&st.tree.root()).0);
            info!(target: "chain::reorg", to = %fallback, "destination unreachable, falling back");
            self.move_to_block(fallback);
        }

        self.ledger.sync();
        self.blocks.sync();
    }

    /// Undo the current tip and step back to its parent.
    ///
    /// A block that was committed must always be undoable: failure to fetch
    /// or decode it here means the store is corrupt, and carrying on would
    /// corrupt the ledger too.
    pub fn undo_last_block(&self) {
        let (tip, parent, height) = {
            let st = self.state();
            let node = st.tree.get(&st.tip).expect("tip not in index");
            (
                node.hash,
                node.parent.expect("cannot undo the root"),
                node.height,
            )
        };
        info!(target: "chain::reorg", height, block = %tip, "undoing block");

        let stored = self
            .blocks
            .get(&tip)
            .unwrap_or_else(|e| panic!("block store lost committed block {}: {}", tip, e));
        let block = Block::decode(&stored.raw)
            .unwrap_or_else(|e| panic!("committed block {} no longer decodes: {}", tip, e));

        self.ledger.undo_block(&block, &parent);
        self.state().tip = parent;
    }

    /// Invalidate `hash` and everything built on it: detach from the tree
    /// under the chain-state lock, then mark invalid and flush the store
    /// outside it.
    pub fn delete_branch(&self, hash: &Hash256) {
        let removed = self.state().tree.delete_branch(hash);
        if removed == 0 {
            return;
        }
        warn!(target: "chain::reorg", block = %hash, removed, "invalidated branch");
        self.counters.bump("branch_invalidated");
        self.blocks.mark_invalid(hash);
        self.blocks.sync();
    }
}
