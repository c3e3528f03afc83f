//! Chain state: the block tree, the active tip, and the reorg engine that
//! moves the tip between tree nodes against the external ledger.

pub mod block;
mod reorg;
pub mod tree;

use crate::counters::Counters;
use crate::external::{BlockStore, Ledger};
use crate::hash::{sha256d, Hash256};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tree::{BlockTree, HEADER_LEN};

/// Index and tip together under one lock: a fork-choice query or a header
/// walk never observes a mutation half-applied.
pub struct ChainState {
    pub tree: BlockTree,
    pub tip: Hash256,
}

pub struct Chain {
    state: Mutex<ChainState>,
    blocks: Arc<dyn BlockStore>,
    ledger: Arc<dyn Ledger>,
    abort: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Chain {
    pub fn new(
        root_header: [u8; HEADER_LEN],
        blocks: Arc<dyn BlockStore>,
        ledger: Arc<dyn Ledger>,
        abort: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Self {
        let root = sha256d(&root_header);
        Chain {
            state: Mutex::new(ChainState {
                tree: BlockTree::new(root, root_header),
                tip: root,
            }),
            blocks,
            ledger,
            abort,
            counters,
        }
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Run `f` against a consistent snapshot of the chain state.
    pub fn with_state<R>(&self, f: impl FnOnce(&ChainState) -> R) -> R {
        f(&self.state.lock())
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, ChainState> {
        self.state.lock()
    }

    /// Active tip hash and height.
    pub fn tip(&self) -> (Hash256, u32) {
        let st = self.state.lock();
        let height = st.tree.height_of(&st.tip).expect("tip not in index");
        (st.tip, height)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.state.lock().tree.contains(hash)
    }

    /// Attach a header under its (already known) parent. Returns `false` for
    /// orphan headers and for hashes already in the tree.
    pub fn accept_header(&self, header: [u8; HEADER_LEN]) -> bool {
        let hash = sha256d(&header);
        self.state.lock().tree.insert(hash, header)
    }

    /// Fill in encoded size and transaction count on first full-block sight.
    pub fn note_block(&self, hash: &Hash256, size: u32, tx_count: u32) {
        self.state.lock().tree.note_block_stats(hash, size, tx_count);
    }

    /// Locator for a headers request: the deepest known header (which may be
    /// well above the applied tip while bodies are still downloading), then
    /// ancestors with an exponentially growing stride, always ending at the
    /// root.
    pub fn build_locator(&self) -> Vec<Hash256> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut step = 1u32;
        let mut cur = st.tree.find_farthest(&st.tree.root()).0;
        loop {
            out.push(cur);
            let Some(node) = st.tree.get(&cur) else { break };
            if node.parent.is_none() {
                break;
            }
            if out.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let mut next = cur;
            for _ in 0..step {
                match st.tree.get(&next).and_then(|n| n.parent) {
                    Some(p) => next = p,
                    None => break,
                }
            }
            cur = next;
        }
        let root = st.tree.root();
        if out.last() != Some(&root) {
            out.push(root);
        }
        out
    }
}
