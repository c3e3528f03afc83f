//! Interfaces of the collaborators this crate drives but does not own.
//!
//! The on-disk block store and the spendable-output ledger serialize their
//! own internal state; the reorg engine guarantees it never applies or
//! undoes two blocks concurrently, so a single logical writer is enough.

use crate::chain::block::Block;
use crate::hash::Hash256;
use std::net::SocketAddr;

pub struct StoredBlock {
    pub raw: Vec<u8>,
    /// Set once the block's transactions have been fully verified; lets a
    /// re-apply after a reorg skip re-verification.
    pub trusted: bool,
}

/// The on-disk block store.
pub trait BlockStore: Send + Sync {
    fn get(&self, hash: &Hash256) -> anyhow::Result<StoredBlock>;
    fn put(&self, hash: &Hash256, raw: &[u8]);
    fn mark_invalid(&self, hash: &Hash256);
    fn mark_trusted(&self, hash: &Hash256);
    /// Durability barrier.
    fn sync(&self);
}

/// The spendable-output ledger.
pub trait Ledger: Send + Sync {
    /// Apply the block's output-set changes. An error fails the branch.
    fn apply_block(&self, block: &Block, hash: &Hash256) -> anyhow::Result<()>;
    /// Inverse of `apply_block`; `parent` becomes the new reference point.
    /// Must always succeed for a block that was committed.
    fn undo_block(&self, block: &Block, parent: &Hash256);
    /// Durability barrier.
    fn sync(&self);
}

#[derive(Clone)]
pub struct PoolTx {
    pub raw: Vec<u8>,
    /// Temporarily not for relay (e.g. fee policy); reported as notfound.
    pub withheld: bool,
}

/// The outgoing-transaction pool consulted by the getdata responder.
pub trait TxPool: Send + Sync {
    fn get(&self, hash: &Hash256) -> Option<PoolTx>;
    /// Send-count / last-sent bookkeeping after a successful relay.
    fn mark_sent(&self, hash: &Hash256);
}

/// Ranked peer candidates for outbound dialing.
pub trait AddrPool: Send + Sync {
    fn count(&self) -> usize;
    fn add(&self, addr: SocketAddr);
    /// Best-ranked candidate not in `connected`.
    fn best_untried(&self, connected: &[SocketAddr]) -> Option<SocketAddr>;
}
