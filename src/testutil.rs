//! In-memory collaborators and block builders shared by the unit tests.

use crate::chain::block::Block;
use crate::chain::Chain;
use crate::config::Config;
use crate::counters::Counters;
use crate::external::{AddrPool, BlockStore, Ledger, PoolTx, StoredBlock, TxPool};
use crate::hash::{sha256d, Hash256};
use crate::p2p::codec::write_compact_size;
use crate::p2p::SyncNode;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub fn child_header(parent: &Hash256, salt: u64) -> ([u8; 80], Hash256) {
    let mut header = [0u8; 80];
    header[4..36].copy_from_slice(parent.as_bytes());
    header[36..44].copy_from_slice(&salt.to_le_bytes());
    let hash = sha256d(&header);
    (header, hash)
}

pub fn minimal_tx() -> Vec<u8> {
    let mut tx = vec![1, 0, 0, 0];
    tx.push(0); // no inputs
    tx.push(0); // no outputs
    tx.extend_from_slice(&[0, 0, 0, 0]);
    tx
}

pub fn raw_block(header: &[u8; 80]) -> Vec<u8> {
    let mut raw = header.to_vec();
    write_compact_size(&mut raw, 1);
    raw.extend_from_slice(&minimal_tx());
    raw
}

/// Extend the tree with `n` linear headers starting above `from`, storing a
/// decodable raw block for each. Returns `from` followed by the new hashes.
pub fn extend_received(
    chain: &Chain,
    store: &MemStore,
    from: Hash256,
    n: usize,
    branch_salt: u8,
) -> Vec<Hash256> {
    let mut hashes = vec![from];
    let mut cur = from;
    for i in 0..n {
        let salt = ((branch_salt as u64) << 32) | i as u64;
        let (header, hash) = child_header(&cur, salt);
        assert!(chain.accept_header(header), "header must attach");
        store.put(&hash, &raw_block(&header));
        hashes.push(hash);
        cur = hash;
    }
    hashes
}

// ---------------------------------------------------------------- block store

#[derive(Default)]
pub struct MemStore {
    blocks: Mutex<HashMap<Hash256, (Vec<u8>, bool)>>,
    invalid: Mutex<HashSet<Hash256>>,
    syncs: AtomicU32,
}

impl MemStore {
    /// Make a stored block undecodable.
    pub fn corrupt(&self, hash: &Hash256) {
        let mut blocks = self.blocks.lock();
        let entry = blocks.get_mut(hash).expect("corrupt: block not stored");
        entry.0.truncate(10);
    }

    /// Drop a stored block entirely.
    pub fn forget(&self, hash: &Hash256) {
        self.blocks.lock().remove(hash);
    }

    pub fn is_invalid(&self, hash: &Hash256) -> bool {
        self.invalid.lock().contains(hash)
    }

    pub fn sync_count(&self) -> u32 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemStore {
    fn get(&self, hash: &Hash256) -> anyhow::Result<StoredBlock> {
        let blocks = self.blocks.lock();
        let (raw, trusted) = blocks
            .get(hash)
            .ok_or_else(|| anyhow::anyhow!("no block {}", hash))?;
        Ok(StoredBlock {
            raw: raw.clone(),
            trusted: *trusted,
        })
    }

    fn put(&self, hash: &Hash256, raw: &[u8]) {
        self.blocks
            .lock()
            .entry(*hash)
            .or_insert_with(|| (raw.to_vec(), false));
    }

    fn mark_invalid(&self, hash: &Hash256) {
        self.invalid.lock().insert(*hash);
    }

    fn mark_trusted(&self, hash: &Hash256) {
        if let Some(entry) = self.blocks.lock().get_mut(hash) {
            entry.1 = true;
        }
    }

    fn sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}

// -------------------------------------------------------------------- ledger

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOp {
    Apply(Hash256),
    /// Undone block and the parent that became the reference point.
    Undo(Hash256, Hash256),
}

#[derive(Default)]
pub struct RecordingLedger {
    ops: Mutex<Vec<LedgerOp>>,
    applied: Mutex<Vec<Hash256>>,
    fail: Mutex<HashSet<Hash256>>,
    syncs: AtomicU32,
}

impl RecordingLedger {
    pub fn fail_apply(&self, hash: Hash256) {
        self.fail.lock().insert(hash);
    }

    pub fn ops(&self) -> Vec<LedgerOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    /// The stack of currently applied blocks, bottom first.
    pub fn applied(&self) -> Vec<Hash256> {
        self.applied.lock().clone()
    }

    pub fn sync_count(&self) -> u32 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl Ledger for RecordingLedger {
    fn apply_block(&self, _block: &Block, hash: &Hash256) -> anyhow::Result<()> {
        if self.fail.lock().contains(hash) {
            anyhow::bail!("scripted apply failure for {}", hash);
        }
        self.applied.lock().push(*hash);
        self.ops.lock().push(LedgerOp::Apply(*hash));
        Ok(())
    }

    fn undo_block(&self, block: &Block, parent: &Hash256) {
        let popped = self.applied.lock().pop().expect("undo on empty ledger");
        assert_eq!(popped, block.hash, "undo out of height order");
        self.ops.lock().push(LedgerOp::Undo(block.hash, *parent));
    }

    fn sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------- tx pool

#[derive(Default)]
pub struct MemTxPool {
    txs: Mutex<HashMap<Hash256, PoolTx>>,
    sent: Mutex<Vec<Hash256>>,
}

impl MemTxPool {
    pub fn insert(&self, hash: Hash256, raw: Vec<u8>, withheld: bool) {
        self.txs.lock().insert(hash, PoolTx { raw, withheld });
    }

    pub fn sent(&self) -> Vec<Hash256> {
        self.sent.lock().clone()
    }
}

impl TxPool for MemTxPool {
    fn get(&self, hash: &Hash256) -> Option<PoolTx> {
        self.txs.lock().get(hash).cloned()
    }

    fn mark_sent(&self, hash: &Hash256) {
        self.sent.lock().push(*hash);
    }
}

// ----------------------------------------------------------------- addr pool

#[derive(Default)]
pub struct MemAddrPool {
    addrs: Mutex<Vec<SocketAddr>>,
}

impl AddrPool for MemAddrPool {
    fn count(&self) -> usize {
        self.addrs.lock().len()
    }

    fn add(&self, addr: SocketAddr) {
        let mut addrs = self.addrs.lock();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    fn best_untried(&self, connected: &[SocketAddr]) -> Option<SocketAddr> {
        self.addrs
            .lock()
            .iter()
            .find(|a| !connected.contains(a))
            .copied()
    }
}

// ---------------------------------------------------------------------- rigs

pub struct ChainRig {
    pub chain: Arc<Chain>,
    pub store: Arc<MemStore>,
    pub ledger: Arc<RecordingLedger>,
    pub counters: Arc<Counters>,
    pub abort: Arc<AtomicBool>,
    pub root: Hash256,
}

impl ChainRig {
    pub fn new() -> Self {
        let root_header = [0u8; 80];
        let root = sha256d(&root_header);
        let store = Arc::new(MemStore::default());
        let ledger = Arc::new(RecordingLedger::default());
        let counters = Arc::new(Counters::new());
        let abort = Arc::new(AtomicBool::new(false));
        let chain = Arc::new(Chain::new(
            root_header,
            store.clone(),
            ledger.clone(),
            abort.clone(),
            counters.clone(),
        ));
        ChainRig {
            chain,
            store,
            ledger,
            counters,
            abort,
            root,
        }
    }

    pub fn child_header(&self, parent: &Hash256, salt: u64) -> ([u8; 80], Hash256) {
        child_header(parent, salt)
    }

    pub fn extend_received(&self, from: Hash256, n: usize, branch_salt: u8) -> Vec<Hash256> {
        extend_received(&self.chain, &self.store, from, n, branch_salt)
    }
}

pub struct NodeRig {
    pub node: Arc<SyncNode>,
    pub chain: Arc<Chain>,
    pub store: Arc<MemStore>,
    pub ledger: Arc<RecordingLedger>,
    pub txpool: Arc<MemTxPool>,
    pub addrs: Arc<MemAddrPool>,
    pub counters: Arc<Counters>,
    pub root: Hash256,
}

impl NodeRig {
    pub fn new(cfg: Config) -> Self {
        let rig = ChainRig::new();
        let txpool = Arc::new(MemTxPool::default());
        let addrs = Arc::new(MemAddrPool::default());
        let node = SyncNode::new(
            cfg,
            rig.chain.clone(),
            rig.store.clone(),
            txpool.clone(),
            addrs.clone(),
            rig.abort.clone(),
            rig.counters.clone(),
        );
        NodeRig {
            node,
            chain: rig.chain,
            store: rig.store,
            ledger: rig.ledger,
            txpool: txpool.clone(),
            addrs,
            counters: rig.counters,
            root: rig.root,
        }
    }

    pub fn extend_received(&self, from: Hash256, n: usize, branch_salt: u8) -> Vec<Hash256> {
        extend_received(&self.chain, &self.store, from, n, branch_salt)
    }
}
