//! Synchronization core for a Pyrite full node.
//!
//! This crate keeps a verifiable, reorganizable history of blocks and drives
//! the network exchange of blocks, headers and transactions among untrusted
//! peers. It is built from two tightly coupled halves:
//!
//! - `chain`: the in-memory block tree spanning every known fork, plus the
//!   reorg engine that moves the active tip between tree nodes with correct
//!   undo/redo ordering against the external ledger.
//! - `p2p`: one connection record per peer socket with independent send and
//!   receive loops, the wire codec, and the cluster-wide acquisition policy
//!   (what to fetch, from whom, with dedup and in-flight limits).
//!
//! Wallets, mining, RPC surfaces and the on-disk block store / spendable
//! output ledger live outside this crate; the narrow interfaces they are
//! consumed through are in [`external`].

pub mod chain;
pub mod config;
pub mod counters;
pub mod error;
pub mod external;
pub mod hash;
pub mod p2p;

#[cfg(test)]
mod testutil;

pub use chain::Chain;
pub use config::Config;
pub use counters::Counters;
pub use hash::Hash256;
pub use p2p::SyncNode;

/// Install the default `tracing` subscriber, honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
