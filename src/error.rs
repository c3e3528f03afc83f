//! Error taxonomy.
//!
//! Protocol violations break the offending connection and nothing else.
//! Tree faults are recovered locally (partial getheaders responses, branch
//! invalidation with fallback). The one unrecoverable case - the block store
//! losing a block that was already committed and is needed for an undo - is
//! a panic, because continuing would corrupt the ledger.

use crate::hash::Hash256;
use thiserror::Error;

/// A violation of the wire protocol by the remote peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad network magic")]
    BadMagic,
    #[error("payload checksum mismatch on '{0}'")]
    BadChecksum(String),
    #[error("claimed payload length {0} exceeds the limit")]
    OversizedPayload(u32),
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// A navigation failure inside the block tree.
///
/// The reorg engine pre-checks its arguments, so it treats these as fatal
/// consistency faults; the getheaders responder treats them as recoverable
/// (an orphaned locator) and answers with whatever it accumulated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeFault {
    #[error("target {target} at height {target_height} is not above height {from_height}")]
    TargetNotAbove {
        target: Hash256,
        target_height: u32,
        from_height: u32,
    },
    #[error("no path through the tree to {0}")]
    NoPath(Hash256),
    #[error("unknown node {0}")]
    UnknownNode(Hash256),
}

/// Raw block bytes that do not parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockDecodeError {
    #[error("block shorter than an 80-byte header")]
    ShortHeader,
    #[error("block truncated at byte {0}")]
    Truncated(usize),
    #[error("transaction count {0} is absurd for the encoded size")]
    AbsurdTxCount(u64),
    #[error("{0} trailing bytes after the last transaction")]
    TrailingBytes(usize),
}
