//! Raw block and transaction decoding.
//!
//! Only the framing is parsed here: header, transaction boundaries, hashes.
//! Script validation is the ledger collaborator's problem.

use crate::error::BlockDecodeError;
use crate::hash::{sha256d, Hash256};
use crate::p2p::codec::read_compact_size;

pub const HEADER_LEN: usize = 80;

/// Smallest encodable transaction: version, empty input and output vectors,
/// lock time.
const MIN_TX_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub hash: Hash256,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: Hash256,
    pub header: [u8; HEADER_LEN],
    pub txs: Vec<Tx>,
    pub raw_len: usize,
}

impl Block {
    pub fn decode(raw: &[u8]) -> Result<Block, BlockDecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(BlockDecodeError::ShortHeader);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let hash = sha256d(&header);

        let mut pos = HEADER_LEN;
        let count =
            read_compact_size(raw, &mut pos).ok_or(BlockDecodeError::Truncated(pos))?;
        // the frame length field is 32 bits, so a count whose minimal
        // encoding exceeds it can never decode; a count that merely
        // overruns this payload is plain truncation, caught per tx
        if count as u128 * MIN_TX_LEN as u128 > u32::MAX as u128 {
            return Err(BlockDecodeError::AbsurdTxCount(count));
        }

        let mut txs = Vec::with_capacity((count as usize).min((raw.len() - pos) / MIN_TX_LEN));
        for _ in 0..count {
            let start = pos;
            skip_tx(raw, &mut pos)?;
            let bytes = &raw[start..pos];
            txs.push(Tx {
                hash: sha256d(bytes),
                raw: bytes.to_vec(),
            });
        }
        if pos != raw.len() {
            return Err(BlockDecodeError::TrailingBytes(raw.len() - pos));
        }

        Ok(Block {
            hash,
            header,
            txs,
            raw_len: raw.len(),
        })
    }

    pub fn parent_hash(&self) -> Hash256 {
        Hash256::from_slice(&self.header[4..36])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes(self.header[68..72].try_into().expect("fixed slice"))
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.header[72..76].try_into().expect("fixed slice"))
    }

    pub fn tx_count(&self) -> u32 {
        self.txs.len() as u32
    }
}

fn need(raw: &[u8], pos: usize, n: usize) -> Result<(), BlockDecodeError> {
    if raw.len() - pos < n {
        Err(BlockDecodeError::Truncated(pos))
    } else {
        Ok(())
    }
}

fn skip_var_bytes(raw: &[u8], pos: &mut usize) -> Result<(), BlockDecodeError> {
    let len = read_compact_size(raw, pos).ok_or(BlockDecodeError::Truncated(*pos))?;
    let len = usize::try_from(len).map_err(|_| BlockDecodeError::Truncated(*pos))?;
    need(raw, *pos, len)?;
    *pos += len;
    Ok(())
}

/// Advance `pos` over one serialized transaction.
fn skip_tx(raw: &[u8], pos: &mut usize) -> Result<(), BlockDecodeError> {
    need(raw, *pos, 4)?; // version
    *pos += 4;

    let n_in = read_compact_size(raw, pos).ok_or(BlockDecodeError::Truncated(*pos))?;
    for _ in 0..n_in {
        need(raw, *pos, 36)?; // previous output
        *pos += 36;
        skip_var_bytes(raw, pos)?; // signature script
        need(raw, *pos, 4)?; // sequence
        *pos += 4;
    }

    let n_out = read_compact_size(raw, pos).ok_or(BlockDecodeError::Truncated(*pos))?;
    for _ in 0..n_out {
        need(raw, *pos, 8)?; // value
        *pos += 8;
        skip_var_bytes(raw, pos)?; // output script
    }

    need(raw, *pos, 4)?; // lock time
    *pos += 4;
    Ok(())
}
