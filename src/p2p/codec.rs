//! Wire framing and payload codecs.
//!
//! Every message is `magic | command[12] | length | checksum | payload`.
//! The command is ASCII, zero padded; the length is little endian; the
//! checksum is the first four bytes of the double SHA-256 of the payload.
//! [`FrameDecoder`] reassembles frames from arbitrarily fragmented reads.

use crate::error::ProtocolError;
use crate::hash::{checksum4, Hash256};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub const HDR_LEN: usize = 24;

/// Cap on one headers message, requests and responses alike.
pub const MAX_HEADERS_PER_MSG: usize = 2000;
/// Cap on inventory entries per message.
const MAX_INV_PER_MSG: usize = 50_000;

pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;
pub const INV_FILTERED_BLOCK: u32 = 3;

/// Frame a payload for the wire.
pub fn encode_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= 12 && command.is_ascii());
    let mut out = Vec::with_capacity(HDR_LEN + payload.len());
    out.extend_from_slice(&magic);
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum4(payload));
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

/// Incremental frame reassembly. Feed it whatever the socket returns;
/// complete messages come out in order.
pub struct FrameDecoder {
    magic: [u8; 4],
    max_payload: u32,
    hdr: [u8; HDR_LEN],
    hdr_len: usize,
    payload: Vec<u8>,
    payload_len: usize,
}

impl FrameDecoder {
    pub fn new(magic: [u8; 4], max_payload: u32) -> Self {
        FrameDecoder {
            magic,
            max_payload,
            hdr: [0u8; HDR_LEN],
            hdr_len: 0,
            payload: Vec::new(),
            payload_len: 0,
        }
    }

    /// Absorb one read's worth of bytes. Any error is unrecoverable for the
    /// stream; the connection must be dropped.
    pub fn absorb(&mut self, mut data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        let mut out = Vec::new();
        while !data.is_empty() {
            if self.hdr_len < HDR_LEN {
                let take = (HDR_LEN - self.hdr_len).min(data.len());
                self.hdr[self.hdr_len..self.hdr_len + take].copy_from_slice(&data[..take]);
                self.hdr_len += take;
                data = &data[take..];

                // the magic prefix is checked as it streams in, so a stray
                // byte breaks the connection before a header accumulates
                let seen = self.hdr_len.min(4);
                if self.hdr[..seen] != self.magic[..seen] {
                    return Err(ProtocolError::BadMagic);
                }
                if self.hdr_len < HDR_LEN {
                    continue;
                }
                let len = u32::from_le_bytes(self.hdr[16..20].try_into().expect("fixed slice"));
                if len > self.max_payload {
                    return Err(ProtocolError::OversizedPayload(len));
                }
                self.payload_len = len as usize;
                self.payload.clear();
                self.payload.reserve(self.payload_len);
            }

            let missing = self.payload_len - self.payload.len();
            let take = missing.min(data.len());
            self.payload.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.payload.len() == self.payload_len {
                out.push(self.finish_frame()?);
            }
        }
        Ok(out)
    }

    fn finish_frame(&mut self) -> Result<RawMessage, ProtocolError> {
        let command = command_str(&self.hdr[4..16])?;
        if checksum4(&self.payload) != self.hdr[20..24] {
            return Err(ProtocolError::BadChecksum(command));
        }
        self.hdr_len = 0;
        self.payload_len = 0;
        Ok(RawMessage {
            command,
            payload: std::mem::take(&mut self.payload),
        })
    }
}

/// Decode the 12-byte command field: ASCII up to the first NUL, NUL padding
/// after it.
fn command_str(field: &[u8]) -> Result<String, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if field[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::Malformed("command padding"));
    }
    let name = &field[..end];
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::Malformed("command name"));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

// ------------------------------------------------------------- compact sizes

/// Read a variable-length integer, advancing `pos`. `None` on truncation.
pub fn read_compact_size(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    // non-canonical wide encodings from remote peers are tolerated
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        b => return Some(b as u64),
    };
    if buf.len() - *pos < width {
        *pos -= 1;
        return None;
    }
    let mut v = 0u64;
    for i in 0..width {
        v |= (buf[*pos + i] as u64) << (8 * i);
    }
    *pos += width;
    Some(v)
}

/// Append the canonical variable-length encoding of `v`.
pub fn write_compact_size(out: &mut Vec<u8>, v: u64) {
    if v < 0xfd {
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], ProtocolError> {
    if buf.len() - *pos < n {
        return Err(ProtocolError::Malformed("truncated payload"));
    }
    let out = &buf[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

fn take_hash(buf: &[u8], pos: &mut usize) -> Result<Hash256, ProtocolError> {
    Ok(Hash256::from_slice(take(buf, pos, 32)?))
}

fn take_varint(buf: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    read_compact_size(buf, pos).ok_or(ProtocolError::Malformed("truncated varint"))
}

// ---------------------------------------------------------------- inventories

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvEntry {
    pub kind: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InvEntry>, ProtocolError> {
    let mut pos = 0;
    let count = take_varint(payload, &mut pos)?;
    if count as usize > MAX_INV_PER_MSG {
        return Err(ProtocolError::Malformed("oversized inv"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = u32::from_le_bytes(take(payload, &mut pos, 4)?.try_into().expect("fixed slice"));
        let hash = take_hash(payload, &mut pos)?;
        out.push(InvEntry { kind, hash });
    }
    if pos != payload.len() {
        return Err(ProtocolError::Malformed("trailing inv bytes"));
    }
    Ok(out)
}

pub fn build_inv(entries: &[InvEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + entries.len() * 36);
    write_compact_size(&mut out, entries.len() as u64);
    for e in entries {
        out.extend_from_slice(&e.kind.to_le_bytes());
        out.extend_from_slice(e.hash.as_bytes());
    }
    out
}

// ------------------------------------------------------------------- locators

/// A getheaders request: known block hashes, newest first, plus a stop hash
/// (all zero for "as many as fit").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locators {
    pub version: u32,
    pub hashes: Vec<Hash256>,
    pub stop: Hash256,
}

pub fn parse_locators(payload: &[u8]) -> Result<Locators, ProtocolError> {
    let mut pos = 0;
    let version =
        u32::from_le_bytes(take(payload, &mut pos, 4)?.try_into().expect("fixed slice"));
    let count = take_varint(payload, &mut pos)?;
    if count as usize > MAX_HEADERS_PER_MSG {
        return Err(ProtocolError::Malformed("oversized locator"));
    }
    let mut hashes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        hashes.push(take_hash(payload, &mut pos)?);
    }
    let stop = take_hash(payload, &mut pos)?;
    if pos != payload.len() {
        return Err(ProtocolError::Malformed("trailing locator bytes"));
    }
    Ok(Locators {
        version,
        hashes,
        stop,
    })
}

pub fn build_locators(loc: &Locators) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 5 + loc.hashes.len() * 32 + 32);
    out.extend_from_slice(&loc.version.to_le_bytes());
    write_compact_size(&mut out, loc.hashes.len() as u64);
    for h in &loc.hashes {
        out.extend_from_slice(h.as_bytes());
    }
    out.extend_from_slice(loc.stop.as_bytes());
    out
}

// -------------------------------------------------------------------- headers

/// Each entry of a headers message is the 80-byte header followed by the
/// (always zero) transaction count.
pub fn build_headers_payload(headers: &[[u8; 80]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + headers.len() * 81);
    write_compact_size(&mut out, headers.len() as u64);
    for h in headers {
        out.extend_from_slice(h);
        write_compact_size(&mut out, 0);
    }
    out
}

pub fn parse_headers_payload(payload: &[u8]) -> Result<Vec<[u8; 80]>, ProtocolError> {
    let mut pos = 0;
    let count = take_varint(payload, &mut pos)?;
    if count as usize > MAX_HEADERS_PER_MSG {
        return Err(ProtocolError::Malformed("oversized headers"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let header: [u8; 80] = take(payload, &mut pos, 80)?.try_into().expect("fixed slice");
        take_varint(payload, &mut pos)?;
        out.push(header);
    }
    if pos != payload.len() {
        return Err(ProtocolError::Malformed("trailing header bytes"));
    }
    Ok(out)
}

// -------------------------------------------------------------------- version

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// One `services | ip | port` network address, without the time prefix.
fn push_net_addr(out: &mut Vec<u8>, services: u64) {
    out.extend_from_slice(&services.to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&0u16.to_be_bytes());
}

pub fn build_version_payload(info: &VersionInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(86 + info.user_agent.len());
    out.extend_from_slice(&info.version.to_le_bytes());
    out.extend_from_slice(&info.services.to_le_bytes());
    out.extend_from_slice(&info.timestamp.to_le_bytes());
    push_net_addr(&mut out, info.services); // addr_recv
    push_net_addr(&mut out, info.services); // addr_from
    out.extend_from_slice(&info.nonce.to_le_bytes());
    write_compact_size(&mut out, info.user_agent.len() as u64);
    out.extend_from_slice(info.user_agent.as_bytes());
    out.extend_from_slice(&info.start_height.to_le_bytes());
    out.push(1); // relay
    out
}

pub fn parse_version_payload(payload: &[u8]) -> Result<VersionInfo, ProtocolError> {
    let mut pos = 0;
    let version =
        u32::from_le_bytes(take(payload, &mut pos, 4)?.try_into().expect("fixed slice"));
    let services =
        u64::from_le_bytes(take(payload, &mut pos, 8)?.try_into().expect("fixed slice"));
    let timestamp =
        i64::from_le_bytes(take(payload, &mut pos, 8)?.try_into().expect("fixed slice"));
    take(payload, &mut pos, 26)?; // addr_recv
    take(payload, &mut pos, 26)?; // addr_from
    let nonce = u64::from_le_bytes(take(payload, &mut pos, 8)?.try_into().expect("fixed slice"));
    let ua_len = take_varint(payload, &mut pos)?;
    if ua_len > 256 {
        return Err(ProtocolError::Malformed("oversized user agent"));
    }
    let user_agent = String::from_utf8_lossy(take(payload, &mut pos, ua_len as usize)?).into_owned();
    let start_height =
        i32::from_le_bytes(take(payload, &mut pos, 4)?.try_into().expect("fixed slice"));
    // the trailing relay flag is optional in old versions
    Ok(VersionInfo {
        version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
    })
}

// ----------------------------------------------------------------- addresses

/// Parse an addr message: 30-byte entries of `time | services | ip | port`.
/// IPv4-mapped addresses come back as plain V4 sockets.
pub fn parse_addr_payload(payload: &[u8]) -> Result<Vec<SocketAddr>, ProtocolError> {
    let mut pos = 0;
    let count = take_varint(payload, &mut pos)?;
    if count > 1000 {
        return Err(ProtocolError::Malformed("oversized addr"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        take(payload, &mut pos, 4)?; // last-seen time
        take(payload, &mut pos, 8)?; // services
        let ip: [u8; 16] = take(payload, &mut pos, 16)?.try_into().expect("fixed slice");
        let port =
            u16::from_be_bytes(take(payload, &mut pos, 2)?.try_into().expect("fixed slice"));
        let v6 = Ipv6Addr::from(ip);
        let addr = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        out.push(SocketAddr::new(addr, port));
    }
    if pos != payload.len() {
        return Err(ProtocolError::Malformed("trailing addr bytes"));
    }
    Ok(out)
}

pub fn build_addr_payload(addrs: &[(u32, u64, SocketAddr)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + addrs.len() * 30);
    write_compact_size(&mut out, addrs.len() as u64);
    for (time, services, addr) in addrs {
        out.extend_from_slice(&time.to_le_bytes());
        out.extend_from_slice(&services.to_le_bytes());
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out.extend_from_slice(&ip.octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}
