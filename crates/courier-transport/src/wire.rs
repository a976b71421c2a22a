//! # Courier Wire Format
//!
//! Custom lightweight datagram format — no generic framing dependency.
//! Every datagram opens with a one-byte type tag; all multi-byte
//! integers are big-endian. Five message types cover the whole
//! protocol:
//!
//! ```text
//! DATA          1 + 16 (bundle_id) + 4 + 4 + 4 + 2 + 2 + 4 + 1 + 2 + payload
//! SACK          1 + 16 + 4 (watermark) + 2 (bitmap_len) + bitmap
//! CUSTODY_REQ   1 + 16 + 4 (ttl) + 2 (ranges_len) + ranges (JSON)
//! CUSTODY_ACK   1 + 16 + 8 (nonce) + 2 (ranges_len) + ranges (JSON)
//! DELIVERED     1 + 16
//! ```
//!
//! A decoder treats a short header or an unrecognized type byte as a
//! dropped datagram rather than an error — malformed input on the wire
//! is never fatal to the receiving node.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Hard datagram size ceiling (stays under typical path MTU without
/// fragmentation).
pub const MAX_DATAGRAM: usize = 1200;

/// Fixed width of the NUL-padded bundle-id field on the wire.
pub const BUNDLE_ID_LEN: usize = 16;

/// `recv_watermark` value meaning "no contiguous prefix acked yet".
pub const WATERMARK_NONE: u32 = 0xFFFF_FFFF;

const TYPE_DATA: u8 = 1;
const TYPE_SACK: u8 = 2;
const TYPE_CUSTODY_REQ: u8 = 3;
const TYPE_CUSTODY_ACK: u8 = 4;
const TYPE_DELIVERED: u8 = 5;

const DATA_HEADER_LEN: usize = 40;
const SACK_HEADER_LEN: usize = 23;
const CUSTODY_REQ_HEADER_LEN: usize = 23;
const CUSTODY_ACK_HEADER_LEN: usize = 27;
const DELIVERED_HEADER_LEN: usize = 17;

fn encode_bundle_id(buf: &mut BytesMut, bundle_id: &str) {
    let bytes = bundle_id.as_bytes();
    let n = bytes.len().min(BUNDLE_ID_LEN);
    buf.put_slice(&bytes[..n]);
    for _ in n..BUNDLE_ID_LEN {
        buf.put_u8(0);
    }
}

fn decode_bundle_id(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < BUNDLE_ID_LEN {
        return None;
    }
    let mut raw = [0u8; BUNDLE_ID_LEN];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(BUNDLE_ID_LEN);
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

// ─── Message bodies ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub bundle_id: String,
    pub chunk_id: u32,
    pub total_chunks: u32,
    pub block_id: u32,
    pub k: u16,
    pub r: u16,
    pub checksum: u32,
    pub flags: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackMsg {
    pub bundle_id: String,
    /// `WATERMARK_NONE` encodes "no contiguous prefix acked".
    pub recv_watermark: u32,
    pub bitmap: Bytes,
}

impl SackMsg {
    /// Every chunk_id this SACK asserts as received: the contiguous
    /// prefix up to `recv_watermark`, plus each set bit in the bitmap
    /// (bit 0 of byte 0 is the high-order bit, representing
    /// `watermark + 1`).
    pub fn acked_chunk_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        if self.recv_watermark != WATERMARK_NONE {
            ids.extend(0..=self.recv_watermark);
        }
        let base = if self.recv_watermark == WATERMARK_NONE {
            0
        } else {
            self.recv_watermark + 1
        };
        for (byte_idx, byte) in self.bitmap.iter().enumerate() {
            for bit_pos in 0..8u32 {
                if byte & (1 << (7 - bit_pos)) != 0 {
                    ids.push(base + (byte_idx as u32) * 8 + bit_pos);
                }
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyReqMsg {
    pub bundle_id: String,
    pub ttl_remaining: u32,
    pub ranges: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyAckMsg {
    pub bundle_id: String,
    pub ack_nonce: u64,
    pub ranges: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMsg {
    pub bundle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(DataMsg),
    Sack(SackMsg),
    CustodyReq(CustodyReqMsg),
    CustodyAck(CustodyAckMsg),
    Delivered(DeliveredMsg),
}

impl Message {
    pub fn bundle_id(&self) -> &str {
        match self {
            Message::Data(m) => &m.bundle_id,
            Message::Sack(m) => &m.bundle_id,
            Message::CustodyReq(m) => &m.bundle_id,
            Message::CustodyAck(m) => &m.bundle_id,
            Message::Delivered(m) => &m.bundle_id,
        }
    }

    /// Encodes the message. Returns `None` if the result would exceed
    /// `MAX_DATAGRAM` — the codec must never hand the datagram I/O
    /// layer an over-sized buffer.
    pub fn encode(&self) -> Option<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Message::Data(m) => {
                buf.put_u8(TYPE_DATA);
                encode_bundle_id(&mut buf, &m.bundle_id);
                buf.put_u32(m.chunk_id);
                buf.put_u32(m.total_chunks);
                buf.put_u32(m.block_id);
                buf.put_u16(m.k);
                buf.put_u16(m.r);
                buf.put_u32(m.checksum);
                buf.put_u8(m.flags);
                buf.put_u16(m.payload.len() as u16);
                buf.put_slice(&m.payload);
            }
            Message::Sack(m) => {
                buf.put_u8(TYPE_SACK);
                encode_bundle_id(&mut buf, &m.bundle_id);
                buf.put_u32(m.recv_watermark);
                buf.put_u16(m.bitmap.len() as u16);
                buf.put_slice(&m.bitmap);
            }
            Message::CustodyReq(m) => {
                buf.put_u8(TYPE_CUSTODY_REQ);
                encode_bundle_id(&mut buf, &m.bundle_id);
                buf.put_u32(m.ttl_remaining);
                let json = serde_json::to_vec(&m.ranges).ok()?;
                buf.put_u16(json.len() as u16);
                buf.put_slice(&json);
            }
            Message::CustodyAck(m) => {
                buf.put_u8(TYPE_CUSTODY_ACK);
                encode_bundle_id(&mut buf, &m.bundle_id);
                buf.put_u64(m.ack_nonce);
                let json = serde_json::to_vec(&m.ranges).ok()?;
                buf.put_u16(json.len() as u16);
                buf.put_slice(&json);
            }
            Message::Delivered(m) => {
                buf.put_u8(TYPE_DELIVERED);
                encode_bundle_id(&mut buf, &m.bundle_id);
            }
        }
        if buf.len() > MAX_DATAGRAM {
            return None;
        }
        Some(buf.freeze())
    }

    /// Decodes a datagram. A short header or unrecognized type byte
    /// is treated as a dropped datagram, never an error.
    pub fn decode(data: &[u8]) -> Option<Message> {
        let mut buf = data;
        if buf.remaining() < 1 {
            return None;
        }
        let msg_type = buf.get_u8();
        match msg_type {
            TYPE_DATA => {
                if data.len() < DATA_HEADER_LEN {
                    return None;
                }
                let bundle_id = decode_bundle_id(&mut buf)?;
                let chunk_id = buf.get_u32();
                let total_chunks = buf.get_u32();
                let block_id = buf.get_u32();
                let k = buf.get_u16();
                let r = buf.get_u16();
                let checksum = buf.get_u32();
                let flags = buf.get_u8();
                let payload_len = buf.get_u16() as usize;
                if buf.remaining() < payload_len {
                    return None;
                }
                let payload = Bytes::copy_from_slice(&buf[..payload_len]);
                Some(Message::Data(DataMsg {
                    bundle_id,
                    chunk_id,
                    total_chunks,
                    block_id,
                    k,
                    r,
                    checksum,
                    flags,
                    payload,
                }))
            }
            TYPE_SACK => {
                if data.len() < SACK_HEADER_LEN {
                    return None;
                }
                let bundle_id = decode_bundle_id(&mut buf)?;
                let recv_watermark = buf.get_u32();
                let bitmap_len = buf.get_u16() as usize;
                if buf.remaining() < bitmap_len || bitmap_len > 256 {
                    return None;
                }
                let bitmap = Bytes::copy_from_slice(&buf[..bitmap_len]);
                Some(Message::Sack(SackMsg {
                    bundle_id,
                    recv_watermark,
                    bitmap,
                }))
            }
            TYPE_CUSTODY_REQ => {
                if data.len() < CUSTODY_REQ_HEADER_LEN {
                    return None;
                }
                let bundle_id = decode_bundle_id(&mut buf)?;
                let ttl_remaining = buf.get_u32();
                let ranges_len = buf.get_u16() as usize;
                if buf.remaining() < ranges_len {
                    return None;
                }
                let ranges: Vec<(u32, u32)> = serde_json::from_slice(&buf[..ranges_len]).ok()?;
                Some(Message::CustodyReq(CustodyReqMsg {
                    bundle_id,
                    ttl_remaining,
                    ranges,
                }))
            }
            TYPE_CUSTODY_ACK => {
                if data.len() < CUSTODY_ACK_HEADER_LEN {
                    return None;
                }
                let bundle_id = decode_bundle_id(&mut buf)?;
                let ack_nonce = buf.get_u64();
                let ranges_len = buf.get_u16() as usize;
                if buf.remaining() < ranges_len {
                    return None;
                }
                let ranges: Vec<(u32, u32)> = serde_json::from_slice(&buf[..ranges_len]).ok()?;
                Some(Message::CustodyAck(CustodyAckMsg {
                    bundle_id,
                    ack_nonce,
                    ranges,
                }))
            }
            TYPE_DELIVERED => {
                if data.len() < DELIVERED_HEADER_LEN {
                    return None;
                }
                let bundle_id = decode_bundle_id(&mut buf)?;
                Some(Message::Delivered(DeliveredMsg { bundle_id }))
            }
            _ => None,
        }
    }
}

/// Builds the `(watermark, bitmap)` pair for a SACK from a set of acked
/// chunk ids. The bitmap window is capped at 2048 bits (256 bytes)
/// above the watermark.
pub fn compute_sack_window(acked: &std::collections::BTreeSet<u32>) -> (u32, Bytes) {
    const MAX_WINDOW_BITS: u32 = 2048;

    if acked.is_empty() {
        return (WATERMARK_NONE, Bytes::new());
    }

    let mut watermark: Option<u32> = None;
    let mut next_expected: u32 = 0;
    for &c in acked {
        if c == next_expected {
            watermark = Some(c);
            next_expected += 1;
        } else if c > next_expected {
            break;
        }
    }

    let max_acked = *acked.iter().max().unwrap();
    let watermark_or_none = watermark.unwrap_or(WATERMARK_NONE);
    let above_base = watermark.map(|w| w + 1).unwrap_or(0);

    if max_acked < above_base {
        return (watermark_or_none, Bytes::new());
    }

    let max_high = max_acked.min(above_base.saturating_add(MAX_WINDOW_BITS - 1));
    let num_bits = max_high - above_base + 1;
    let num_bytes = ((num_bits + 7) / 8) as usize;
    let mut bitmap = vec![0u8; num_bytes];

    for &c in acked {
        if c < above_base || c > max_high {
            continue;
        }
        let bit_index = c - above_base;
        let byte_index = (bit_index / 8) as usize;
        let bit_pos = bit_index % 8;
        bitmap[byte_index] |= 1 << (7 - bit_pos);
    }

    (watermark_or_none, Bytes::from(bitmap))
}

/// CRC-32 (IEEE) of a payload.
pub fn crc32(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
