//! Bitcoin-style binary encoding
//!
//! Compact-size integers, script pushes and the small number encoding used
//! by BIP34 height commitments.

use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;

/// Append a compact-size (varint) integer
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Encoded length of a compact-size integer
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Read a compact-size integer from the front of `bytes`
///
/// Returns the value and the number of bytes consumed.
pub fn read_compact_size(bytes: &[u8]) -> Result<(u64, usize)> {
    let first = *bytes
        .first()
        .ok_or_else(|| Error::encoding("empty compact size"))?;
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        n => return Ok((n as u64, 1)),
    };
    if bytes.len() < 1 + width {
        return Err(Error::encoding("truncated compact size"));
    }
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&bytes[1..1 + width]);
    Ok((u64::from_le_bytes(buf), 1 + width))
}

/// Append `data` as a single script push
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Minimal script-number encoding of a non-negative integer
pub fn script_number(n: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut value = n;
    while value > 0 {
        out.push((value & 0xff) as u8);
        value >>= 8;
    }
    // Keep the sign bit clear
    if let Some(last) = out.last() {
        if last & 0x80 != 0 {
            out.push(0);
        }
    }
    out
}

/// BIP34 height commitment as a script push
pub fn push_height(script: &mut Vec<u8>, height: u64) {
    match height {
        0 => script.push(0x00),
        1..=16 => script.push(0x50 + height as u8),
        _ => push_data(script, &script_number(height)),
    }
}

/// Little-endian writer helpers over a byte vector
pub trait WriteLe {
    fn put_u32_le(&mut self, value: u32);
    fn put_u64_le(&mut self, value: u64);
    fn put_i64_le(&mut self, value: i64);
}

impl WriteLe for Vec<u8> {
    fn put_u32_le(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.extend_from_slice(&buf);
    }

    fn put_u64_le(&mut self, value: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.extend_from_slice(&buf);
    }

    fn put_i64_le(&mut self, value: i64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.extend_from_slice(&buf);
    }
}

/// Reverse the byte order inside every 4-byte word
///
/// Stratum v1 transmits the previous block hash this way.
pub fn swap_words(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks(4)
        .flat_map(|chunk| chunk.iter().rev().copied())
        .collect()
}
