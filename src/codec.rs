//! Wire-level codec primitives: the variable-length message-size field and
//! big-endian field (de)serialization used by the info message body.
//!
//! Grounded in `network::internal::{Serialize,Deserialize}MsgSizeField`
//! and `utils::serialize.h` of the original library. The size field packs
//! 7 payload bits per byte with the high bit marking "more bytes follow",
//! so a `u32` never needs more than 5 bytes.

use crate::error::{YogiError, YogiResult};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Maximum length in bytes of an encoded size field.
pub const MAX_SIZE_FIELD_LEN: usize = 5;

/// Encodes `msg_size` as a variable-length field, choosing the minimum
/// number of bytes that can represent it (1 byte for values up to 127, up
/// to 5 bytes for the full `u32` range).
pub fn serialize_msg_size_field(msg_size: u32) -> Vec<u8> {
    let length = 1
        + (msg_size >= (1 << 7)) as usize
        + (msg_size >= (1 << 14)) as usize
        + (msg_size >= (1 << 21)) as usize
        + (msg_size >= (1 << 28)) as usize;

    let mut out = Vec::with_capacity(length);
    for i in (1..=length).rev() {
        let mut byte = ((msg_size >> ((i - 1) * 7)) & 0x7F) as u8;
        if i > 1 {
            byte |= 1 << 7;
        }
        out.push(byte);
    }
    out
}

/// Attempts to decode a size field from the front of `buf`. Returns
/// `Some((value, bytes_consumed))` once a byte with the high bit clear is
/// found, or `None` if `buf` is exhausted without completing the field
/// (the caller should wait for more bytes).
pub fn deserialize_msg_size_field(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_SIZE_FIELD_LEN) {
        value |= (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        value <<= 7;
    }
    None
}

pub fn serialize_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_be_bytes());
}

pub fn serialize_i32(buf: &mut Vec<u8>, val: i32) {
    buf.extend_from_slice(&val.to_be_bytes());
}

pub fn serialize_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_be_bytes());
}

pub fn serialize_i64(buf: &mut Vec<u8>, val: i64) {
    buf.extend_from_slice(&val.to_be_bytes());
}

pub fn serialize_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub fn serialize_uuid(buf: &mut Vec<u8>, uuid: &Uuid) {
    buf.extend_from_slice(uuid.as_bytes());
}

/// Cursor-based reader over a byte slice used while deserializing the
/// info message body. Each `read_*` call fails with `DeserializeMsgFailed`
/// on truncation, matching the original's "field (de)serialization fails
/// with a *deserialization* error if a field is truncated".
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> YogiResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(YogiError::DeserializeMsgFailed);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u16(&mut self) -> YogiResult<u16> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn read_i32(&mut self) -> YogiResult<i32> {
        let s = self.take(4)?;
        Ok(i32::from_be_bytes(s.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> YogiResult<u32> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes(s.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> YogiResult<i64> {
        let s = self.take(8)?;
        Ok(i64::from_be_bytes(s.try_into().unwrap()))
    }

    /// Reads a nanosecond duration stored as an `i64`, where `-1` is the
    /// "infinite" sentinel. Returns `None` for the sentinel.
    pub fn read_duration_ns(&mut self) -> YogiResult<Option<i64>> {
        let n = self.read_i64()?;
        Ok(if n == -1 { None } else { Some(n) })
    }

    /// Reads a timestamp stored as nanoseconds since the Unix epoch.
    pub fn read_timestamp(&mut self) -> YogiResult<DateTime<Utc>> {
        let n = self.read_i64()?;
        Utc.timestamp_nanos_opt(n)
            .single()
            .ok_or(YogiError::DeserializeMsgFailed)
    }

    pub fn read_string(&mut self) -> YogiResult<String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(YogiError::DeserializeMsgFailed)?;
        let s = std::str::from_utf8(&rest[..end]).map_err(|_| YogiError::DeserializeMsgFailed)?;
        self.pos += end + 1;
        Ok(s.to_string())
    }

    pub fn read_uuid(&mut self) -> YogiResult<Uuid> {
        let s = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(s);
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn read_u8(&mut self) -> YogiResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Serializes a nanosecond duration with `-1` meaning "infinite".
pub fn serialize_duration_ns(buf: &mut Vec<u8>, ns: Option<i64>) {
    serialize_i64(buf, ns.unwrap_or(-1));
}

/// Serializes a timestamp as nanoseconds since the Unix epoch.
pub fn serialize_timestamp(buf: &mut Vec<u8>, ts: DateTime<Utc>) {
    let ns = ts.timestamp_nanos_opt().unwrap_or(0);
    serialize_i64(buf, ns);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_field_round_trips_boundary_values() {
        let cases = [
            0u32,
            1,
            127,
            128,
            16383,
            16384,
            2_097_151,
            2_097_152,
            268_435_455,
            268_435_456,
            u32::MAX,
        ];
        for &n in &cases {
            let encoded = serialize_msg_size_field(n);
            let (decoded, consumed) = deserialize_msg_size_field(&encoded).unwrap();
            assert_eq!(decoded, n, "round trip failed for {n}");
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn size_field_picks_minimum_length_encoding() {
        assert_eq!(serialize_msg_size_field(127).len(), 1);
        assert_eq!(serialize_msg_size_field(128).len(), 2);
        assert_eq!(serialize_msg_size_field(16383).len(), 2);
        assert_eq!(serialize_msg_size_field(16384).len(), 3);
        assert_eq!(serialize_msg_size_field(u32::MAX).len(), 5);
    }

    #[test]
    fn size_field_reports_need_more_bytes_on_truncation() {
        let encoded = serialize_msg_size_field(16384);
        assert!(deserialize_msg_size_field(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn string_field_requires_null_terminator() {
        let mut buf = Vec::new();
        serialize_string(&mut buf, "hello");
        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "hello");

        let unterminated = b"no-terminator".to_vec();
        let mut reader = FieldReader::new(&unterminated);
        assert!(reader.read_string().is_err());
    }

    #[test]
    fn truncated_integer_field_fails() {
        let mut reader = FieldReader::new(&[0u8; 3]);
        assert!(reader.read_i64().is_err());
    }
}
