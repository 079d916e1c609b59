//! Shared binary encoding helpers
//!
//! All integers are little-endian and fixed-width. Sorted string sequences
//! (child names, overlay paths) use incremental encoding: each string is
//! written relative to the previous one as
//!
//! ```text
//! +-------+------------+--------+
//! | Strip | Suffix len | Suffix |
//! | 2B    | 2B         | var    |
//! +-------+------------+--------+
//! ```
//!
//! where `strip` is the number of trailing bytes removed from the previous
//! string before appending `suffix`.

use arbor_common::{Error, Result};
use bytes::{Buf, BufMut};

/// Largest string that fits an incremental entry
pub const MAX_INCREMENTAL_LEN: usize = u16::MAX as usize;

/// Bounds-checked cursor over an encoded buffer
///
/// Every read that runs past the end returns [`Error::UnexpectedEof`], which
/// callers parsing speculatively treat as "stop here".
pub struct Decoder<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.total - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            Err(Error::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    /// Borrow the next `n` bytes
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Writes a sequence of strings, each relative to the one before
#[derive(Debug, Default, Clone)]
pub struct IncrementalEncoder {
    prev: Vec<u8>,
}

impl IncrementalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `next` after the previously encoded string
    pub fn encode(&mut self, out: &mut Vec<u8>, next: &str) -> Result<()> {
        let next = next.as_bytes();
        let common = common_prefix_len(&self.prev, next);
        let strip = self.prev.len() - common;
        let suffix = &next[common..];

        if strip > MAX_INCREMENTAL_LEN || suffix.len() > MAX_INCREMENTAL_LEN {
            return Err(Error::invalid_argument(format!(
                "string of {} bytes exceeds incremental encoding limit",
                next.len()
            )));
        }

        out.put_u16_le(strip as u16);
        out.put_u16_le(suffix.len() as u16);
        out.put_slice(suffix);

        self.prev.truncate(common);
        self.prev.extend_from_slice(suffix);
        Ok(())
    }

    /// Encoded size of `next` without writing it
    pub fn encoded_len(&mut self, next: &str) -> usize {
        let next = next.as_bytes();
        let common = common_prefix_len(&self.prev, next);
        self.prev.truncate(common);
        self.prev.extend_from_slice(&next[common..]);
        4 + next.len() - common
    }

    /// Last string written
    pub fn last(&self) -> &[u8] {
        &self.prev
    }

    /// Restart the sequence from `value` (used when reopening a log)
    pub fn reset_to(&mut self, value: &str) {
        self.prev.clear();
        self.prev.extend_from_slice(value.as_bytes());
    }
}

/// Reads a sequence written by [`IncrementalEncoder`]
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    prev: Vec<u8>,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, dec: &mut Decoder<'_>) -> Result<String> {
        let strip = dec.u16()? as usize;
        let suffix_len = dec.u16()? as usize;
        if strip > self.prev.len() {
            return Err(Error::Serialization(format!(
                "incremental strip {} exceeds previous length {}",
                strip,
                self.prev.len()
            )));
        }
        let suffix = dec.bytes(suffix_len)?;

        let keep = self.prev.len() - strip;
        self.prev.truncate(keep);
        self.prev.extend_from_slice(suffix);

        String::from_utf8(self.prev.clone())
            .map_err(|_| Error::Serialization("incremental string is not UTF-8".into()))
    }

    /// Current value of the sequence
    pub fn last(&self) -> &[u8] {
        &self.prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_shares_prefix() {
        let names = ["alpha", "alphabet", "alphanumeric", "beta", ""];
        let mut out = Vec::new();
        let mut enc = IncrementalEncoder::new();
        for name in names {
            enc.encode(&mut out, name).unwrap();
        }

        // "alphabet" after "alpha" stores only "bet"
        assert_eq!(&out[9..13], &[0, 0, 3, 0]);
        assert_eq!(&out[13..16], b"bet");

        let mut dec = Decoder::new(&out);
        let mut inc = IncrementalDecoder::new();
        for name in names {
            assert_eq!(inc.decode(&mut dec).unwrap(), name);
        }
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_encoded_len_matches() {
        let names = ["a/b/c", "a/b/d", "a/x", "z"];
        let mut sizing = IncrementalEncoder::new();
        let mut enc = IncrementalEncoder::new();
        for name in names {
            let mut out = Vec::new();
            let expected = sizing.encoded_len(name);
            enc.encode(&mut out, name).unwrap();
            assert_eq!(out.len(), expected);
        }
    }

    #[test]
    fn test_multibyte_prefix_split() {
        // Shared prefix ends inside a multi-byte character
        let names = ["日本", "日时"];
        let mut out = Vec::new();
        let mut enc = IncrementalEncoder::new();
        for name in names {
            enc.encode(&mut out, name).unwrap();
        }
        let mut dec = Decoder::new(&out);
        let mut inc = IncrementalDecoder::new();
        assert_eq!(inc.decode(&mut dec).unwrap(), "日本");
        assert_eq!(inc.decode(&mut dec).unwrap(), "日时");
    }

    #[test]
    fn test_truncated_input_is_eof() {
        let mut out = Vec::new();
        IncrementalEncoder::new().encode(&mut out, "hello").unwrap();
        out.truncate(out.len() - 1);

        let mut dec = Decoder::new(&out);
        let err = IncrementalDecoder::new().decode(&mut dec).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_bad_strip_is_malformed() {
        let bytes = [5u8, 0, 0, 0];
        let mut dec = Decoder::new(&bytes);
        let err = IncrementalDecoder::new().decode(&mut dec).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_decoder_primitives() {
        let mut out = Vec::new();
        out.put_u8(7);
        out.put_u32_le(0xDEAD_BEEF);
        out.put_i64_le(-3);
        out.put_f64_le(1.5);

        let mut dec = Decoder::new(&out);
        assert_eq!(dec.u8().unwrap(), 7);
        assert_eq!(dec.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dec.i64().unwrap(), -3);
        assert_eq!(dec.f64().unwrap(), 1.5);
        assert_eq!(dec.position(), out.len());
        assert!(dec.u8().unwrap_err().is_eof());
    }
}
