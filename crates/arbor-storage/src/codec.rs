//! Node record codec
//!
//! Frame format (all integers little-endian):
//! ```text
//! +-----------+-------------+-------------------------+-----------+
//! | Frame len | Record body | Child offsets           | Delimiter |
//! | 4B        | var         | 8B x children.len()     | 1B (0xA5) |
//! +-----------+-------------+-------------------------+-----------+
//! ```
//!
//! Record body:
//! ```text
//! kind(1) flags(4) created(8) modified(8) length(8) update_time(8)
//! update_seq(8) child_count(4) children(incremental) attr_count(2) attrs
//! ```
//!
//! Each attribute is `descriptor(2) evaluated_at(8) status(1) tag(1) payload`.
//! The node's own name is not stored; decoding takes it from the caller.
//! Child offsets are fixed-width, so a frame's length is known before the
//! offsets are.

use crate::attributes::AttributeRegistry;
use crate::encoding::{Decoder, IncrementalDecoder, IncrementalEncoder};
use crate::names::{Name, NameEncoder};
use crate::record::{AttrStatus, AttrValue, Attribute, NodeKind, NodeRecord, Transient};
use arbor_common::{Error, Result};
use bytes::BufMut;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Self-check byte closing every frame
pub const FRAME_DELIMITER: u8 = 0xA5;

/// Size of the frame length prefix
pub const FRAME_LEN_SIZE: usize = 4;

/// Size of one child offset
pub const OFFSET_SIZE: usize = 8;

/// Record body with no children and no attributes
const MIN_BODY_SIZE: usize = 1 + 4 + 8 * 5 + 4 + 2;

/// Smallest possible frame: prefix, empty body, delimiter
pub const MIN_FRAME_SIZE: usize = FRAME_LEN_SIZE + MIN_BODY_SIZE + 1;

/// A frame decoded from a buffer
#[derive(Debug)]
pub struct DecodedFrame {
    pub record: NodeRecord,
    /// File offsets of the children, same order as `record.children`
    pub child_offsets: Vec<u64>,
    /// Bytes consumed
    pub len: usize,
}

/// Encoder/decoder for records and frames
#[derive(Clone)]
pub struct RecordCodec {
    registry: Arc<AttributeRegistry>,
    names: Arc<dyn NameEncoder>,
}

impl RecordCodec {
    pub fn new(registry: Arc<AttributeRegistry>, names: Arc<dyn NameEncoder>) -> Self {
        Self { registry, names }
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    pub fn names(&self) -> &Arc<dyn NameEncoder> {
        &self.names
    }

    /// Append the record body to `out`
    pub fn encode_record(&self, record: &NodeRecord, out: &mut Vec<u8>) -> Result<()> {
        record.validate()?;

        out.put_u8(record.kind as u8);
        out.put_u32_le(record.flags);
        out.put_i64_le(record.external_created_at);
        out.put_i64_le(record.external_modified_at);
        out.put_u64_le(record.external_length);
        out.put_u64_le(record.update_time);
        out.put_u64_le(record.update_sequence);

        let child_count = u32::try_from(record.children.len())
            .map_err(|_| Error::invalid_argument("too many children"))?;
        out.put_u32_le(child_count);
        let mut names = IncrementalEncoder::new();
        for child in &record.children {
            names.encode(out, child.as_str())?;
        }

        let attr_count = u16::try_from(record.attributes.len())
            .map_err(|_| Error::invalid_argument("too many attributes"))?;
        out.put_u16_le(attr_count);
        for (name, attr) in &record.attributes {
            out.put_u16_le(self.registry.index_of(name)?);
            out.put_u64_le(attr.evaluated_at);
            out.put_u8(attr.status as u8);
            out.put_u8(attr.value.tag());
            match &attr.value {
                AttrValue::Null => {}
                AttrValue::Bool(b) => out.put_u8(u8::from(*b)),
                AttrValue::Int(i) => out.put_i64_le(*i),
                AttrValue::Float(f) => out.put_f64_le(*f),
                AttrValue::Text(s) => put_blob(out, s.as_bytes())?,
                AttrValue::Bytes(b) => put_blob(out, b)?,
            }
        }
        Ok(())
    }

    /// Record body as a fresh buffer
    pub fn record_bytes(&self, record: &NodeRecord) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        self.encode_record(record, &mut out)?;
        Ok(out)
    }

    /// Decode a record body; `name` comes from the path it was stored under
    pub fn decode_record(&self, dec: &mut Decoder<'_>, name: Name) -> Result<NodeRecord> {
        let kind_byte = dec.u8()?;
        let kind = NodeKind::from_u8(kind_byte)
            .ok_or_else(|| Error::Serialization(format!("unknown node kind {kind_byte}")))?;
        let flags = dec.u32()?;
        let external_created_at = dec.i64()?;
        let external_modified_at = dec.i64()?;
        let external_length = dec.u64()?;
        let update_time = dec.u64()?;
        let update_sequence = dec.u64()?;

        let child_count = dec.u32()? as usize;
        // Each child costs at least 4 bytes; reject counts the buffer cannot hold
        if child_count > dec.remaining() / 4 {
            return Err(Error::UnexpectedEof);
        }
        let mut children: Vec<Name> = Vec::with_capacity(child_count);
        let mut names = IncrementalDecoder::new();
        for _ in 0..child_count {
            let text = names.decode(dec)?;
            let child = self
                .names
                .encode(&text)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            if let Some(prev) = children.last() {
                if *prev >= child {
                    return Err(Error::Serialization(format!(
                        "children not strictly sorted at {child:?}"
                    )));
                }
            }
            children.push(child);
        }

        let attr_count = dec.u16()?;
        let mut attributes = BTreeMap::new();
        for _ in 0..attr_count {
            let descriptor = dec.u16()?;
            let attr_name = self.registry.name_of(descriptor)?.to_string();
            let evaluated_at = dec.u64()?;
            let status_byte = dec.u8()?;
            let status = AttrStatus::from_u8(status_byte).ok_or_else(|| {
                Error::Serialization(format!("unknown attribute status {status_byte}"))
            })?;
            let value = match dec.u8()? {
                0 => AttrValue::Null,
                1 => AttrValue::Bool(dec.u8()? != 0),
                2 => AttrValue::Int(dec.i64()?),
                3 => AttrValue::Float(dec.f64()?),
                4 => {
                    let raw = get_blob(dec)?;
                    AttrValue::Text(String::from_utf8(raw.to_vec()).map_err(|_| {
                        Error::Serialization("attribute text is not UTF-8".into())
                    })?)
                }
                5 => AttrValue::Bytes(get_blob(dec)?.to_vec()),
                tag => {
                    return Err(Error::Serialization(format!(
                        "unknown attribute value tag {tag}"
                    )));
                }
            };
            attributes.insert(attr_name, Attribute::new(value, evaluated_at, status));
        }

        Ok(NodeRecord {
            name,
            kind,
            flags,
            children,
            attributes,
            external_created_at,
            external_modified_at,
            external_length,
            update_time,
            update_sequence,
            transient: Transient::default(),
        })
    }

    /// Encoded frame length for a record.
    ///
    /// Child offsets are fixed-width, so no offsets are needed to size a frame.
    pub fn frame_len(&self, record: &NodeRecord) -> Result<usize> {
        let body = self.record_bytes(record)?;
        Ok(FRAME_LEN_SIZE + body.len() + OFFSET_SIZE * record.children.len() + 1)
    }

    /// Encode a full frame; `child_offsets` must match `record.children`
    pub fn encode_frame(&self, record: &NodeRecord, child_offsets: &[u64]) -> Result<Vec<u8>> {
        if child_offsets.len() != record.children.len() {
            return Err(Error::invalid_argument(format!(
                "{} child offsets for {} children",
                child_offsets.len(),
                record.children.len()
            )));
        }

        let mut out = Vec::with_capacity(128);
        out.put_u32_le(0); // patched below
        self.encode_record(record, &mut out)?;
        for offset in child_offsets {
            out.put_u64_le(*offset);
        }
        out.put_u8(FRAME_DELIMITER);

        let len = u32::try_from(out.len())
            .map_err(|_| Error::invalid_argument("frame exceeds 4GiB"))?;
        out[..FRAME_LEN_SIZE].copy_from_slice(&len.to_le_bytes());
        Ok(out)
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns [`Error::UnexpectedEof`] when `buf` holds only part of the frame.
    pub fn decode_frame(&self, buf: &[u8], name: Name) -> Result<DecodedFrame> {
        let len = peek_frame_len(buf)?;
        if buf.len() < len {
            return Err(Error::UnexpectedEof);
        }

        let mut dec = Decoder::new(&buf[..len]);
        dec.u32()?;
        let record = self.decode_record(&mut dec, name).map_err(|e| {
            if e.is_eof() {
                malformed("frame body overruns frame length")
            } else {
                e
            }
        })?;

        let mut child_offsets = Vec::with_capacity(record.children.len());
        for _ in 0..record.children.len() {
            child_offsets.push(
                dec.u64()
                    .map_err(|_| malformed("child offsets overrun frame length"))?,
            );
        }

        let delimiter = dec.u8().map_err(|_| malformed("missing frame delimiter"))?;
        if delimiter != FRAME_DELIMITER {
            return Err(malformed(format!("bad frame delimiter {delimiter:#04x}")));
        }
        if dec.remaining() != 0 {
            return Err(malformed(format!(
                "{} trailing bytes in frame",
                dec.remaining()
            )));
        }

        Ok(DecodedFrame {
            record,
            child_offsets,
            len,
        })
    }
}

/// Frame length from the prefix at the start of `buf`
pub fn peek_frame_len(buf: &[u8]) -> Result<usize> {
    let len = Decoder::new(buf).u32()? as usize;
    if len < MIN_FRAME_SIZE {
        return Err(malformed(format!("frame length {len} below minimum")));
    }
    Ok(len)
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization(reason.into())
}

fn put_blob(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::invalid_argument("attribute value exceeds 4GiB"))?;
    out.put_u32_le(len);
    out.put_slice(bytes);
    Ok(())
}

fn get_blob<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8]> {
    let len = dec.u32()? as usize;
    dec.bytes(len)
}
