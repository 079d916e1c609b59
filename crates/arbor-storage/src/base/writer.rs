//! Two-pass base index writer
//!
//! Pass one sizes every frame and subtree; pass two writes frames in
//! depth-first preorder, so each child's offset is known before its parent
//! is written.

use crate::blob::{BlobStorage, BlobWriter};
use crate::codec::RecordCodec;
use crate::record::NodeRecord;
use arbor_common::{Error, Result};
use std::io::Write;
use tracing::{error, info};

/// Fully materialized node to be written
#[derive(Debug, Clone)]
pub struct ScratchNode {
    pub record: NodeRecord,
    /// Same names and order as `record.children`
    pub children: Vec<ScratchNode>,
}

impl ScratchNode {
    /// Pair a record with its child nodes, ordering the children by name
    pub fn new(record: NodeRecord, mut children: Vec<ScratchNode>) -> Self {
        children.sort_by(|a, b| a.record.name.cmp(&b.record.name));
        Self { record, children }
    }

    /// Nodes in this subtree
    pub fn count(&self) -> u64 {
        1 + self.children.iter().map(Self::count).sum::<u64>()
    }
}

/// Outcome of writing a base index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub nodes: u64,
    pub bytes: u64,
    /// Frames whose actual offset or length disagreed with pass one
    pub integrity_errors: u64,
}

/// Pass-one sizes, parallel to a [`ScratchNode`] tree
struct Measured {
    frame_len: u64,
    subtree_len: u64,
    children: Vec<Measured>,
}

/// Write `root` as a new base index file named `file`
pub fn write_base_index(
    blobs: &dyn BlobStorage,
    file: &str,
    root: &ScratchNode,
    codec: &RecordCodec,
) -> Result<WriteSummary> {
    let sizes = measure(root, codec)?;

    let mut writer = blobs.open_write(file, false)?;
    let mut summary = WriteSummary::default();
    write_node(writer.as_mut(), root, &sizes, 0, codec, &mut summary, file)?;
    writer.flush()?;
    writer.sync()?;

    summary.bytes = writer.position();
    if summary.bytes != sizes.subtree_len {
        error!(
            "Base index {} integrity: wrote {} bytes, expected {}",
            file, summary.bytes, sizes.subtree_len
        );
        summary.integrity_errors += 1;
    }

    info!(
        "Wrote base index {} ({} nodes, {} bytes)",
        file, summary.nodes, summary.bytes
    );
    Ok(summary)
}

fn measure(node: &ScratchNode, codec: &RecordCodec) -> Result<Measured> {
    if node.children.len() != node.record.children.len()
        || node
            .children
            .iter()
            .zip(&node.record.children)
            .any(|(child, name)| child.record.name != *name)
    {
        return Err(Error::invalid_argument(format!(
            "child nodes of {:?} do not match its child names",
            node.record.name
        )));
    }

    let frame_len = codec.frame_len(&node.record)? as u64;
    let children = node
        .children
        .iter()
        .map(|child| measure(child, codec))
        .collect::<Result<Vec<_>>>()?;
    let subtree_len = frame_len + children.iter().map(|c| c.subtree_len).sum::<u64>();

    Ok(Measured {
        frame_len,
        subtree_len,
        children,
    })
}

fn write_node(
    writer: &mut dyn BlobWriter,
    node: &ScratchNode,
    sizes: &Measured,
    offset: u64,
    codec: &RecordCodec,
    summary: &mut WriteSummary,
    file: &str,
) -> Result<()> {
    let mut child_offsets = Vec::with_capacity(node.children.len());
    let mut cursor = offset + sizes.frame_len;
    for child in &sizes.children {
        child_offsets.push(cursor);
        cursor += child.subtree_len;
    }

    let actual = writer.position();
    if actual != offset {
        error!(
            "Base index {} integrity: {:?} computed at offset {}, written at {}",
            file, node.record.name, offset, actual
        );
        summary.integrity_errors += 1;
    }

    let frame = codec.encode_frame(&node.record, &child_offsets)?;
    if frame.len() as u64 != sizes.frame_len {
        error!(
            "Base index {} integrity: {:?} frame is {} bytes, estimated {}",
            file,
            node.record.name,
            frame.len(),
            sizes.frame_len
        );
        summary.integrity_errors += 1;
    }
    writer.write_all(&frame)?;
    summary.nodes += 1;

    for ((child, child_sizes), child_offset) in
        node.children.iter().zip(&sizes.children).zip(child_offsets)
    {
        write_node(writer, child, child_sizes, child_offset, codec, summary, file)?;
    }
    Ok(())
}
