//! Union of the base index and the overlay stack

use crate::base::{BaseIndex, Probe, ScratchNode};
use crate::names::TreePath;
use crate::overlay::{CompoundOverlay, OverlaySegment, Override};
use crate::record::{InternalFields, NodeRecord};
use arbor_common::{Error, Result};
use std::sync::Arc;

/// One consistent set of layers: a base index and the segments above it
#[derive(Clone)]
pub struct UnionView {
    base: Arc<BaseIndex>,
    overlay: CompoundOverlay,
}

impl UnionView {
    pub fn new(base: Arc<BaseIndex>, overlay: CompoundOverlay) -> Self {
        Self { base, overlay }
    }

    pub fn base(&self) -> &Arc<BaseIndex> {
        &self.base
    }

    pub fn overlay(&self) -> &CompoundOverlay {
        &self.overlay
    }

    /// Current record at `path`
    pub fn get(&self, path: &TreePath) -> Result<Option<NodeRecord>> {
        Ok(match self.overlay.get_override(path)? {
            Override::Updated(record) => Some(record),
            Override::Deleted => None,
            Override::NotOverridden => self.base.get(path)?,
            Override::Patched(fields) => self.base.get(path)?.map(|mut record| {
                record.apply_fields(&fields);
                record
            }),
        })
    }

    /// Current record at `path` if answering needs no I/O
    pub fn get_if_in_memory(&self, path: &TreePath) -> Probe {
        match self.overlay.get_override_if_cached(path) {
            None => Probe::NotLoaded,
            Some(Override::Updated(record)) => Probe::Found(record),
            Some(Override::Deleted) => Probe::Missing,
            Some(Override::NotOverridden) => self.base.get_if_in_memory(path),
            Some(Override::Patched(fields)) => match self.base.get_if_in_memory(path) {
                Probe::Found(mut record) => {
                    record.apply_fields(&fields);
                    Probe::Found(record)
                }
                other => other,
            },
        }
    }

    /// Records of the children of `path` that currently exist
    pub fn list_children(&self, path: &TreePath) -> Result<Vec<NodeRecord>> {
        let Some(record) = self.get(path)? else {
            return Err(Error::InvalidPath(format!("{path} does not exist")));
        };
        let mut children = Vec::with_capacity(record.children.len());
        for name in &record.children {
            if let Some(child) = self.get(&path.child(name.clone()))? {
                children.push(child);
            }
        }
        Ok(children)
    }

    pub fn put(&self, path: &TreePath, record: &NodeRecord) -> Result<()> {
        self.active()?.put(path, record)
    }

    pub fn put_fields_only(&self, path: &TreePath, fields: &InternalFields) -> Result<bool> {
        self.active()?.put_fields_only(path, fields)
    }

    pub fn remove(&self, path: &TreePath) -> Result<bool> {
        self.active()?.remove(path)
    }

    fn active(&self) -> Result<&Arc<OverlaySegment>> {
        self.overlay
            .active()
            .ok_or_else(|| Error::storage("no active overlay segment"))
    }

    /// Materialize the reachable tree for a new base index.
    ///
    /// Child names whose node does not resolve are dropped from the parent.
    /// Returns `None` when the root itself does not exist.
    pub fn materialize(&self) -> Result<Option<ScratchNode>> {
        self.materialize_at(&TreePath::root())
    }

    fn materialize_at(&self, path: &TreePath) -> Result<Option<ScratchNode>> {
        let Some(mut record) = self.get(path)? else {
            return Ok(None);
        };
        let mut children = Vec::with_capacity(record.children.len());
        for name in &record.children {
            if let Some(child) = self.materialize_at(&path.child(name.clone()))? {
                children.push(child);
            }
        }
        record.children = children.iter().map(|c| c.record.name.clone()).collect();
        record.transient = Default::default();
        Ok(Some(ScratchNode::new(record, children)))
    }
}
