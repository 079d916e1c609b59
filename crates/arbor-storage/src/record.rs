//! Node record types
//!
//! A [`NodeRecord`] is the persisted payload of one tree node. The node's own
//! name is carried in memory but never written; it is implied by the path a
//! record is stored under.

use crate::names::Name;
use arbor_common::{Error, Result};
use std::collections::BTreeMap;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    Directory = 1,
    File = 2,
}

impl NodeKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Directory),
            2 => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::File => "file",
        }
    }
}

/// Evaluation status of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrStatus {
    Dirty = 0,
    Pending = 1,
    Ok = 2,
}

impl AttrStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Dirty),
            1 => Some(Self::Pending),
            2 => Some(Self::Ok),
            _ => None,
        }
    }
}

/// Typed attribute payload
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl AttrValue {
    /// Wire tag
    pub fn tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Text(_) => 4,
            Self::Bytes(_) => 5,
        }
    }
}

/// Attribute value with its evaluation bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub value: AttrValue,
    /// When the value was computed (unix millis)
    pub evaluated_at: u64,
    pub status: AttrStatus,
}

impl Attribute {
    pub fn new(value: AttrValue, evaluated_at: u64, status: AttrStatus) -> Self {
        Self {
            value,
            evaluated_at,
            status,
        }
    }
}

/// In-memory bookkeeping that is never written to a base index frame
#[derive(Debug, Clone, Default)]
pub struct Transient {
    /// Last time the layer above refreshed this node (unix millis)
    pub last_refresh_time: u64,
    /// Attributes the layer above wants recomputed
    pub recompute_mask: u64,
    /// Reads served for this node while it stayed loaded
    pub lru_hits: u64,
    /// Last read of this node (unix millis)
    pub last_query_time: u64,
}

/// Internal fields that can be updated without rewriting a whole record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalFields {
    pub flags: u32,
    pub update_time: u64,
    pub update_sequence: u64,
    pub last_refresh_time: u64,
}

/// Persisted payload of one tree node
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// Node name; implied by the path, never persisted
    pub name: Name,
    pub kind: NodeKind,
    /// Opaque bitmask owned by the caller
    pub flags: u32,
    /// Child names, strictly increasing
    pub children: Vec<Name>,
    pub attributes: BTreeMap<String, Attribute>,
    pub external_created_at: i64,
    pub external_modified_at: i64,
    pub external_length: u64,
    /// Set by the store on each logical write (unix millis)
    pub update_time: u64,
    /// Set by the store on each logical write
    pub update_sequence: u64,
    pub transient: Transient,
}

impl NodeRecord {
    pub fn new(name: Name, kind: NodeKind) -> Self {
        Self {
            name,
            kind,
            flags: 0,
            children: Vec::new(),
            attributes: BTreeMap::new(),
            external_created_at: 0,
            external_modified_at: 0,
            external_length: 0,
            update_time: 0,
            update_sequence: 0,
            transient: Transient::default(),
        }
    }

    /// Directory record; `children` are sorted and deduplicated
    pub fn directory(name: Name, mut children: Vec<Name>) -> Self {
        children.sort();
        children.dedup();
        Self {
            children,
            ..Self::new(name, NodeKind::Directory)
        }
    }

    pub fn file(name: Name, length: u64) -> Self {
        Self {
            external_length: length,
            ..Self::new(name, NodeKind::File)
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Binary search for a child name
    pub fn child_index(&self, name: &str) -> Option<usize> {
        self.children
            .binary_search_by(|c| c.as_str().cmp(name))
            .ok()
    }

    /// Insert a child name keeping order; returns false if already present
    pub fn add_child(&mut self, name: Name) -> bool {
        match self.children.binary_search(&name) {
            Ok(_) => false,
            Err(pos) => {
                self.children.insert(pos, name);
                true
            }
        }
    }

    /// Remove a child name; returns false if absent
    pub fn remove_child(&mut self, name: &str) -> bool {
        match self.child_index(name) {
            Some(pos) => {
                self.children.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, attribute: Attribute) {
        self.attributes.insert(name.into(), attribute);
    }

    /// Check the children ordering invariant
    pub fn validate(&self) -> Result<()> {
        for pair in self.children.windows(2) {
            if pair[0] >= pair[1] {
                return Err(Error::invalid_argument(format!(
                    "children of {} not strictly sorted at {:?}",
                    self.name, pair[1]
                )));
            }
        }
        Ok(())
    }

    pub fn internal_fields(&self) -> InternalFields {
        InternalFields {
            flags: self.flags,
            update_time: self.update_time,
            update_sequence: self.update_sequence,
            last_refresh_time: self.transient.last_refresh_time,
        }
    }

    /// Overwrite the internal fields
    pub fn apply_fields(&mut self, fields: &InternalFields) {
        self.flags = fields.flags;
        self.update_time = fields.update_time;
        self.update_sequence = fields.update_sequence;
        self.transient.last_refresh_time = fields.last_refresh_time;
    }

    /// Same record under a different name
    pub fn renamed(&self, name: Name) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }
}

/// Equality over persisted fields; transient bookkeeping is ignored
impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.flags == other.flags
            && self.children == other.children
            && self.attributes == other.attributes
            && self.external_created_at == other.external_created_at
            && self.external_modified_at == other.external_modified_at
            && self.external_length == other.external_length
            && self.update_time == other.update_time
            && self.update_sequence == other.update_sequence
    }
}
