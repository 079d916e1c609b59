//! Node names and tree paths
//!
//! A [`Name`] is one path segment. Names compare by the bytes of their text,
//! which is the order children are stored in and searched by.

use arbor_common::{Error, Result};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Interned path segment
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(Arc<str>);

impl Name {
    /// Create a name, checking that it is a valid path segment
    pub fn new(text: &str) -> Result<Self> {
        validate_segment(text)?;
        Ok(Self(Arc::from(text)))
    }

    /// The root's name: the only empty name
    pub fn root() -> Self {
        Self(Arc::from(""))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_segment(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(Error::InvalidPath("empty name".into()));
    }
    if text.contains('/') || text.contains('\0') {
        return Err(Error::InvalidPath(format!("illegal character in name {text:?}")));
    }
    if text.len() > crate::encoding::MAX_INCREMENTAL_LEN {
        return Err(Error::InvalidPath(format!(
            "name of {} bytes is too long",
            text.len()
        )));
    }
    Ok(())
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path from the root to a node; empty for the root itself
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath(Vec<Name>);

impl TreePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_names(names: Vec<Name>) -> Self {
        Self(names)
    }

    /// Parse `/a/b/c` without interning; see [`NameEncoder::decode_path`]
    pub fn parse(text: &str) -> Result<Self> {
        InternedNames::transient().decode_path(text)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Name] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn name(&self) -> Option<&Name> {
        self.0.last()
    }

    /// Name a record stored at this path carries ([`Name::root`] for the root)
    pub fn leaf_name(&self) -> Name {
        self.0.last().cloned().unwrap_or_else(Name::root)
    }

    pub fn parent(&self) -> Option<TreePath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn child(&self, name: Name) -> TreePath {
        let mut names = self.0.clone();
        names.push(name);
        Self(names)
    }

    /// True when `self` equals `other` or lies below it
    pub fn starts_with(&self, other: &TreePath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Segments joined with `/`, without a leading slash (`""` for the root)
    pub fn to_key(&self) -> String {
        let mut key = String::new();
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                key.push('/');
            }
            key.push_str(name.as_str());
        }
        key
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.to_key())
    }
}

/// Maps text to ordered names (the name encoder collaborator)
pub trait NameEncoder: Send + Sync {
    /// Encode a single segment
    fn encode(&self, text: &str) -> Result<Name>;

    /// Decode `/a/b/c` (leading and trailing slashes optional) into segments
    fn decode_path(&self, text: &str) -> Result<TreePath> {
        let mut names = Vec::new();
        for segment in text.split('/').filter(|s| !s.is_empty()) {
            names.push(self.encode(segment)?);
        }
        Ok(TreePath(names))
    }

    /// Decode the slash-joined key form produced by [`TreePath::to_key`]
    fn decode_key(&self, key: &str) -> Result<TreePath> {
        if key.is_empty() {
            return Ok(TreePath::root());
        }
        let mut names = Vec::new();
        for segment in key.split('/') {
            names.push(self.encode(segment)?);
        }
        Ok(TreePath(names))
    }
}

/// Default encoder: deduplicates names through a shared set
pub struct InternedNames {
    pool: Option<Mutex<HashSet<Name>>>,
}

impl InternedNames {
    pub fn new() -> Self {
        Self {
            pool: Some(Mutex::new(HashSet::new())),
        }
    }

    /// Encoder that validates but does not retain names
    pub fn transient() -> Self {
        Self { pool: None }
    }

    /// Number of distinct names held
    pub fn len(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InternedNames {
    fn default() -> Self {
        Self::new()
    }
}

impl NameEncoder for InternedNames {
    fn encode(&self, text: &str) -> Result<Name> {
        let Some(pool) = &self.pool else {
            return Name::new(text);
        };
        let mut pool = pool.lock();
        if let Some(existing) = pool.get(text) {
            return Ok(existing.clone());
        }
        let name = Name::new(text)?;
        pool.insert(name.clone());
        Ok(name)
    }
}
