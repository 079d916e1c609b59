//! Attribute descriptor registry
//!
//! Frames store attributes by a `u16` descriptor index instead of their name.
//! The registry is a bijection between the two, fixed for the lifetime of an
//! open store. Its name list is persisted in the manifest so that indices keep
//! their meaning across restarts.

use arbor_common::{Error, Result};
use std::collections::HashMap;

/// Name ↔ index mapping for attributes
#[derive(Debug, Clone, Default)]
pub struct AttributeRegistry {
    names: Vec<String>,
    index: HashMap<String, u16>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a persisted name list, in order
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            let name = name.into();
            if registry.index.contains_key(&name) {
                return Err(Error::manifest(format!("duplicate attribute {name:?}")));
            }
            registry.register(name)?;
        }
        Ok(registry)
    }

    /// Register a name if unknown; returns its index
    pub fn register(&mut self, name: impl Into<String>) -> Result<u16> {
        let name = name.into();
        if let Some(&idx) = self.index.get(&name) {
            return Ok(idx);
        }
        let idx = u16::try_from(self.names.len())
            .map_err(|_| Error::invalid_argument("too many attribute descriptors"))?;
        self.index.insert(name.clone(), idx);
        self.names.push(name);
        Ok(idx)
    }

    /// Index for a name; unregistered names are rejected
    pub fn index_of(&self, name: &str) -> Result<u16> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unregistered attribute {name:?}")))
    }

    /// Name for an index
    pub fn name_of(&self, idx: u16) -> Result<&str> {
        self.names
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| Error::Serialization(format!("unknown attribute descriptor {idx}")))
    }

    /// Names in index order (the persisted form)
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_stable() {
        let mut reg = AttributeRegistry::new();
        assert_eq!(reg.register("md5").unwrap(), 0);
        assert_eq!(reg.register("owner").unwrap(), 1);
        assert_eq!(reg.register("md5").unwrap(), 0);
        assert_eq!(reg.name_of(1).unwrap(), "owner");
        assert_eq!(reg.index_of("owner").unwrap(), 1);
    }

    #[test]
    fn test_unknown_lookups() {
        let reg = AttributeRegistry::from_names(["a"]).unwrap();
        assert!(matches!(reg.index_of("b"), Err(Error::InvalidArgument(_))));
        assert!(matches!(reg.name_of(3), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_from_names_rejects_duplicates() {
        assert!(AttributeRegistry::from_names(["a", "b", "a"]).is_err());
        let reg = AttributeRegistry::from_names(["x", "y"]).unwrap();
        assert_eq!(reg.names(), &["x".to_string(), "y".to_string()]);
    }
}
