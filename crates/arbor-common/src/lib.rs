//! Arbor Common - Shared types and utilities
//!
//! This crate provides the error type and configuration structures
//! used across all Arbor components.

pub mod config;
pub mod error;

pub use config::{
    BaseIndexConfig, CompactionConfig, EvictionConfig, OverlayConfig, PreloadMode, StoreConfig,
};
pub use error::{Error, Result};
