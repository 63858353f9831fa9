//! ecfs Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, checksums and
//! configuration shared by the coding engine, the storage module and the OSD.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, content_hash};
pub use config::OsdConfig;
pub use error::{Error, Result};
pub use types::*;
