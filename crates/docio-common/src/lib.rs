//! DocIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, replica state machine, error
//! taxonomy, configuration and content digests used by every DocIO
//! component.

pub mod config;
pub mod digest;
pub mod error;
pub mod types;

pub use config::Config;
pub use digest::{ContentDigest, DigestBuilder, frame_checksum};
pub use error::{Error, Result};
pub use types::*;
