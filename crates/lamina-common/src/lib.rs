//! # lamina-common
//!
//! Shared types for the Lamina overlay layer driver.
//!
//! This crate provides:
//! - Layer ID validation and link alias generation
//! - The on-disk path scheme of the layer store
//! - Quota size parsing
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod size;

pub use error::{LaminaError, LaminaResult, RepairIssue};
pub use id::{Digest, LayerId, LinkId};
pub use paths::StorePaths;
pub use size::ByteSize;
