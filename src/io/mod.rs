//! Snapshot file I/O.
//!
//! This module handles the on-disk container format:
//! - `gadget`: the segmented binary block format, one physical file
//! - `snap`: the multi-file logical snapshot built on top of it

pub mod gadget;
pub mod snap;

// Re-export public types and functions
pub use gadget::{BlockData, BlockType, Endian, GadgetError, GadgetFile, GadgetHeader};
pub use snap::GadgetSnapshot;
