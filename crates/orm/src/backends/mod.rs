//! Storage Driver Abstractions
//!
//! The driver contract the mapping engine consumes, and an in-memory driver
//! that implements all of it.

pub mod core;
pub mod memory;

pub use core::*;
pub use memory::{MemoryDriver, Operation};
