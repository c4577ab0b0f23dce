//! Local persistence for SehatLink offline data.
//!
//! This module provides a trait-based interface for storage engines (in-memory,
//! local filesystem), engine selection by configured name, and the
//! kind-partitioned [`LocalRecordStore`].
//!
//! # Design Principles
//! - Engines store whole tables as opaque bytes; they know nothing about records
//! - Async operations: every engine call is a suspension point
//! - Any engine failure surfaces as `Error::StorageUnavailable`

pub mod choice;
pub mod engine;
pub mod local;
pub mod memory;
pub mod record_store;

pub use choice::{EngineChoice, ENGINE_NAMES};
pub use engine::StorageEngine;
pub use local::LocalEngine;
pub use memory::MemoryEngine;
pub use record_store::LocalRecordStore;
