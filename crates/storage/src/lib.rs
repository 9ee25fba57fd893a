//! Storage layer for Mandara Offline
//!
//! This crate provides durable key-value persistence behind a single uniform
//! async contract, selecting the most capable backend available at runtime:
//! sled, then embedded SQLite, then a checksummed flat file, then a volatile
//! in-memory map as the last resort.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod file_store;
pub mod memory_store;
pub mod sled_store;
pub mod sqlite_store;

pub use driver::{DriverKind, OfflineStore, Result, StoreBackend, StoreConfig, StoreError};
pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use sled_store::SledStore;
pub use sqlite_store::SqliteStore;
