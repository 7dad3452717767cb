//! # Mooring Storage
//!
//! Keyed byte storage for Mooring.
//!
//! This crate provides the lowest-level persistence abstraction. Stores are
//! **opaque byte stores** scoped to an app-private root - they do not
//! interpret the records they hold.
//!
//! ## Design Principles
//!
//! - Stores read and write whole records by key
//! - Writes are atomic (old record or new record, never a torn one)
//! - No knowledge of objects, pins or ledgers
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use mooring_storage::{ByteStore, InMemoryStore};
//!
//! let store = InMemoryStore::new();
//! store.write("local_ids/local_01", b"hello world").unwrap();
//! assert!(store.exists("local_ids/local_01").unwrap());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{validate_key, ByteStore};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
