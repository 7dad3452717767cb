//! # Mooring Testkit
//!
//! Test utilities for Mooring.
//!
//! This crate provides:
//! - [`FakeBackend`], an in-memory [`CommandExecutor`] that assigns ids,
//!   stores objects and can be switched offline
//! - [`CountingStore`], a byte store wrapper counting reads and writes
//! - fixtures for temporary file stores and sample objects
//! - property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mooring_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn saves_offline_then_flushes() {
//!     let backend = FakeBackend::new();
//!     backend.set_offline(true);
//!     // ... enqueue, then backend.set_offline(false) and flush
//! }
//! ```
//!
//! [`CommandExecutor`]: mooring_core::CommandExecutor

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod counting;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::counting::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use counting::*;
pub use fixtures::*;
pub use generators::*;
