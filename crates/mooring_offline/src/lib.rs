//! # Mooring Offline
//!
//! Offline layer of the Mooring SDK: everything that keeps working without
//! a network.
//!
//! This crate provides:
//! - [`LocalDatastore`], rows of object snapshots with named pins and
//!   cascading saves over the reachable object graph
//! - [`OfflineStore`], its async facade with per-identity serialization
//!   and cancellation
//! - [`OfflineQueryEngine`], evaluating a [`QueryState`] against stored
//!   objects: matching, sorting and includes
//! - [`EventuallyQueue`], saves and deletes replayed once the backend is
//!   reachable
//! - [`QueryCache`] and [`QueryController`] for network queries
//! - [`CurrentController`] for the current user and installation
//! - [`DefaultAclController`]
//! - [`MooringContext`], which wires all of the above together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mooring_core::{MooringConfig, QueryState};
//! use mooring_offline::MooringContext;
//! use tokio_util::sync::CancellationToken;
//!
//! let context = MooringContext::open(
//!     MooringConfig::new().local_datastore_enabled(true),
//!     executor,
//! )?;
//! let cancel = CancellationToken::new();
//!
//! let score = context.create_object("GameScore", &cancel).await?;
//! score.put("score", 1337)?;
//! context.pin_all(None, &[score], &cancel).await?;
//!
//! let query = QueryState::builder("GameScore")
//!     .where_greater_than("score", 1000)
//!     .from_local_datastore()
//!     .build();
//! assert_eq!(context.count(&query, &cancel).await?, 1);
//! ```
//!
//! [`QueryState`]: mooring_core::QueryState

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod context;
mod controller;
mod current;
mod datastore;
mod decode;
mod default_acl;
mod eventually;
mod query;
mod store;

pub use cache::{command_fingerprint, QueryCache};
pub use context::MooringContext;
pub use controller::QueryController;
pub use current::{
    CurrentController, CurrentInstallationController, CurrentKind, CurrentUserController,
    InstallationKind, UserKind, INSTALLATION_ID_KEY,
};
pub use datastore::{LocalDatastore, RowSummary, DEFAULT_PIN};
pub use decode::RegistryDecoder;
pub use default_acl::DefaultAclController;
pub use eventually::{EventuallyQueue, FlushSummary};
pub use query::OfflineQueryEngine;
pub use store::{IdentityLocks, OfflineStore};
