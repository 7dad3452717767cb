//! # Mooring Core
//!
//! Object model for the Mooring offline-sync SDK.
//!
//! This crate provides:
//! - [`ObjectState`], the immutable server snapshot of an object, and its builder
//! - field operations and [`OperationSet`]s with their coalescing rules
//! - [`SyncObject`], the live handle layering queued operations on top of
//!   server state, with dispatch-ordered save results
//! - [`ObjectRegistry`], the session-wide identity map
//! - [`LocalIdManager`], the on-disk ledger of temporary identities
//! - [`Acl`] and visibility checks
//! - [`QueryState`] and its builder
//! - [`RestCommand`] and the [`CommandExecutor`] seam to the network layer
//!
//! ## Usage
//!
//! ```
//! use mooring_core::{QueryState, SyncObject};
//!
//! let post = SyncObject::new("Post").unwrap();
//! post.put("title", "hello").unwrap();
//! post.increment("views", 1).unwrap();
//! assert!(post.is_dirty_key("views"));
//!
//! let query = QueryState::builder("Post")
//!     .where_greater_than("views", 0)
//!     .order_by_descending("views")
//!     .build();
//! assert_eq!(query.to_rest()["order"], "-views");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod acl;
mod class;
mod command;
mod config;
mod error;
mod local_id;
mod object;
mod operation;
mod operation_set;
mod query;
mod registry;
mod relation;
mod state;

pub use acl::{AccessContext, Acl, Permissions, ACL_KEY};
pub use class::{
    validate_class_name, ClassKind, INSTALLATION_CLASS, PIN_CLASS, ROLE_CLASS, SESSION_CLASS,
    USER_CLASS,
};
pub use command::{CommandExecutor, Method, RestCommand};
pub use config::MooringConfig;
pub use error::{codes, ErrorKind, MooringError, MooringResult};
pub use local_id::{is_local_id, LocalIdEntry, LocalIdManager};
pub use object::{PendingSave, SyncObject};
pub use operation::FieldOperation;
pub use operation_set::OperationSet;
pub use query::{
    CachePolicy, Constraint, KeyConstraints, Operand, QueryBuilder, QueryConstraints, QueryState,
    RelatedTo,
};
pub use registry::ObjectRegistry;
pub use relation::Relation;
pub use state::{ObjectState, ObjectStateBuilder, RESERVED_KEYS};
