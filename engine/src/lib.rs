//! # Tandem Engine
//!
//! Deterministic core of the Tandem local-first sync engine.
//!
//! This crate holds the logic that decides *what* a synchronized collection
//! looks like; the `tandem-client` crate decides *when* and *how* data moves
//! between the local store and the remote service.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, the network or a runtime
//! - **Deterministic**: the same snapshots always merge to the same result
//! - **Generic**: every collection is described by a [`CollectionDescriptor`]
//!   instead of bespoke per-collection code
//!
//! ## Core Concepts
//!
//! ### Records and snapshots
//!
//! A [`Record`] is one user-data item: a client-assigned [`LocalId`], an
//! optional server-assigned [`RemoteId`], an `updated_at` timestamp and a
//! map of content fields. A [`Snapshot`] is the ordered contents of one
//! collection at a point in time.
//!
//! ### Identifiers
//!
//! The [`identity`] module maps between the two identifier regimes so the UI
//! never needs to know which one an identifier came from.
//!
//! ### Merge
//!
//! [`merge`] combines a local and a remote snapshot. Local data is never
//! dropped because the remote side is missing it, and remote content only
//! replaces local content when it is strictly newer.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{
//!     merge, CollectionDescriptor, FieldDef, FieldType, LocalId, Record, Snapshot,
//! };
//! use serde_json::json;
//!
//! let notes = CollectionDescriptor::new(
//!     "notes",
//!     vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("content", FieldType::String),
//!     ],
//! );
//!
//! let local = Snapshot::from_records(vec![Record::new(
//!     LocalId(1),
//!     1_706_745_600_000,
//!     json!({"title": "Groceries", "content": "eggs"}),
//! )])
//! .unwrap();
//!
//! // An empty remote snapshot never wipes local data.
//! let outcome = merge(&notes, &local, &[]);
//! assert_eq!(outcome.snapshot, local);
//! assert!(outcome.report.empty_remote);
//! ```

pub mod error;
pub mod identity;
pub mod merge;
pub mod record;
pub mod schema;
pub mod snapshot;

// Re-export main types at crate root
pub use error::Error;
pub use identity::{attach_remote_id, derive_stable_local_id, is_remote_id, DERIVED_ID_BASE};
pub use merge::{merge, Adoption, MergeOutcome, MergeReport};
pub use record::{LocalId, Record};
pub use schema::{ChildSpec, CollectionDescriptor, FieldDef, FieldType, IdentityRule, Schema};
pub use snapshot::Snapshot;

/// Type aliases for clarity
pub type RemoteId = String;
pub type CollectionName = String;
pub type PrincipalId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
