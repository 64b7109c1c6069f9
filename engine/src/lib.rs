//! # Tandem Engine
//!
//! The offline-first sync core for business data replicated across devices.
//!
//! Every device is a full peer. Writes happen locally and are exchanged with
//! peers whenever a connection exists. Replicas converge without a server
//! because every field is a conflict-free replicated data type.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing of files, sockets or databases
//! - **Deterministic**: the same set of operations yields the same state,
//!   whatever the delivery order and however often they arrive
//! - **Field granularity**: concurrent writes to different fields never conflict
//!
//! ## Core Concepts
//!
//! ### Causal clock
//!
//! The [`HybridClock`] issues [`HlcTimestamp`]s that combine wall time with a
//! logical counter. Readings are strictly increasing per node and totally
//! ordered across nodes.
//!
//! ### Version vectors
//!
//! Each [`Entity`] carries a [`VersionVector`] summarising which writes it
//! reflects. Comparing two vectors yields a [`CausalOrder`].
//!
//! ### Fields
//!
//! Scalar fields are [`LwwRegister`]s, collection fields are [`OrSet`]s.
//! Deletion is a tombstone that wins once observed.
//!
//! ### Operations and merge
//!
//! Every local write is one [`Operation`] appended to the [`OperationLog`].
//! Local and remote operations alike enter state through the [`Merger`].
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{EntitySchema, FieldDef, FieldType, Replica, Schema, VersionVector};
//! use serde_json::json;
//!
//! let schema = Schema::new(1).with_entity_type(EntitySchema::new(
//!     "employee",
//!     vec![
//!         FieldDef::required("firstName", FieldType::String),
//!         FieldDef::optional("jobTitle", FieldType::String),
//!     ],
//! ));
//!
//! let mut laptop = Replica::new(schema.clone(), "laptop");
//! let mut phone = Replica::new(schema, "phone");
//!
//! let ada = laptop
//!     .create_entity("employee", &json!({"firstName": "Ada"}))
//!     .unwrap();
//!
//! // Ship the delta the phone is missing and merge it there.
//! let requests = phone.plan_requests(&laptop.version_summary());
//! let outcome = phone.merge_batch(laptop.delta_for(&requests));
//! assert_eq!(outcome.applied_count(), 1);
//!
//! phone.update_field(&ada.id, "jobTitle", json!("CTO")).unwrap();
//! assert_eq!(
//!     phone.get_entity(&ada.id).unwrap().value("jobTitle"),
//!     Some(&json!("CTO"))
//! );
//! assert!(phone.version_of(&ada.id).dominates(&VersionVector::new()));
//! ```
//!
//! ## Persistence
//!
//! Use [`Replica::export_state`] and [`Replica::import_state`] with
//! [`ReplicaSnapshot`]. Snapshots serialize to JSON with deterministic ordering.
//! Local writes can also be split into [`Replica::stage_update`] and
//! [`Replica::commit`] so the caller can make the operation durable first.

pub mod clock;
pub mod entity;
pub mod error;
pub mod field;
pub mod merge;
pub mod operation;
pub mod oplog;
pub mod replica;
pub mod schema;
pub mod snapshot;
pub mod version;

// Re-export main types at crate root
pub use clock::{HlcTimestamp, HybridClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use entity::Entity;
pub use error::Error;
pub use field::{FieldState, LwwRegister, OrSet};
pub use merge::{merge_entity, BatchOutcome, MergeSummary, Merger, RejectReason, RejectedOp};
pub use operation::{Mutation, Operation, OperationId};
pub use oplog::OperationLog;
pub use replica::{LocalWrite, QueryBuilder, Replica, VectorSummary};
pub use schema::{EntitySchema, FieldDef, FieldType, InitialFields, Schema};
pub use snapshot::{ReplicaSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use version::{CausalOrder, VersionVector};

/// Type aliases for clarity
pub type EntityId = String;
pub type EntityType = String;
pub type NodeId = String;
pub type FieldName = String;
pub type SchemaVersion = u32;
