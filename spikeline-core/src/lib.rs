//! # Spikeline Core
//!
//! Relational pipeline engine for incremental scientific workflows:
//! - Entity registry and dependency graph over SQLite
//! - Content-hash deduplicated parameter sets
//! - Idempotent, dependency-ordered populate scheduling
//! - Job reservations for concurrent workers
//!
//! Workflows declare their entities in a [`registry::Registry`], open a
//! [`store::Store`] against it, and hand make callbacks to a
//! [`populate::Scheduler`]. Everything upstream of a computed row is
//! reachable through its primary key, so computations stay reproducible
//! and re-runnable.

pub mod error;
pub mod hash;
pub mod jobs;
pub mod key;
pub mod params;
pub mod populate;
pub mod registry;
pub mod store;

pub use error::{Error, Result};
pub use key::{AttrMap, AttrType, AttrValue, EntityKey, Restriction};
pub use populate::{EntityMake, MakeResult, PopulateOptions, PopulateReport, Scheduler};
pub use registry::{EdgeKind, EntityDef, EntityKind, Registry};
pub use store::{OnConflict, Store, StoreConfig};
