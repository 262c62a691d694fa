//! # Vantage — Columnar Analytics with Vector Search
//!
//! Vantage is an embedded column-oriented analytical database engine
//! specialized for hybrid relational + vector-similarity (k-nearest-neighbour)
//! queries over high-dimensional feature vectors.
//!
//! ## Key Features
//!
//! - **Typed columnar storage**: schemas → entities → columns over an ordered
//!   key-value substrate with MVCC snapshots
//! - **Secondary indexes**: unique/non-unique hash, VA-file, product
//!   quantization, grouping and super-bit LSH for approximate k-NN
//! - **ACID transactions**: multi-object transactions with hierarchical
//!   locking and deadlock detection
//! - **Cost-based planning**: two-phase (logical → physical) rewrite engine
//!   with plan caching
//!
//! ## Quick Start
//!
//! ```rust
//! use vantage_core::Catalog;
//! use vantage_core::catalog::{ColumnDef, Name};
//! use vantage_core::transaction::TransactionType;
//! use vantage_core::values::{Type, Value};
//!
//! # fn main() -> vantage_core::DbResult<()> {
//! let catalog = Catalog::in_memory()?;
//!
//! let tx = catalog.begin(TransactionType::Implicit)?;
//! tx.catalog().create_schema(&Name::schema("lab"))?;
//! tx.catalog().create_entity(
//!     &Name::entity("lab", "samples"),
//!     &[
//!         ColumnDef::new(Name::column("lab", "samples", "id"), Type::Long, false, true),
//!         ColumnDef::new(Name::column("lab", "samples", "feature"), Type::FloatVec(4), false, false),
//!     ],
//! )?;
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! logical plan ──► Planner (rewrite + cost select, plan cache)
//!              ──► physical plan ──► Operator tree (lazy pull)
//!              ──► TransactionManager (locks, per-DBO sub-transactions)
//!              ──► Catalog (schemas / entities / columns / indexes)
//!              ──► ordered key-value substrate (snapshots, exclusive writers)
//! ```
//!
//! ## Module Structure
//! - [`catalog`] — metadata stores, DDL, entities, columns, sequences
//! - [`values`] — types, values, codecs, distances, statistics
//! - [`index`] — the index contract and its implementations
//! - [`planner`] — logical/physical nodes, rewrite rules, cost, cache
//! - [`execution`] — Volcano-style pull operators
//! - [`transaction`] — transaction manager, locks, deadlock detection
//! - [`storage`] — the key-value substrate wrapper

pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod index;
pub mod planner;
pub mod query;
pub mod storage;
pub mod transaction;
pub mod values;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use catalog::Catalog;
pub use error::{DbError, DbResult};
