//! zoekt-state — embedded state store for the Zoekt control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for search nodes, enabled namespaces, replicas, indices,
//! repositories and the task queue.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by monotonically allocated `u64` ids. Relationship lookups scan the
//! child table; the fleet is small enough that this stays cheap.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every mutation runs in its own write
//! transaction, so a failing record never rolls back its neighbours.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
