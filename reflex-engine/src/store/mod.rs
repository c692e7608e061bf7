//! Heuristic persistence
//!
//! [`ConditionStore`] owns validation, versioning and per-rule write
//! serialization on top of a pluggable [`HeuristicBackend`]:
//! [`MemoryBackend`] for embedded use and tests, [`CozoBackend`] for durable
//! storage with HNSW similarity search.

mod condition;
mod cozo;
mod memory;
mod schema;
mod traits;

pub(crate) use condition::to_candidate;

pub use condition::ConditionStore;
pub use cozo::CozoBackend;
pub use memory::MemoryBackend;
pub use schema::{CURRENT_SCHEMA_VERSION, MIGRATIONS, Migration};
pub use traits::{ChangeType, HeuristicBackend, Invalidation, InvalidationSink};
