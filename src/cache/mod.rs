//! Versioned response buckets.
//!
//! A bucket is a named key→response store. The agent writes to exactly one
//! bucket at a time (named after its version) and destroys the others when
//! it activates.

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, RequestKey};
#[cfg(test)]
pub use traits::CachedEntry;
