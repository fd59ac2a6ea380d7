//! Cache/persistence engine for a chunked, two-part-key string store: chunk
//! admission on demand, least-accessed eviction, write-ahead logging,
//! periodic snapshotting, and crash recovery.

pub mod engine;
pub mod error;
pub mod fs;
pub mod logging;
pub mod model;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use model::Key;

/// Default tunables for cache admission and snapshot cadence.
pub const DEFAULT_CACHE_SIZE: usize = 2;
pub const DEFAULT_WRT_OP: u32 = 1;
