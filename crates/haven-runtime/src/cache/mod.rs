//! Response caching for read traffic.

mod engine;
mod store;

pub use engine::{CacheEngine, CacheResponse, CachedBody};
pub use store::{CacheStore, SweepReport};
