// Data view integration: query cache contract and view controller
pub mod cache;
pub mod controller;

pub use cache::{CacheEntry, CacheUpdater, InMemoryQueryCache, KeyPrefix, QueryCache, QueryKey};
pub use controller::{DataViewController, RenderedRow};
