//! Shared caches, created once at startup and read by every request

pub mod bounded;
pub mod event_tree;
pub mod message;

pub use bounded::{BoundedCache, CacheStats};
pub use event_tree::EventTreeCache;
pub use message::MessageCache;
