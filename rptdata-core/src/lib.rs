//! Data provider core for recorded test events and messages
//!
//! Three pieces do the work here:
//! - [`cache::EventTreeCache`] rebuilds events from storage records, batched or
//!   not, and caches each node under its root-to-node path.
//! - [`codec::DecodeCorrelator`] multiplexes decode requests over the codec's
//!   publish/subscribe channel and matches responses back by message id.
//! - [`search`] fans storage reads and decodes out concurrently and emits the
//!   filtered, ordered results either all at once or as a cancellable stream.
//!
//! Everything is reached through a [`ProviderContext`] built once at startup.

// Safety-focused Clippy lints to prevent unsafe error handling regression
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]

pub mod cache;
pub mod codec;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod search;

pub use context::{CacheSizes, ProviderContext, SearchSettings};
pub use error::{ProviderError, Result};
pub use event::{Event, EventPath, EventTreeNode};
pub use message::Message;
