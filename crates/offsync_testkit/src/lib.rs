//! # offsync testkit
//!
//! Test utilities for offsync.
//!
//! This crate provides:
//! - An in-memory backend implementing the engine's `Transport`, with
//!   scripted failures and per-request latency
//! - Record fixtures and client helpers
//! - Property-based test generators using proptest
//! - A tracing initializer for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use offsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn finds_seeded_records() {
//!     let (backend, client) = memory_client();
//!     backend.seed("books", numbered_records("b", 3));
//!     let found = client.collection("books").find(Query::new()).last().await.unwrap();
//!     assert_eq!(found.len(), 3);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;
pub mod tracing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::tracing::init_tracing;
}

pub use backend::{MemoryBackend, RequestMatcher};
pub use fixtures::*;
pub use generators::*;
pub use tracing::init_tracing;
