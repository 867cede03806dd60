//! # offsync core
//!
//! Data model and collaborator contracts for the offsync data-access core.
//!
//! This crate provides:
//! - `Entity` records with server metadata and temporary ids
//! - `Query` / `Filter` evaluation and wire encoding
//! - Read and write policies
//! - The `Cache` and `SyncQueue` contracts with in-memory and file-backed
//!   implementations
//! - Static field-mapping tables for typed records
//! - The shared error taxonomy
//!
//! No network I/O happens here; see `offsync_engine` for the
//! synchronization engine built on these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod entity;
mod error;
mod file_queue;
mod mapping;
mod policy;
mod query;
mod request;
mod sync_queue;

pub use cache::{Cache, CacheManager, MemoryCache, MemoryCacheManager};
pub use entity::{
    compare_timestamps, is_temporary_id, lookup_path, new_temporary_id, Acl, Entity, Metadata,
    ACL_KEY, ECT_PATH, ID_KEY, LMT_PATH, METADATA_KEY, TEMP_ID_PREFIX,
};
pub use error::{AuthFailure, DataStoreError, DataStoreResult};
pub use file_queue::FileSyncQueue;
pub use mapping::{FieldMapping, Persistable, Transform};
pub use policy::{ReadPolicy, WritePolicy};
pub use query::{project, Filter, Query, Sort, SortDirection};
pub use request::{HttpMethod, RequestSpec};
pub use sync_queue::{coalesce, MemorySyncQueue, PendingMethod, PendingOperation, SyncQueue};
