//! # offsync engine
//!
//! The synchronization engine of the offsync data-access core.
//!
//! This crate provides:
//! - A `Client` context owning the transport, caches and sync queue
//! - `DataStore` / `TypedStore` operations dispatched by read and write policy
//! - Chunked, auto-paginated and delta-set fetches with full-sync reconciliation
//! - A push pipeline serialized per collection
//! - Composite requests whose cancellation is sticky
//!
//! ## Architecture
//!
//! Every operation runs as a tokio task and reports through an
//! `OperationHandle`. Local-then-network operations deliver the cache's
//! answer first and the network's answer second; every other policy
//! delivers one result.
//!
//! Each network call runs as its own task registered on the operation's
//! `CompositeRequest`, so cancelling the operation aborts every call it has
//! in flight as well as every call it starts afterwards.
//!
//! ## Key Invariants
//!
//! - Writes made offline are queued and coalesced per entity
//! - Pushes of one collection never overlap
//! - A full sync removes cached records the server no longer has, and only
//!   after every window or chunk has completed
//! - Temporary ids never reach the server as entity ids

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod factory;
mod fetch;
mod network;
mod operation;
mod push;
mod reconcile;
mod request;
mod response;
mod store;
mod transport;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, StoreOptions, DEFAULT_MAX_IDS_PER_QUERY, DEFAULT_PAGE_SIZE};
pub use factory::RequestFactory;
pub use operation::OperationHandle;
pub use push::PushResult;
pub use reconcile::{index_records, DeltaSet, IdLmtIndex};
pub use request::{CompositeRequest, Request, TaskRequest};
pub use response::{classify_error, count_of, parse_count, parse_json, parse_records};
pub use store::{DataStore, SyncResult, TypedStore};
pub use transport::{HttpResponse, MockTransport, Transport};

pub use offsync_core::{
    AuthFailure, Cache, CacheManager, DataStoreError, DataStoreResult, Entity, FieldMapping,
    FileSyncQueue, Filter, HttpMethod, MemoryCache, MemoryCacheManager, MemorySyncQueue,
    PendingMethod, PendingOperation, Persistable, Query, ReadPolicy, RequestSpec, SyncQueue,
    Transform, WritePolicy,
};
