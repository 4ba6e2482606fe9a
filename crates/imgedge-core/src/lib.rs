//! Shared types for the imgedge caching subsystem.
//!
//! The cache layer consumes a request, the transformed response and the
//! context produced by storage retrieval and parameter resolution. Those
//! collaborators live elsewhere; this crate only defines the contracts.

pub mod context;
pub mod error;
pub mod options;
pub mod request;
pub mod storage;

use bytes::Bytes;

pub use context::{
    BackgroundTasks, Breadcrumb, ExecutionContext, RequestContext, TaskRunner, TrackedTasks,
};
pub use error::{CacheError, Result};
pub use options::TransformOptions;
pub use request::{header_str, query_param, request_url};
pub use storage::{SourceType, StorageResult};

/// Incoming image request. Only URI, headers and extensions are consulted.
pub type ImageRequest = http::Request<()>;

/// Image response with a fully buffered body.
pub type ImageResponse = http::Response<Bytes>;
