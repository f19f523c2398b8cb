pub mod actions;
pub mod batch;
pub mod config;
pub mod error;
pub mod http;
pub mod namespace;
pub mod pages;
pub mod query;
pub mod reply;
pub mod session;
pub mod tasks;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod mock;

pub use batch::{BatchQuery, ResultMap};
pub use error::{ApiError, ApiResult, ErrorKind, QueryTemplateError};
pub use namespace::{NamespaceId, NamespaceTable};
pub use query::{ContinuationQuery, QueryTemplate};
pub use reply::Reply;
pub use session::{RetryPolicy, Session, SessionSettings};
pub use tasks::{CancelFlag, FailedTask, RunReport, Task, TaskKind, TaskRunner};
pub use transport::Transport;
pub use upload::{ChunkPlan, ChunkedUpload, UploadError, UploadOutcome, UploadState};
