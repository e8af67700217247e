//! The engine boundary.
//!
//! The bridge drives an external asynchronous engine through these traits.
//! Every engine operation reports back through a boxed handler that runs on
//! one of the I/O worker threads. Handlers are `FnMut`: an engine may call
//! one more than once, and the bridge makes sure only the first call counts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::connstr::ConnectionString;
use crate::error::Error;
use crate::options::{ClusterOptions, Credential, QueryOptions, duration_ms};

/// Error reported by the engine: its native code plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Convert into a bridge error tagged with the failing operation.
    pub fn into_error(self, operation: &'static str) -> Error {
        Error::engine(operation, self.code, self.message)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for EngineError {}

/// Everything the engine needs to bootstrap a cluster connection.
#[derive(Debug, Clone)]
pub struct Origin {
    pub connection_string: ConnectionString,
    pub credential: Credential,
    pub options: ClusterOptions,
    pub user_agent: String,
}

/// One step of a result stream as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowVariant {
    Row(Vec<u8>),
    End,
    /// Neither a row nor end-of-stream. No result can be built from it.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetrics {
    #[serde(with = "duration_ms")]
    pub elapsed_time: Duration,
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub processed_objects: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: i32,
    pub message: String,
}

/// Out-of-band information about a finished query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub request_id: String,
    pub warnings: Vec<Warning>,
    pub metrics: QueryMetrics,
}

pub type OpenHandler = Box<dyn FnMut(Result<(), EngineError>) + Send>;
pub type CloseHandler = Box<dyn FnMut() + Send>;
pub type QueryHandler = Box<dyn FnMut(Result<Arc<dyn QueryStream>, EngineError>) + Send>;
pub type RowHandler = Box<dyn FnMut(Result<RowVariant, EngineError>) + Send>;

/// Factory for cluster objects.
pub trait Engine: Send + Sync + 'static {
    /// Create a cluster object that runs its I/O on `io`.
    fn create_cluster(&self, io: Handle) -> Arc<dyn Cluster>;
}

pub trait Cluster: Send + Sync + 'static {
    fn open_in_background(&self, origin: Origin, handler: OpenHandler);

    fn close(&self, handler: CloseHandler);

    /// Submit a query. A synchronous `Err` means the engine rejected it
    /// outright and `handler` will never run.
    fn execute_query(
        &self,
        options: QueryOptions,
        handler: QueryHandler,
    ) -> Result<Box<dyn PendingOperation>, EngineError>;
}

/// A submitted query whose response has not arrived yet.
pub trait PendingOperation: Send + Sync {
    fn cancel(&self);
}

/// A live result stream.
pub trait QueryStream: Send + Sync + 'static {
    /// Request the next row. At most one request is outstanding.
    fn next_row(&self, handler: RowHandler);

    fn cancel(&self);

    /// Present once the stream has ended.
    fn metadata(&self) -> Option<QueryMetadata>;
}
