//! # columnar-bridge
//!
//! > **Block or call back. Exactly once.**
//!
//! A blocking and callback-driven surface over an asynchronous query
//! engine. Completions arrive on I/O worker threads the caller does not
//! control; the bridge hands each one to exactly one waiter or callback,
//! re-entering the host's execution lock where needed.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use columnar_bridge::prelude::*;
//! use std::sync::Arc;
//!
//! let engine = MemoryEngine::new()
//!     .dataset("SELECT v", Dataset::new().rows(["row0", "row1", "row2"]));
//!
//! let conn = Connector::new(Arc::new(engine))
//!     .io_threads(2)
//!     .open("couchbases://localhost")?;
//!
//! let mut cursor = conn.query(QueryOptions::new("SELECT v"))?;
//! while let Pull::Row(row) = cursor.next_row()? {
//!     println!("{}", String::from_utf8_lossy(&row));
//! }
//! println!("{:?}", cursor.metadata());
//! conn.close()?;
//! ```
//!
//! ## Layout
//!
//! | Module         | Role                                              |
//! |----------------|---------------------------------------------------|
//! | `completion`   | One-shot cells, single-fire guard, delivery modes |
//! | `connection`   | Open / close lifecycle, query submission          |
//! | `cursor`       | Pull-based, cancellable row stream                |
//! | `engine`       | Traits the external engine implements             |
//! | `host`         | Host execution lock for callbacks                 |
//! | `runtime`      | I/O worker runtime                                |
//! | `memory`       | Scripted in-process engine                        |

pub mod completion;
pub mod config;
pub mod connection;
pub mod connstr;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod host;
pub mod memory;
pub mod options;
pub mod runtime;

pub mod prelude {
    pub use crate::connection::{Connection, ConnectionInfo, Connector, PendingQuery};
    pub use crate::cursor::{CancelHandle, Cursor, Pull, RowCallback, RowEvent};
    pub use crate::engine::{Engine, EngineError, QueryMetadata, QueryMetrics, Warning};
    pub use crate::error::*;
    pub use crate::host::{FreeThreaded, GlobalLock, Host};
    pub use crate::memory::{Dataset, Faults, MemoryEngine};
    pub use crate::options::{
        ClusterOptions, Credential, QueryOptions, ScanConsistency, SecurityOptions, TimeoutOptions,
    };
    pub use crate::runtime::ThreadGauge;
}

/// Parse a connection string.
///
/// # Example
///
/// ```
/// use columnar_bridge::parse_connection_string;
///
/// let cs = parse_connection_string("couchbases://a.example.com,b.example.com:18095").unwrap();
/// assert_eq!(cs.hosts.len(), 2);
/// ```
pub fn parse_connection_string(input: &str) -> error::Result<connstr::ConnectionString> {
    connstr::parse(input)
}
