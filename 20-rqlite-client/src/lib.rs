//! A cluster-aware client for rqlite, the Raft-replicated SQL store.
//!
//! A [`Connection`] hides the fact that the store is a set of nodes with one
//! elected leader. It discovers the topology, walks peers in order until one
//! answers, follows the 301s the store sends for writes that reach a follower,
//! and decodes the per-statement results into cursors.
//!
//! ```no_run
//! use rqlite_client::{Connection, statement};
//!
//! # async fn demo() -> rqlite_client::Result<()> {
//! let conn = Connection::open("http://localhost:4001?level=strong").await?;
//! conn.write_one(statement!("INSERT INTO foo (id, name) VALUES (?, ?)", 1, "bob"))
//!     .await?;
//!
//! let mut rows = conn.query_one("SELECT id, name FROM foo").await?;
//! let (mut id, mut name) = (0i64, String::new());
//! while rows.next() {
//!     rows.scan(&mut [&mut id, &mut name])?;
//!     println!("{id}: {name}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`topology`]: peers, ordering policies, discovery payload parsing
//! - [`executor`]: peer iteration, redirects, failure aggregation
//! - [`statement`] and [`value`]: SQL text, arguments and their encoding
//! - [`result`]: decoding responses into write results and row cursors
//! - [`connection`]: the handle that ties it together
//! - [`shell`]: command parsing for the `rqlite-shell` binary

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod result;
pub mod shell;
pub mod statement;
pub mod topology;
pub mod trace;
pub mod value;

pub use config::{ConnectOptions, ConsistencyLevel, Credentials};
pub use connection::{Connection, ConnectionBuilder};
pub use error::{Error, FailureKind, PeerFailure, PeerFailures, Result};
pub use executor::{ApiOperation, MAX_REDIRECTS};
pub use result::{OperationKind, QueryResult, RequestResult, ScanTarget, WriteResult};
pub use statement::Statement;
pub use topology::{ClusterTopology, Peer, PeerOrdering};
pub use trace::{NoopSink, TraceSink, TracingSink, WriterSink, redact_url};
pub use value::{FromValue, Value};

pub use tokio_util::sync::CancellationToken;
