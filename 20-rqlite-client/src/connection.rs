//! The connection handle callers hold.
//!
//! A [`Connection`] owns the configuration, the shared transport and the
//! current [`ClusterTopology`]. Data operations encode statements, walk the
//! peer list through the request executor and decode whatever the first
//! healthy peer returns.
//!
//! The topology sits behind `RwLock<Arc<_>>`: a refresh builds a complete new
//! topology and swaps the pointer, so a request in flight keeps the snapshot it
//! started with and never sees half of a refresh.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectOptions, ConsistencyLevel};
use crate::error::{Error, Result};
use crate::executor::{ApiCall, ApiOperation, RequestExecutor, UrlAssembler};
use crate::result::{self, OperationKind, QueryResult, RequestResult, WriteResult};
use crate::statement::{self, Statement};
use crate::topology::{ClusterTopology, Discovered, Peer, PeerOrdering, parse_nodes, parse_status};
use crate::trace::{NoopSink, TraceSink, Tracer};

/// Length of generated connection ids.
const ID_LEN: usize = 12;

/// Configures and opens a [`Connection`].
///
/// ```no_run
/// # async fn demo() -> rqlite_client::Result<()> {
/// use std::sync::Arc;
/// use rqlite_client::{ConnectionBuilder, PeerOrdering, TracingSink};
///
/// let conn = ConnectionBuilder::new("http://localhost:4001?level=strong")
///     .peer_ordering(PeerOrdering::SeedFirst)
///     .trace_sink(Arc::new(TracingSink))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    url: String,
    client: Option<Client>,
    sink: Arc<dyn TraceSink>,
    ordering: PeerOrdering,
    transactions: bool,
    queued_writes: bool,
}

impl ConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: None,
            sink: Arc::new(NoopSink),
            ordering: PeerOrdering::default(),
            transactions: true,
            queued_writes: false,
        }
    }

    /// Uses `client` for every request instead of building one.
    pub fn http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn peer_ordering(mut self, ordering: PeerOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Wrap each batch in a transaction. On by default.
    pub fn transactions(mut self, enabled: bool) -> Self {
        self.transactions = enabled;
        self
    }

    /// Send writes through the store's queue. Off by default.
    pub fn queued_writes(mut self, enabled: bool) -> Self {
        self.queued_writes = enabled;
        self
    }

    pub async fn open(self) -> Result<Connection> {
        self.open_with_cancel(&CancellationToken::new()).await
    }

    /// Parses the URL and, unless discovery is disabled, learns the cluster
    /// topology before returning.
    pub async fn open_with_cancel(self, cancel: &CancellationToken) -> Result<Connection> {
        let options: ConnectOptions = self.url.parse()?;
        let executor = match self.client {
            Some(client) => RequestExecutor::with_client(client, options.timeout),
            None => RequestExecutor::new(options.timeout)?,
        };

        let id = nanoid::nanoid!(ID_LEN);
        let tracer = Tracer::new(&id, self.sink);
        let urls = UrlAssembler {
            tls: options.tls,
            credentials: options.credentials.clone(),
            level: options.level,
            transaction: self.transactions,
            queue: self.queued_writes,
        };
        let topology = ClusterTopology::seeded(
            options.seed.clone(),
            options.extra_peers.clone(),
            self.ordering,
        );

        tracer.emit(|| {
            format!(
                "opening: seed={} extra={:?} level={} timeout={:?} discovery={} tls={}",
                options.seed,
                options.extra_peers,
                options.level,
                options.timeout,
                options.discovery,
                options.tls
            )
        });
        debug!(connection = %id, seed = %options.seed, "opening connection");

        let conn = Connection {
            id,
            urls: RwLock::new(urls),
            topology: RwLock::new(Arc::new(topology)),
            executor,
            tracer,
            discovery: options.discovery,
            ordering: self.ordering,
            closed: AtomicBool::new(false),
        };

        if conn.discovery {
            conn.refresh(cancel).await?;
        }
        Ok(conn)
    }
}

/// A cluster-aware handle to the store.
///
/// Cheap operations (`leader`, `peers`, setters) and data operations share one
/// pooled transport and may run concurrently from several tasks. Once
/// [`close`](Self::close) is called every operation fails with
/// [`Error::Closed`] without touching the network.
pub struct Connection {
    id: String,
    urls: RwLock<UrlAssembler>,
    topology: RwLock<Arc<ClusterTopology>>,
    executor: RequestExecutor,
    tracer: Tracer,
    discovery: bool,
    ordering: PeerOrdering,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("topology", &self.topology.read())
            .field("discovery", &self.discovery)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a connection with default builder settings.
    pub async fn open(url: &str) -> Result<Self> {
        ConnectionBuilder::new(url).open().await
    }

    pub fn builder(url: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url)
    }

    /// Random identifier that tags this connection's trace output.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Marks the connection closed. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.id, "connection closed");
            self.tracer.emit(|| "closed".to_string());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Current topology snapshot, without I/O.
    pub fn topology(&self) -> Result<Arc<ClusterTopology>> {
        self.ensure_open()?;
        Ok(self.topology.read().clone())
    }

    pub fn consistency_level(&self) -> Result<ConsistencyLevel> {
        self.ensure_open()?;
        Ok(self.urls.read().level)
    }

    pub fn set_consistency_level(&self, level: ConsistencyLevel) -> Result<()> {
        self.ensure_open()?;
        self.urls.write().level = level;
        self.tracer.emit(|| format!("consistency level set to {level}"));
        Ok(())
    }

    pub fn set_execution_with_transaction(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.urls.write().transaction = enabled;
        Ok(())
    }

    pub fn set_queued_writes(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.urls.write().queue = enabled;
        Ok(())
    }

    /// The current leader. Refreshes the topology first unless discovery is
    /// disabled.
    pub async fn leader(&self) -> Result<Option<Peer>> {
        self.leader_with_cancel(&CancellationToken::new()).await
    }

    pub async fn leader_with_cancel(&self, cancel: &CancellationToken) -> Result<Option<Peer>> {
        let topology = self.current_topology(cancel).await?;
        Ok(topology.leader().cloned())
    }

    /// Every known peer in request order. Refreshes the topology first unless
    /// discovery is disabled.
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        self.peers_with_cancel(&CancellationToken::new()).await
    }

    pub async fn peers_with_cancel(&self, cancel: &CancellationToken) -> Result<Vec<Peer>> {
        let topology = self.current_topology(cancel).await?;
        Ok(topology.peer_list().to_vec())
    }

    async fn current_topology(&self, cancel: &CancellationToken) -> Result<Arc<ClusterTopology>> {
        self.ensure_open()?;
        if self.discovery {
            self.refresh(cancel).await
        } else {
            Ok(self.topology.read().clone())
        }
    }

    /// Re-learns the topology now. On failure the previous topology is kept.
    pub async fn refresh_topology_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ClusterTopology>> {
        self.ensure_open()?;
        self.refresh(cancel).await
    }

    async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<ClusterTopology>> {
        let current = self.topology.read().clone();
        let peers = current.peer_list().to_vec();
        let urls = self.urls.read().clone();

        let discovered = match self.discover_via_status(&urls, &peers, cancel).await? {
            Some(mut discovered) => {
                if discovered.others.is_empty() {
                    discovered.others = carried_over(&current, discovered.leader.as_ref());
                }
                discovered
            }
            None => self.discover_via_nodes(&urls, &peers, cancel).await?,
        };

        if discovered.leader.is_none() && discovered.others.is_empty() {
            return Err(Error::Discovery("no reachable nodes reported".into()));
        }

        let next = Arc::new(ClusterTopology::new(
            discovered.leader,
            discovered.others,
            current.seed().cloned(),
            self.ordering,
        ));
        if next.peer_list() != current.peer_list() || next.leader() != current.leader() {
            info!(
                connection = %self.id,
                leader = ?next.leader().map(ToString::to_string),
                peers = next.peer_list().len(),
                "cluster topology changed"
            );
        }
        self.tracer.emit(|| {
            format!(
                "topology: leader={:?} others={:?} order={:?}",
                next.leader().map(ToString::to_string),
                next.others().iter().map(ToString::to_string).collect::<Vec<_>>(),
                next.peer_list().iter().map(ToString::to_string).collect::<Vec<_>>()
            )
        });

        *self.topology.write() = next.clone();
        Ok(next)
    }

    /// `Ok(None)` means "ask `/nodes` instead".
    async fn discover_via_status(
        &self,
        urls: &UrlAssembler,
        peers: &[Peer],
        cancel: &CancellationToken,
    ) -> Result<Option<Discovered>> {
        let call = ApiCall {
            op: ApiOperation::Status,
            body: None,
            urls,
        };
        let body = match self.executor.execute(&call, peers, cancel, &self.tracer).await {
            Ok(body) => body,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(connection = %self.id, error = %err, "status endpoint failed, trying nodes");
                return Ok(None);
            }
        };
        match parse_status(&body) {
            Ok(Some(discovered)) => Ok(Some(discovered)),
            Ok(None) => {
                self.tracer.emit(|| "status did not name a leader, trying nodes".to_string());
                Ok(None)
            }
            Err(err) => {
                warn!(connection = %self.id, error = %err, "unusable status payload, trying nodes");
                Ok(None)
            }
        }
    }

    async fn discover_via_nodes(
        &self,
        urls: &UrlAssembler,
        peers: &[Peer],
        cancel: &CancellationToken,
    ) -> Result<Discovered> {
        let call = ApiCall {
            op: ApiOperation::Nodes,
            body: None,
            urls,
        };
        let body = match self.executor.execute(&call, peers, cancel, &self.tracer).await {
            Ok(body) => body,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                return Err(Error::Discovery(format!(
                    "could not determine leader from nodes endpoint: {err}"
                )));
            }
        };
        parse_nodes(&body)
    }

    async fn send(
        &self,
        op: ApiOperation,
        statements: Vec<Statement>,
        force_queue: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        for stmt in &statements {
            if let Some(warning) = stmt.warning() {
                debug!(connection = %self.id, sql = stmt.sql(), %warning, "statement warning");
            }
        }
        let body = statement::encode(&statements)?;
        let mut urls = self.urls.read().clone();
        if force_queue {
            urls.queue = true;
        }
        let peers = self.topology.read().peer_list().to_vec();
        self.tracer
            .emit(|| format!("{op:?}: {} statement(s)", statements.len()));

        let call = ApiCall {
            op,
            body: Some(&body),
            urls: &urls,
        };
        self.executor.execute(&call, &peers, cancel, &self.tracer).await
    }

    /// Runs a batch of write statements. A failed statement carries its error
    /// in its own [`WriteResult`] and does not hide the others.
    ///
    /// With queued writes enabled the store only acknowledges the batch, so
    /// the call returns a single result carrying its sequence number.
    pub async fn write<I, S>(&self, statements: I) -> Result<Vec<WriteResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        self.write_with_cancel(statements, &CancellationToken::new())
            .await
    }

    pub async fn write_with_cancel<I, S>(
        &self,
        statements: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        let statements = collect(statements);
        let queued = self.urls.read().queue;
        let body = self
            .send(ApiOperation::Execute, statements, false, cancel)
            .await?;
        if queued {
            let sequence = result::decode_sequence_number(&body)?;
            return Ok(vec![WriteResult::queued(sequence)]);
        }
        result::decode_writes(&body)
    }

    /// Runs one write statement; its error surfaces as [`Error::Statement`].
    pub async fn write_one(&self, statement: impl Into<Statement>) -> Result<WriteResult> {
        let results = self.write([statement.into()]).await?;
        only(results, WriteResult::error)
    }

    /// Runs a batch of queries, one [`QueryResult`] per statement.
    pub async fn query<I, S>(&self, statements: I) -> Result<Vec<QueryResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        self.query_with_cancel(statements, &CancellationToken::new())
            .await
    }

    pub async fn query_with_cancel<I, S>(
        &self,
        statements: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        let statements = collect(statements);
        let body = self
            .send(ApiOperation::Query, statements, false, cancel)
            .await?;
        result::decode_queries(&body)
    }

    pub async fn query_one(&self, statement: impl Into<Statement>) -> Result<QueryResult> {
        let results = self.query([statement.into()]).await?;
        only(results, QueryResult::error)
    }

    /// Sends a mixed batch to the unified endpoint; each entry comes back as
    /// a query, a write or an error.
    pub async fn request<I, S>(&self, statements: I) -> Result<Vec<RequestResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        self.request_with_cancel(statements, &CancellationToken::new())
            .await
    }

    pub async fn request_with_cancel<I, S>(
        &self,
        statements: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<RequestResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        let statements = collect(statements);
        let body = self
            .send(ApiOperation::Request, statements, false, cancel)
            .await?;
        result::decode(&body, OperationKind::Request)
    }

    /// Queues a batch of writes and returns the sequence number the store
    /// assigned to it. The store applies queued writes asynchronously.
    pub async fn queue<I, S>(&self, statements: I) -> Result<i64>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        self.queue_with_cancel(statements, &CancellationToken::new())
            .await
    }

    pub async fn queue_with_cancel<I, S>(
        &self,
        statements: I,
        cancel: &CancellationToken,
    ) -> Result<i64>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        let statements = collect(statements);
        let body = self
            .send(ApiOperation::Execute, statements, true, cancel)
            .await?;
        result::decode_sequence_number(&body)
    }

    pub async fn queue_one(&self, statement: impl Into<Statement>) -> Result<i64> {
        self.queue([statement.into()]).await
    }
}

fn collect<I, S>(statements: I) -> Vec<Statement>
where
    I: IntoIterator<Item = S>,
    S: Into<Statement>,
{
    statements.into_iter().map(Into::into).collect()
}

/// Unwraps the single result of a one-statement call.
fn only<T>(results: Vec<T>, error: fn(&T) -> Option<&str>) -> Result<T> {
    let mut results = results.into_iter();
    let first = results
        .next()
        .ok_or_else(|| Error::Store("no result returned for statement".into()))?;
    match error(&first) {
        Some(err) => Err(Error::Statement(err.to_string())),
        None => Ok(first),
    }
}

/// Peers worth keeping when a status payload names only the leader.
fn carried_over(previous: &ClusterTopology, leader: Option<&Peer>) -> Vec<Peer> {
    previous
        .peer_list()
        .iter()
        .filter(|peer| Some(*peer) != leader)
        .cloned()
        .collect()
}
