//! Logical sessions against the engine host.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use log::debug;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::channel::{MessageChannel, ResponseStream};
use crate::config::QueryConfig;
use crate::decode;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Payload;

/// Connection lifecycle states.
///
/// `Open` and `Querying` cycle; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Querying,
    Closed,
}

/// A logical session on the engine host.
///
/// Queries on one connection are serialized in submission order: a second
/// `query` call awaits the completion of the previous query's result stream
/// before it is sent to the host. This is a contract of the connection, not
/// an artifact of the transport; different connections interleave freely.
///
/// Closing is idempotent; a closed connection rejects every further
/// operation with a state error.
pub struct Connection {
    channel: Arc<MessageChannel>,
    session: u32,
    config: QueryConfig,
    state: Arc<Mutex<ConnectionState>>,
    /// Fair FIFO gate serializing queries per connection.
    query_gate: Arc<AsyncMutex<()>>,
    /// Correlation id of the in-flight query, if any.
    active_query: Arc<Mutex<Option<u64>>>,
    /// Database-wide count of in-flight queries (guards file drops).
    inflight: Arc<AtomicUsize>,
}

impl Connection {
    pub(crate) fn new(
        channel: Arc<MessageChannel>,
        session: u32,
        config: QueryConfig,
        inflight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            channel,
            session,
            config,
            state: Arc::new(Mutex::new(ConnectionState::Open)),
            query_gate: Arc::new(AsyncMutex::new(())),
            active_query: Arc::new(Mutex::new(None)),
            inflight,
        }
    }

    /// Session identifier on the engine host.
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Execute a SQL statement.
    ///
    /// Returns a [`QueryResult`] exposing the decoded batches both lazily
    /// (`next_batch`) and eagerly (`collect`). The query is in flight until
    /// the result stream finishes; see the type-level note on
    /// serialization.
    pub async fn query(&self, sql: impl Into<String>) -> BridgeResult<QueryResult> {
        self.query_inner(sql.into(), None).await
    }

    /// Execute a SQL statement with bound parameters.
    pub async fn query_with_params(
        &self,
        sql: impl Into<String>,
        params: Vec<serde_json::Value>,
    ) -> BridgeResult<QueryResult> {
        self.query_inner(sql.into(), Some(params)).await
    }

    async fn query_inner(
        &self,
        sql: String,
        params: Option<Vec<serde_json::Value>>,
    ) -> BridgeResult<QueryResult> {
        if self.is_closed() {
            return Err(BridgeError::state("connection is closed"));
        }

        let guard = self.query_gate.clone().lock_owned().await;
        // The connection may have been closed while queued behind the
        // previous query.
        if self.is_closed() {
            return Err(BridgeError::state("connection is closed"));
        }

        let stream = self
            .channel
            .open_stream(Payload::QueryRequest {
                session: self.session,
                sql,
                params,
            })
            .await?;

        *self.state.lock().expect("state lock poisoned") = ConnectionState::Querying;
        *self.active_query.lock().expect("active query lock poisoned") = Some(stream.id());
        self.inflight.fetch_add(1, Ordering::SeqCst);
        debug!("session {}: query {} in flight", self.session, stream.id());

        let ticket = QueryTicket {
            id: stream.id(),
            state: Arc::clone(&self.state),
            active_query: Arc::clone(&self.active_query),
            inflight: Arc::clone(&self.inflight),
            guard: Some(guard),
            released: false,
        };

        Ok(QueryResult {
            stream: Some(stream),
            cache: Vec::new(),
            config: self.config,
            channel: Arc::clone(&self.channel),
            ticket,
            failed: None,
        })
    }

    /// Cancel the in-flight query, if any.
    ///
    /// Best-effort and cooperative: the pending [`QueryResult`] resolves
    /// with a cancellation error and the connection returns to `Open` once
    /// the result observes it. A connection with nothing in flight is a
    /// no-op success.
    pub async fn cancel_pending(&self) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::state("connection is closed"));
        }
        let active = *self.active_query.lock().expect("active query lock poisoned");
        match active {
            Some(id) => self.channel.cancel(id).await,
            None => Ok(()),
        }
    }

    /// Close the connection, cancelling any in-flight query and releasing
    /// the session on the engine host.
    ///
    /// Idempotent: closing an already-closed connection is a no-op success.
    pub async fn close(&self) -> BridgeResult<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }

        let active = *self.active_query.lock().expect("active query lock poisoned");
        if let Some(id) = active {
            // The pending result resolves with a cancellation error rather
            // than staying unresolved.
            let _ = self.channel.cancel(id).await;
        }

        debug!("session {}: closing", self.session);
        match self
            .channel
            .request(Payload::DisconnectRequest {
                session: self.session,
            })
            .await
        {
            Ok(Payload::DisconnectResponse) => Ok(()),
            Ok(other) => Err(BridgeError::protocol(format!(
                "expected disconnect-response, got {}",
                other.kind()
            ))),
            // The host is gone; the session died with it.
            Err(BridgeError::ChannelClosed) | Err(BridgeError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Bookkeeping released exactly once when a query leaves the in-flight
/// window (stream finished, failed, or the result was dropped).
struct QueryTicket {
    id: u64,
    state: Arc<Mutex<ConnectionState>>,
    active_query: Arc<Mutex<Option<u64>>>,
    inflight: Arc<AtomicUsize>,
    guard: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl QueryTicket {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        {
            let mut active = self.active_query.lock().expect("active query lock poisoned");
            if *active == Some(self.id) {
                *active = None;
            }
        }
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Querying {
                *state = ConnectionState::Open;
            }
        }
        self.guard = None;
    }
}

impl Drop for QueryTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// The result of one query: a finite, non-restartable sequence of decoded
/// record batches.
///
/// Batches can be consumed lazily with [`next_batch`](Self::next_batch) or
/// materialized with [`collect`](Self::collect). Every delivered batch is
/// cached for the lifetime of the result, so collecting twice never
/// re-executes the query or re-fetches from the host.
pub struct QueryResult {
    stream: Option<ResponseStream>,
    cache: Vec<RecordBatch>,
    config: QueryConfig,
    channel: Arc<MessageChannel>,
    ticket: QueryTicket,
    /// Terminal error, resurfaced on every poll after the failure.
    failed: Option<BridgeError>,
}

impl QueryResult {
    /// Correlation id of the underlying request.
    pub fn id(&self) -> u64 {
        self.ticket.id
    }

    /// Await and decode the next batch; `Ok(None)` once the stream ends.
    ///
    /// A result that already failed keeps failing: every later call
    /// resurfaces the terminal error instead of presenting the partial
    /// cache as a completed stream.
    pub async fn next_batch(&mut self) -> BridgeResult<Option<RecordBatch>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next_chunk().await {
            Ok(Some(buffer)) => match decode::decode_batch(&buffer, &self.config) {
                Ok(batch) => {
                    self.cache.push(batch.clone());
                    Ok(Some(batch))
                }
                Err(err) => {
                    // A batch we cannot decode leaves the stream unusable;
                    // tell the host to stop producing.
                    self.channel.cancel_detached(self.ticket.id);
                    self.fail(err)
                }
            },
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(err) => self.fail(err),
        }
    }

    /// Drain the stream and return all batches, cached ones included.
    pub async fn collect(&mut self) -> BridgeResult<Vec<RecordBatch>> {
        while self.next_batch().await?.is_some() {}
        Ok(self.cache.clone())
    }

    /// Batches delivered so far.
    pub fn batches(&self) -> &[RecordBatch] {
        &self.cache
    }

    /// Total rows across the batches delivered so far.
    pub fn num_rows(&self) -> usize {
        self.cache.iter().map(|b| b.num_rows()).sum()
    }

    /// Whether the stream has delivered its terminal event.
    pub fn is_finished(&self) -> bool {
        self.stream.is_none()
    }

    fn finish(&mut self) {
        self.stream = None;
        self.ticket.release();
    }

    fn fail(&mut self, err: BridgeError) -> BridgeResult<Option<RecordBatch>> {
        self.finish();
        self.failed = Some(err.clone());
        Err(err)
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("id", &self.ticket.id)
            .field("cached_batches", &self.cache.len())
            .field("finished", &self.is_finished())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if let Some(stream) = &self.stream {
            if !stream.is_finished() {
                // Unconsumed stream: stop the host without blocking drop.
                self.channel.cancel_detached(self.ticket.id);
            }
        }
    }
}
