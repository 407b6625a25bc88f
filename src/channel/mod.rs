//! Correlation layer over the engine host transport.
//!
//! Every outbound message is tagged with a unique, monotonically increasing
//! id. A background reader task routes inbound host messages back to the
//! awaiting caller: unary requests (open, connect, flush, ...) resolve a
//! oneshot, streaming requests (queries) feed an ordered chunk stream.
//! Different ids interleave freely and make progress independently; order
//! is guaranteed per id only.
//!
//! An inbound id with no pending entry means the host and the bridge have
//! desynchronized; the channel treats that as fatal, failing every pending
//! request and refusing further sends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Message, Payload};
use crate::transport::Transport;

/// Events delivered to a pending stream entry.
enum StreamEvent {
    /// One payload buffer, in host send order.
    Chunk(Vec<u8>),
    /// The host finished the stream.
    End,
    /// The stream was rejected or torn down.
    Failed(BridgeError),
}

/// A pending-delivery record for one correlation id.
enum Pending {
    /// Expects exactly one response payload.
    Unary(oneshot::Sender<BridgeResult<Payload>>),
    /// Expects data chunks terminated by end-of-stream or error.
    Stream(StreamEntry),
}

struct StreamEntry {
    tx: mpsc::UnboundedSender<StreamEvent>,
    /// Set once the caller requested cancellation; further host messages for
    /// this id are discarded. The entry itself stays until the host acks,
    /// so a late chunk can never be misrouted.
    cancelled: bool,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Multiplexes concurrent request/response and streaming exchanges over one
/// transport to the engine host.
pub struct MessageChannel {
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl MessageChannel {
    /// Take ownership of the caller-side transport endpoint and start the
    /// background reader task.
    pub fn new(transport: Transport) -> Self {
        let Transport { tx, rx } = transport;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = Self::spawn_reader_task(rx, pending.clone(), closed.clone());

        Self {
            outbound: tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    /// Whether the channel can still reach the host.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a unary request and wait for its single response payload.
    ///
    /// Engine error payloads are surfaced verbatim as
    /// [`BridgeError::Engine`].
    pub async fn request(&self, payload: Payload) -> BridgeResult<Payload> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.register(id, Pending::Unary(tx))?;
        self.send_message(id, payload).await?;

        let response = rx.await??;
        match response {
            Payload::Error { error } => Err(BridgeError::engine(error.code, error.message)),
            other => Ok(other),
        }
    }

    /// Send a streaming request and return the ordered chunk stream.
    pub async fn open_stream(&self, payload: Payload) -> BridgeResult<ResponseStream> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(
            id,
            Pending::Stream(StreamEntry {
                tx,
                cancelled: false,
            }),
        )?;
        self.send_message(id, payload).await?;
        debug!("opened stream {}", id);

        Ok(ResponseStream {
            id,
            rx,
            done: false,
        })
    }

    /// Request cancellation of the stream with the given id.
    ///
    /// Delivery to the caller stops immediately (the pending stream resolves
    /// with [`BridgeError::Cancelled`]); the host may still be mid-execution,
    /// so this waits for the host's acknowledgment before the id's mapping
    /// entry is released.
    pub async fn cancel(&self, target: u64) -> BridgeResult<()> {
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            match pending.get_mut(&target) {
                Some(Pending::Stream(entry)) if !entry.cancelled => {
                    entry.cancelled = true;
                    let _ = entry.tx.send(StreamEvent::Failed(BridgeError::Cancelled));
                }
                // Already finished, already cancelled, or never streamed.
                _ => return Ok(()),
            }
        }

        let ack = self.request(Payload::CancelRequest { target }).await;
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(&target);
        }
        match ack? {
            Payload::CancelAck => Ok(()),
            other => Err(BridgeError::protocol(format!(
                "expected cancel-ack, got {}",
                other.kind()
            ))),
        }
    }

    /// Fire-and-forget cancellation, for contexts that cannot await (e.g.
    /// dropping an unconsumed query result).
    pub fn cancel_detached(self: &Arc<Self>, target: u64) {
        let channel = Arc::clone(self);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = channel.cancel(target).await {
                    warn!("detached cancel of {} failed: {}", target, err);
                }
            });
        }
    }

    /// Tear the channel down: stop the reader and resolve every pending
    /// request with a cancellation error. Further sends fail.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        fail_all(&self.pending, || BridgeError::Cancelled);
        debug!("channel shut down");
    }

    fn register(&self, id: u64, entry: Pending) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        let mut pending = self.pending.lock().expect("pending map poisoned");
        pending.insert(id, entry);
        Ok(())
    }

    async fn send_message(&self, id: u64, payload: Payload) -> BridgeResult<()> {
        let result = self.outbound.send(Message::new(id, payload)).await;
        if result.is_err() {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(&id);
            self.closed.store(true, Ordering::SeqCst);
            return Err(BridgeError::ChannelClosed);
        }
        Ok(())
    }

    fn spawn_reader_task(
        mut rx: mpsc::Receiver<Message>,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !route(&pending, message) {
                    // Unmatched id: host/bridge desynchronization.
                    closed.store(true, Ordering::SeqCst);
                    fail_all(&pending, || {
                        BridgeError::protocol("response for unknown correlation id")
                    });
                    return;
                }
            }

            // Host side gone; resolve everything still pending.
            closed.store(true, Ordering::SeqCst);
            fail_all(&pending, || BridgeError::ChannelClosed);
        })
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route one inbound message to its pending entry.
///
/// Returns `false` on a protocol violation that must poison the channel.
fn route(pending: &PendingMap, message: Message) -> bool {
    let mut pending = pending.lock().expect("pending map poisoned");
    match pending.remove(&message.id) {
        None => {
            error!(
                "protocol violation: {} for unknown id {}",
                message.payload.kind(),
                message.id
            );
            false
        }
        Some(Pending::Unary(tx)) => {
            let _ = tx.send(Ok(message.payload));
            true
        }
        Some(Pending::Stream(stream)) => {
            if stream.cancelled {
                // Discard everything for a cancelled id; the entry is
                // released when the host acks the cancellation.
                debug!(
                    "discarding {} for cancelled id {}",
                    message.payload.kind(),
                    message.id
                );
                pending.insert(message.id, Pending::Stream(stream));
                return true;
            }
            match message.payload {
                Payload::DataChunk { buffer } => {
                    let _ = stream.tx.send(StreamEvent::Chunk(buffer));
                    pending.insert(message.id, Pending::Stream(stream));
                }
                Payload::EndOfStream => {
                    let _ = stream.tx.send(StreamEvent::End);
                }
                Payload::Error { error } => {
                    let _ = stream.tx.send(StreamEvent::Failed(BridgeError::engine(
                        error.code,
                        error.message,
                    )));
                }
                other => {
                    error!(
                        "protocol violation: {} on streaming id {}",
                        other.kind(),
                        message.id
                    );
                    return false;
                }
            }
            true
        }
    }
}

/// Resolve every pending entry with a freshly built error.
fn fail_all(pending: &PendingMap, make_error: impl Fn() -> BridgeError) {
    let mut pending = pending.lock().expect("pending map poisoned");
    for (_, entry) in pending.drain() {
        match entry {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(make_error()));
            }
            Pending::Stream(stream) => {
                let _ = stream.tx.send(StreamEvent::Failed(make_error()));
            }
        }
    }
}

/// Ordered chunk stream for one correlation id.
///
/// Chunks arrive in host send order; the stream is finite and not
/// restartable.
pub struct ResponseStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl ResponseStream {
    /// Correlation id of the request this stream answers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the next chunk; `Ok(None)` signals end of stream.
    pub async fn next_chunk(&mut self) -> BridgeResult<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Chunk(buffer)) => Ok(Some(buffer)),
            Some(StreamEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Failed(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Err(BridgeError::ChannelClosed)
            }
        }
    }

    /// Whether the stream has delivered its terminal event.
    pub fn is_finished(&self) -> bool {
        self.done
    }
}

impl Stream for ResponseStream {
    type Item = BridgeResult<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamEvent::Chunk(buffer))) => Poll::Ready(Some(Ok(buffer))),
            Poll::Ready(Some(StreamEvent::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(BridgeError::ChannelClosed)))
            }
        }
    }
}
