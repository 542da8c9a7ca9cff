//! Duplex JSON-RPC peer.
//!
//! One [`RpcPeer`] sits on one connection. It owns:
//!
//! - a dispatch table of inbound method handlers ([`RpcPeer::add_method`]),
//! - a pending table of outbound requests awaiting a response
//!   ([`RpcPeer::request`]),
//! - a writer task draining a bounded queue of serialized frames onto the
//!   transport.
//!
//! The read side is driven by [`RpcPeer::serve`]: bytes are framed into lines
//! and every line goes through [`RpcPeer::handle_line`] in arrival order.
//! Handlers are awaited inline, so they must return promptly; long-running
//! work belongs on a spawned task.
//!
//! Protocol faults (bad JSON, unknown methods, failing handlers) never stop
//! the peer. Only a transport failure or an explicit [`RpcPeer::stop`] does,
//! and stopping rejects every pending outbound request with
//! [`AppError::ConnectionClosed`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::codec::{LineReader, MAX_LINE_BYTES};
use crate::rpc::frame::{Frame, MalformedFrame, RequestId, RpcError};
use crate::{AppError, Result};

/// Default capacity of the outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// How long the writer keeps flushing queued frames after the peer stops.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Boxed future returned by a method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, RpcError>> + Send>>;

type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

type PendingSender = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingSender>,
    closed: bool,
}

/// Pending-table slot owned by one outbound request.
struct PendingEntry {
    pending: Arc<Mutex<PendingTable>>,
    id: RequestId,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.entries.remove(&self.id);
            return;
        }
        // Contended: finish the removal on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pending = Arc::clone(&self.pending);
            let id = self.id.clone();
            handle.spawn(async move {
                pending.lock().await.entries.remove(&id);
            });
        }
    }
}

/// JSON-RPC engine bound to one duplex connection.
pub struct RpcPeer {
    connection_id: String,
    outbound: mpsc::Sender<String>,
    methods: Mutex<HashMap<String, Handler>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
    max_line_bytes: usize,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RpcPeer {
    /// Create a peer writing to `writer` with default limits.
    ///
    /// Spawns the writer task; must be called inside a tokio runtime.
    pub fn new<W>(connection_id: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_limits(connection_id, writer, DEFAULT_OUTBOUND_QUEUE, MAX_LINE_BYTES)
    }

    /// Create a peer with an explicit outbound queue capacity and line limit.
    pub fn with_limits<W>(
        connection_id: impl Into<String>,
        writer: W,
        outbound_queue: usize,
        max_line_bytes: usize,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_writer(
            connection_id.clone(),
            writer,
            rx,
            shutdown.clone(),
        ));

        Arc::new(Self {
            connection_id,
            outbound: tx,
            methods: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(PendingTable::default())),
            next_id: AtomicI64::new(1),
            shutdown,
            max_line_bytes,
        })
    }

    /// Identifier of the connection this peer is bound to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether [`RpcPeer::stop`] has run or the transport has failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the peer is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Register `handler` for inbound requests and notifications named `name`.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub async fn add_method<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| -> HandlerFuture { Box::pin(handler(params)) });
        self.methods.lock().await.insert(name.to_owned(), handler);
    }

    /// Write a notification frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] once the peer is stopped, or
    /// [`AppError::Protocol`] if `params` cannot be serialized.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.send_frame(&Frame::Notification {
            method: method.to_owned(),
            params,
        })
        .await
    }

    /// Send a request and wait for the matching response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`] when the other side answers with an error.
    /// - [`AppError::ConnectionClosed`] when the peer stops first.
    pub async fn request(&self, method: &str, params: impl Serialize) -> Result<Value> {
        self.call(method, params, None).await
    }

    /// Like [`RpcPeer::request`], giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// As [`RpcPeer::request`], plus [`AppError::Timeout`] when the deadline
    /// passes. The pending entry is removed so a late response is dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Duration,
    ) -> Result<Value> {
        self.call(method, params, Some(timeout)).await
    }

    /// Number of outbound requests still awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    /// Handle one decoded line from the transport.
    pub async fn handle_line(&self, line: &str) {
        match Frame::parse(line) {
            Ok(Frame::Request { id, method, params }) => {
                let outcome = match self.invoke(&method, params).await {
                    Some(outcome) => outcome,
                    None => {
                        warn!(
                            connection_id = %self.connection_id,
                            %method,
                            request_id = %id,
                            "rpc: request for unknown method"
                        );
                        Err(RpcError::method_not_found(&method))
                    }
                };
                self.respond(id, outcome).await;
            }
            Ok(Frame::Notification { method, params }) => {
                match self.invoke(&method, params).await {
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(
                            connection_id = %self.connection_id,
                            %method,
                            code = err.code,
                            error = %err.message,
                            "rpc: notification handler failed"
                        );
                    }
                    None => {
                        debug!(
                            connection_id = %self.connection_id,
                            %method,
                            "rpc: ignoring notification for unknown method"
                        );
                    }
                }
            }
            Ok(Frame::Response { id, outcome }) => {
                let sender = self.pending.lock().await.entries.remove(&id);
                match sender {
                    Some(tx) => {
                        if tx.send(outcome.map_err(AppError::from)).is_err() {
                            debug!(
                                connection_id = %self.connection_id,
                                request_id = %id,
                                "rpc: response arrived after caller gave up"
                            );
                        }
                    }
                    None => {
                        warn!(
                            connection_id = %self.connection_id,
                            request_id = %id,
                            "rpc: response for unknown request id, dropping"
                        );
                    }
                }
            }
            Err(MalformedFrame { id: Some(id), error }) => {
                warn!(
                    connection_id = %self.connection_id,
                    request_id = %id,
                    error = %error.message,
                    "rpc: invalid request"
                );
                self.respond(id, Err(error)).await;
            }
            Err(MalformedFrame { id: None, error }) => {
                warn!(
                    connection_id = %self.connection_id,
                    error = %error.message,
                    "rpc: dropping malformed frame"
                );
            }
        }
    }

    /// Drive the read side until EOF, transport error, or [`RpcPeer::stop`].
    ///
    /// Always stops the peer before returning.
    pub async fn serve<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lines = LineReader::new(reader, self.max_line_bytes);

        loop {
            let next = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!(connection_id = %self.connection_id, "rpc: peer stopped, leaving read loop");
                    break;
                }

                next = lines.next_line() => next,
            };

            match next {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {
                    debug!(connection_id = %self.connection_id, "rpc: EOF");
                    break;
                }
                Err(err) => {
                    warn!(connection_id = %self.connection_id, %err, "rpc: transport read failed");
                    break;
                }
            }
        }

        self.stop().await;
    }

    /// Reject all pending requests, clear the dispatch table, and release
    /// the transport. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.methods.lock().await.clear();

        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return;
            }
            pending.closed = true;
            pending.entries.drain().map(|(_, tx)| tx).collect()
        };

        if !drained.is_empty() {
            info!(
                connection_id = %self.connection_id,
                count = drained.len(),
                "rpc: rejecting pending requests on stop"
            );
        }
        for tx in drained {
            let _ = tx.send(Err(AppError::ConnectionClosed));
        }
    }

    async fn call(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let params = serde_json::to_value(params)?;
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(AppError::ConnectionClosed);
            }
            pending.entries.insert(id.clone(), tx);
        }
        // Removes the entry on every exit, including the caller dropping us.
        let _entry = PendingEntry {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        let frame = Frame::Request {
            id: id.clone(),
            method: method.to_owned(),
            params,
        };
        self.send_frame(&frame).await?;
        debug!(connection_id = %self.connection_id, %method, request_id = %id, "rpc: request sent");

        let wait = async {
            tokio::select! {
                outcome = rx => outcome.unwrap_or(Err(AppError::ConnectionClosed)),
                () = self.shutdown.cancelled() => Err(AppError::ConnectionClosed),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!(
                    "no response to {method} (id {id}) within {limit:?}"
                )))
            }),
            None => wait.await,
        }
    }

    async fn invoke(
        &self,
        method: &str,
        params: Value,
    ) -> Option<std::result::Result<Value, RpcError>> {
        let handler = self.methods.lock().await.get(method).cloned()?;
        let guarded = AssertUnwindSafe(async move { handler(params).await });
        match guarded.catch_unwind().await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(connection_id = %self.connection_id, %method, "rpc: handler panicked");
                Some(Err(RpcError::internal(format!("handler for {method} panicked"))))
            }
        }
    }

    async fn respond(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) {
        let frame = Frame::Response {
            id: id.clone(),
            outcome,
        };
        if let Err(err) = self.send_frame(&frame).await {
            debug!(
                connection_id = %self.connection_id,
                request_id = %id,
                error = %err,
                "rpc: could not write response"
            );
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::ConnectionClosed);
        }
        let line = serde_json::to_string(&frame.to_value())?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }
}

/// Writer task: drains the outbound queue onto the transport.
///
/// A failed write cancels `shutdown`, which in turn ends the read loop and
/// rejects pending requests. After cancellation, frames already queued are
/// flushed for up to [`DRAIN_TIMEOUT`].
async fn run_writer<W>(
    connection_id: String,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                rx.close();
                let drain = async {
                    while let Some(line) = rx.recv().await {
                        if write_line(&mut writer, line).await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                    debug!(connection_id, "rpc writer: drain timed out");
                }
                break;
            }

            line = rx.recv() => {
                let Some(line) = line else {
                    debug!(connection_id, "rpc writer: queue closed, stopping");
                    break;
                };
                if let Err(err) = write_line(&mut writer, line).await {
                    warn!(connection_id, %err, "rpc writer: transport write failed");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!(connection_id, "rpc writer: stopped");
}

async fn write_line<W>(writer: &mut W, mut line: String) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // NDJSON: append the newline delimiter.
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
