// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating Fast clients.
//!
//! A [`FastClient`] owns one duplex transport and multiplexes any number of
//! concurrent RPC requests over it. Each call to [`FastClient::rpc`] is
//! assigned a fresh message id from the circular 31-bit id space and
//! returns a [`FastRequestStream`]: the lazy, finite sequence of data
//! values the server emits for that request, terminated by exactly one
//! outcome (success after `END`, or a [`FastRequestError`]).
//!
//! All connection state lives in a single task spawned at construction
//! time; it owns the codec, the message id cursor, and the table of
//! in-flight requests, so no locks are held across suspension points.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use slog::{debug, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;

use crate::crc::FastCrcMode;
use crate::error::{
    FastError, FastProtocolError, FastReason, FastRequestCause,
    FastRequestError, FastServerError, FastTransportError,
};
use crate::metrics::FastMetrics;
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageId, FastMessageServerError,
    FastMessageStatus, FastRpc,
};

/// Default bound on the recently-completed request ring kept for diagnosing
/// late-arriving messages.
pub const DEFAULT_N_RECENT_REQUESTS: usize = 128;

const COMMAND_BUFFER_SZ: usize = 16;
const REQUEST_EVENT_BUFFER_SZ: usize = 64;

/// Options recognized at client construction.
#[derive(Clone, Default)]
pub struct FastClientOptions {
    /// Checksum mode for this connection. Must be a concrete mode; the
    /// dual-accept mode is a server-only setting.
    pub crc_mode: FastCrcMode,
    /// How many completed requests to remember for late-arrival diagnosis.
    pub n_recent_requests: Option<usize>,
    /// Logger; defaults to the stdlog drain.
    pub log: Option<Logger>,
    /// Metrics sink.
    pub collector: Option<FastMetrics>,
}

impl FastClientOptions {
    pub fn with_crc_mode(mut self, crc_mode: FastCrcMode) -> Self {
        self.crc_mode = crc_mode;
        self
    }

    pub fn with_n_recent_requests(mut self, n: usize) -> Self {
        self.n_recent_requests = Some(n);
        self
    }

    pub fn with_log(mut self, log: Logger) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_collector(mut self, collector: FastMetrics) -> Self {
        self.collector = Some(collector);
        self
    }
}

enum ClientCommand {
    Rpc {
        method: String,
        args: Value,
        events: mpsc::Sender<RequestEvent>,
    },
    Detach {
        done: oneshot::Sender<()>,
    },
}

enum RequestEvent {
    Data(Value),
    End,
    Failed(FastRequestError),
}

#[derive(Clone)]
enum ClientState {
    Running,
    Closed(Option<Arc<FastError>>),
}

/// The streaming result of one RPC request: data values in arrival order,
/// then exactly one terminal outcome. Success is observed as the stream
/// ending after `recv` has returned `None`; failure as a final
/// `Err(FastRequestError)` item.
pub struct FastRequestStream {
    method: String,
    events: mpsc::Receiver<RequestEvent>,
    done: bool,
}

impl FastRequestStream {
    /// The RPC method this request invoked.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Receives the next data value, a terminal error, or `None` once the
    /// request has completed successfully.
    pub async fn recv(&mut self) -> Option<Result<Value, FastRequestError>> {
        self.next().await
    }
}

impl Stream for FastRequestStream {
    type Item = Result<Value, FastRequestError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(RequestEvent::Data(value))) => {
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(RequestEvent::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(RequestEvent::Failed(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            // The connection task never drops a request without a terminal
            // event; a closed channel here means the whole runtime is
            // tearing down.
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(FastRequestError::new(
                    None,
                    self.method.clone(),
                    FastRequestCause::Connection(Arc::new(
                        FastError::Detached,
                    )),
                ))))
            }
        }
    }
}

/// A Fast RPC client bound to one connected duplex transport.
pub struct FastClient {
    commands: mpsc::Sender<ClientCommand>,
    state: watch::Receiver<ClientState>,
}

impl FastClient {
    /// Creates a client over the provided transport and spawns its
    /// connection task on the current tokio runtime. Fails synchronously if
    /// the options name the dual-accept checksum mode, which is not legal
    /// for clients.
    pub fn new<T>(
        transport: T,
        options: FastClientOptions,
    ) -> Result<FastClient, FastError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        options.crc_mode.require_concrete("client construction")?;

        // If no logger was provided use the slog StdLog drain by default
        let log = options
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SZ);
        let (state_tx, state_rx) = watch::channel(ClientState::Running);
        let framed = Framed::new(transport, FastRpc::new(options.crc_mode));
        let shared = ClientShared {
            log,
            metrics: options.collector.clone(),
            state_tx,
            n_recent_requests: options
                .n_recent_requests
                .unwrap_or(DEFAULT_N_RECENT_REQUESTS),
        };
        tokio::spawn(run_connection(framed, cmd_rx, shared));

        Ok(FastClient {
            commands: cmd_tx,
            state: state_rx,
        })
    }

    /// Issues an RPC request. `args` must be a JSON array; its elements are
    /// the arguments of the remote method. The returned stream yields the
    /// data values the server emits for this request.
    pub async fn rpc(
        &self,
        method: &str,
        args: Value,
    ) -> Result<FastRequestStream, FastError> {
        if !args.is_array() {
            return Err(FastError::InvalidArgument(String::from(
                "rpc arguments must be a JSON array",
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(REQUEST_EVENT_BUFFER_SZ);
        self.commands
            .send(ClientCommand::Rpc {
                method: String::from(method),
                args,
                events: events_tx,
            })
            .await
            .map_err(|_| self.closed_error())?;

        Ok(FastRequestStream {
            method: String::from(method),
            events: events_rx,
            done: false,
        })
    }

    /// Issues an RPC request and buffers its data values, failing the
    /// request if the server emits more than `max_objects` of them.
    pub async fn rpc_buffered(
        &self,
        method: &str,
        args: Value,
        max_objects: usize,
    ) -> Result<Vec<Value>, FastRequestError> {
        let mut stream = self.rpc(method, args).await.map_err(|e| {
            FastRequestError::new(
                None,
                method,
                FastRequestCause::Connection(Arc::new(e)),
            )
        })?;

        let mut items = Vec::new();
        while let Some(next) = stream.recv().await {
            let value = next?;
            if items.len() == max_objects {
                return Err(FastRequestError::new(
                    None,
                    method,
                    FastRequestCause::BufferExceeded(max_objects),
                ));
            }
            items.push(value);
        }
        Ok(items)
    }

    /// Detaches the client from its transport. Every in-flight request
    /// fails with a detach error; by the time this returns, those failures
    /// have been delivered. No shutdown is written to the transport; the
    /// connection task simply stops driving it.
    pub async fn detach(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(ClientCommand::Detach { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Resolves once the connection has terminated, with the
    /// connection-level error when it failed and `None` when it ended
    /// cleanly (detach, or transport close with nothing outstanding).
    pub async fn closed(&self) -> Option<Arc<FastError>> {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                if let ClientState::Closed(cause) = &*current {
                    return cause.clone();
                }
            }
            if state.changed().await.is_err() {
                return None;
            }
        }
    }

    /// The connection-level error, if the connection has failed.
    pub fn connection_error(&self) -> Option<Arc<FastError>> {
        match &*self.state.borrow() {
            ClientState::Closed(Some(cause)) => Some(cause.clone()),
            _ => None,
        }
    }

    fn closed_error(&self) -> FastError {
        match &*self.state.borrow() {
            ClientState::Closed(Some(cause)) => FastError::Transport(
                FastTransportError::new(format!(
                    "client connection has failed: {}",
                    cause
                )),
            ),
            _ => FastError::Detached,
        }
    }
}

struct ClientShared {
    log: Logger,
    metrics: Option<FastMetrics>,
    state_tx: watch::Sender<ClientState>,
    n_recent_requests: usize,
}

struct PendingRequest {
    method: String,
    events: mpsc::Sender<RequestEvent>,
    ndata: u64,
    started: Instant,
}

struct CompletedRequest {
    msgid: u32,
    method: String,
}

/// Allocates the next message id, skipping any id still in flight.
/// Amortized O(1): the id space is vastly larger than any realistic
/// in-flight set, so the skip loop almost never iterates.
fn next_free_msgid<V>(
    ids: &mut FastMessageId,
    in_flight: &HashMap<u32, V>,
) -> u32 {
    loop {
        // It is safe to call unwrap on the msg_id iterator because the
        // implementation of Iterator for FastMessageId will only ever return
        // Some(id). The Option return type is required by the Iterator trait.
        let candidate = ids.next().unwrap();
        if !in_flight.contains_key(&candidate) {
            return candidate;
        }
    }
}

async fn run_connection<T>(
    mut framed: Framed<T, FastRpc>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    shared: ClientShared,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending: HashMap<u32, PendingRequest> = HashMap::new();
    let mut recent: VecDeque<CompletedRequest> = VecDeque::new();
    let mut msg_ids = FastMessageId::new();

    let outcome = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCommand::Rpc { method, args, events }) => {
                    if let Err(err) = start_request(
                        &mut framed,
                        &mut pending,
                        &mut msg_ids,
                        &shared,
                        method,
                        args,
                        events,
                    )
                    .await
                    {
                        break Outcome::Failed(err);
                    }
                }
                Some(ClientCommand::Detach { done }) => {
                    break Outcome::Detached(Some(done));
                }
                // The client handle was dropped; treat it as a detach.
                None => break Outcome::Detached(None),
            },
            msg = framed.next() => match msg {
                Some(Ok(msg)) => {
                    if let Err(err) = dispatch_message(
                        msg,
                        &mut pending,
                        &mut recent,
                        &shared,
                    )
                    .await
                    {
                        break Outcome::Failed(err);
                    }
                }
                Some(Err(err)) => break Outcome::Failed(err),
                None => break Outcome::TransportEnded,
            },
        }
    };

    let (cause, detach_ack, was_failure) = match outcome {
        Outcome::Failed(err) => (Some(Arc::new(err)), None, true),
        Outcome::Detached(ack) => {
            let cause = if pending.is_empty() {
                None
            } else {
                Some(Arc::new(FastError::Detached))
            };
            (cause, ack, false)
        }
        Outcome::TransportEnded => {
            let cause = if pending.is_empty() {
                None
            } else {
                Some(Arc::new(FastError::Transport(FastTransportError::new(
                    "unexpected end of transport stream",
                ))))
            };
            (cause, None, false)
        }
    };

    if let Some(cause) = &cause {
        warn!(shared.log, "fast client connection terminated";
            "err" => %cause, "outstanding" => pending.len());
        for (msgid, entry) in pending.drain() {
            let err = FastRequestError::new(
                msgid,
                entry.method,
                FastRequestCause::Connection(cause.clone()),
            );
            let _ = entry.events.send(RequestEvent::Failed(err)).await;
        }
    }

    // Requests queued behind the terminating command never reached the
    // wire; fail them too so every request sees a terminal outcome.
    cmd_rx.close();
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ClientCommand::Rpc { method, events, .. } => {
                let queued_cause = cause
                    .clone()
                    .unwrap_or_else(|| Arc::new(FastError::Detached));
                let err = FastRequestError::new(
                    None,
                    method,
                    FastRequestCause::Connection(queued_cause),
                );
                let _ = events.send(RequestEvent::Failed(err)).await;
            }
            ClientCommand::Detach { done } => {
                let _ = done.send(());
            }
        }
    }

    // The connection-level error is reported exactly once. A detach or a
    // quiet transport close reports a clean shutdown.
    let reported = if was_failure {
        ClientState::Closed(cause)
    } else {
        ClientState::Closed(None)
    };
    let _ = shared.state_tx.send(reported);

    if let Some(done) = detach_ack {
        let _ = done.send(());
    }
}

enum Outcome {
    Failed(FastError),
    Detached(Option<oneshot::Sender<()>>),
    TransportEnded,
}

async fn start_request<T>(
    framed: &mut Framed<T, FastRpc>,
    pending: &mut HashMap<u32, PendingRequest>,
    msg_ids: &mut FastMessageId,
    shared: &ClientShared,
    method: String,
    args: Value,
    events: mpsc::Sender<RequestEvent>,
) -> Result<(), FastError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let msgid = next_free_msgid(msg_ids, pending);
    let msg = FastMessage::data(
        msgid,
        FastMessageData::new(method.clone(), args),
    );

    debug!(shared.log, "sending rpc request";
        "rpcMethod" => %method, "rpcMsgid" => msgid);

    pending.insert(
        msgid,
        PendingRequest {
            method,
            events,
            ndata: 0,
            started: Instant::now(),
        },
    );

    framed.send(msg).await
}

async fn dispatch_message(
    msg: FastMessage,
    pending: &mut HashMap<u32, PendingRequest>,
    recent: &mut VecDeque<CompletedRequest>,
    shared: &ClientShared,
) -> Result<(), FastError> {
    let msgid = msg.id;

    if !pending.contains_key(&msgid) {
        let message = match recent.iter().find(|c| c.msgid == msgid) {
            Some(completed) => format!(
                "server sent message for request that has already \
                 completed: msgid {} (method {})",
                msgid, completed.method
            ),
            None => {
                format!("server sent message with unknown msgid {}", msgid)
            }
        };
        return Err(
            FastProtocolError::new(FastReason::UnknownMsgid, message).into()
        );
    }

    match msg.status {
        FastMessageStatus::Data => {
            deliver_data(pending, msgid, msg.data.d).await;
        }
        FastMessageStatus::End => {
            deliver_data(pending, msgid, msg.data.d).await;
            if let Some(entry) = pending.remove(&msgid) {
                debug!(shared.log, "rpc request completed";
                    "rpcMethod" => %entry.method, "rpcMsgid" => msgid,
                    "ndata" => entry.ndata,
                    "elapsed_ms" => entry.started.elapsed().as_millis() as u64);
                let _ = entry.events.send(RequestEvent::End).await;
                complete_request(recent, shared, msgid, entry.method);
            }
        }
        FastMessageStatus::Error => {
            if let Some(entry) = pending.remove(&msgid) {
                let server_err: FastMessageServerError =
                    serde_json::from_value(msg.data.d)
                        .unwrap_or_else(|_| unspecified_error());
                debug!(shared.log, "rpc request failed";
                    "rpcMethod" => %entry.method, "rpcMsgid" => msgid,
                    "err" => %server_err);
                let err = FastRequestError::new(
                    msgid,
                    entry.method.clone(),
                    FastRequestCause::Server(FastServerError::new(server_err)),
                );
                let _ = entry.events.send(RequestEvent::Failed(err)).await;
                complete_request(recent, shared, msgid, entry.method);
            }
        }
    }

    Ok(())
}

async fn deliver_data(
    pending: &mut HashMap<u32, PendingRequest>,
    msgid: u32,
    d: Value,
) {
    if let Some(entry) = pending.get_mut(&msgid) {
        if let Value::Array(items) = d {
            for item in items {
                entry.ndata += 1;
                // A dropped stream abandons the request's data but the
                // request itself stays in flight until its terminal
                // message arrives.
                let _ = entry.events.send(RequestEvent::Data(item)).await;
            }
        }
    }
}

fn complete_request(
    recent: &mut VecDeque<CompletedRequest>,
    shared: &ClientShared,
    msgid: u32,
    method: String,
) {
    if let Some(metrics) = &shared.metrics {
        metrics.observe_request_completed(&method);
    }
    if shared.n_recent_requests > 0 {
        if recent.len() == shared.n_recent_requests {
            recent.pop_front();
        }
        recent.push_back(CompletedRequest { msgid, method });
    }
}

fn unspecified_error() -> FastMessageServerError {
    FastMessageServerError::new(
        "UnspecifiedServerError",
        "Server reported unspecified error.",
    )
}
