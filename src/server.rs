// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating Fast servers.
//!
//! A [`FastServer`] accepts connections from a listening transport and
//! routes each inbound request to the handler registered for its RPC
//! method name. Handlers receive a [`FastResponseWriter`] bound to the
//! request's message id and connection; they may stream any number of data
//! values before exactly one call to `end` or `fail`. Handlers for
//! different message ids on the same connection run concurrently; ordering
//! is preserved per message id only.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::crc::FastCrcMode;
use crate::error::{FastError, FastProtocolError, FastReason};
use crate::metrics::FastMetrics;
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageServerError, FastMessageStatus,
    FastRpc,
};

const OUTBOUND_BUFFER_SZ: usize = 64;

/// Options recognized at server construction.
#[derive(Clone, Default)]
pub struct FastServerOptions {
    /// Checksum mode for this server. `V1V2` accepts messages checksummed
    /// with either variant and mirrors the sender's variant in replies.
    pub crc_mode: FastCrcMode,
    /// Logger; defaults to the stdlog drain.
    pub log: Option<Logger>,
    /// Metrics sink.
    pub collector: Option<FastMetrics>,
}

impl FastServerOptions {
    pub fn with_crc_mode(mut self, crc_mode: FastCrcMode) -> Self {
        self.crc_mode = crc_mode;
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

/// A server-side RPC handler bound to a method name.
///
/// `invoke` is called once per inbound request with a response writer bound
/// to the request's message id and the request's argument array. The
/// returned future is spawned as its own task, so handlers for different
/// message ids on the same connection execute concurrently.
pub trait RpcHandler: Send + Sync + 'static {
    fn invoke(
        &self,
        response: FastResponseWriter,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(FastResponseWriter, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn invoke(
        &self,
        response: FastResponseWriter,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin((self)(response, args))
    }
}

struct ServerRequest {
    method: String,
    started: Instant,
}

/// Per-connection request bookkeeping. `terminated` remembers every msgid
/// that has seen its terminal message for the life of the connection, so a
/// client reusing one is caught as a protocol violation.
#[derive(Default)]
struct ConnRequests {
    active: HashMap<u32, ServerRequest>,
    terminated: HashSet<u32>,
}

type RequestTable = Arc<Mutex<ConnRequests>>;

struct ConnRegistry {
    active: HashMap<u64, ()>,
    waiters: Vec<oneshot::Sender<()>>,
}

struct ServerInner {
    crc_mode: FastCrcMode,
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    conns: Mutex<ConnRegistry>,
    next_conn_id: AtomicU64,
    log: Logger,
    metrics: Option<FastMetrics>,
}

/// A Fast RPC server.
pub struct FastServer {
    inner: Arc<ServerInner>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: broadcast::Sender<()>,
}

impl FastServer {
    /// Creates a server that will accept connections from the provided
    /// listener once [`FastServer::run`] is invoked.
    pub fn new(listener: TcpListener, options: FastServerOptions) -> FastServer {
        // If no logger was provided use the slog StdLog drain by default
        let log = options
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (shutdown_tx, _) = broadcast::channel(1);

        FastServer {
            inner: Arc::new(ServerInner {
                crc_mode: options.crc_mode,
                handlers: RwLock::new(HashMap::new()),
                conns: Mutex::new(ConnRegistry {
                    active: HashMap::new(),
                    waiters: Vec::new(),
                }),
                next_conn_id: AtomicU64::new(1),
                log,
                metrics: options.collector,
            }),
            listener: Mutex::new(Some(listener)),
            shutdown: shutdown_tx,
        }
    }

    /// Registers `handler` for the RPC method `name`. Registering a name a
    /// second time replaces the prior handler.
    pub fn register_rpc_method(
        &self,
        name: impl Into<String>,
        handler: impl RpcHandler,
    ) {
        let name = name.into();
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap()
            .insert(name.clone(), Arc::new(handler));
        if replaced.is_some() {
            debug!(self.inner.log, "replaced rpc method handler";
                "rpcMethod" => name);
        }
    }

    /// Accepts connections until [`FastServer::close`] is called.
    pub async fn run(&self) -> Result<(), FastError> {
        let listener =
            self.listener.lock().unwrap().take().ok_or_else(|| {
                FastError::InvalidArgument(String::from(
                    "server is already running",
                ))
            })?;

        match listener.local_addr() {
            Ok(addr) => {
                info!(self.inner.log, "listening for fast requests";
                    "address" => %addr);
            }
            Err(_) => {
                info!(self.inner.log, "listening for fast requests");
            }
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        stream.set_nodelay(true).ok();
                        let conn_id = self.serve_connection(stream);
                        debug!(self.inner.log, "accepted fast connection";
                            "peer" => %addr, "connection_id" => conn_id);
                    }
                    Err(e) => {
                        error!(self.inner.log, "failed to accept socket";
                            "err" => %e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!(self.inner.log, "fast server closing");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drives a single connected transport as a Fast connection, returning
    /// its connection id. Useful for transports that did not come from this
    /// server's listener.
    pub fn serve_connection<T>(&self, transport: T) -> u64
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn_id =
            self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .conns
            .lock()
            .unwrap()
            .active
            .insert(conn_id, ());
        tokio::spawn(connection_task(
            self.inner.clone(),
            transport,
            conn_id,
        ));
        conn_id
    }

    /// Stops accepting new connections. Connections already established are
    /// left alone; their in-flight work runs to completion.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a future that resolves when the set of active connections is
    /// empty. A registration made while the set is already empty resolves
    /// on the next scheduler turn; otherwise registrations resolve, in
    /// registration order, each time the active set transitions to empty.
    pub fn on_conns_destroyed(&self) -> ConnsDestroyed {
        let (tx, rx) = oneshot::channel();
        let mut conns = self.inner.conns.lock().unwrap();
        if conns.active.is_empty() {
            let _ = tx.send(());
        } else {
            conns.waiters.push(tx);
        }
        ConnsDestroyed { rx }
    }

    /// The number of currently active connections.
    pub fn conn_count(&self) -> usize {
        self.inner.conns.lock().unwrap().active.len()
    }
}

/// Future returned by [`FastServer::on_conns_destroyed`].
pub struct ConnsDestroyed {
    rx: oneshot::Receiver<()>,
}

impl Future for ConnsDestroyed {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// The response writer handed to RPC handlers. `write` emits one DATA
/// message per value; `end` and `fail` emit the request's single terminal
/// message. All three report whether the message was accepted for
/// transmission: writes after termination, and writes on a connection that
/// has gone away, are dropped (and logged) rather than failing the handler.
pub struct FastResponseWriter {
    conn_id: u64,
    msgid: u32,
    method: String,
    crc_mode: FastCrcMode,
    out: mpsc::Sender<FastMessage>,
    requests: RequestTable,
    ended: AtomicBool,
    metrics: Option<FastMetrics>,
    log: Logger,
}

impl FastResponseWriter {
    /// The id of the connection this request arrived on.
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }

    /// The message id of this request.
    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    /// Emits one DATA message carrying `value`. Suspends while the
    /// transport is flow-controlled; handlers should await each write
    /// before producing more data.
    pub async fn write(&self, value: Value) -> bool {
        let msg = FastMessage::data(
            self.msgid,
            FastMessageData::new(
                self.method.clone(),
                Value::Array(vec![value]),
            ),
        );
        self.send_message(msg, false).await
    }

    /// Completes the request successfully. An optional final value is
    /// packed into the END message's data array.
    pub async fn end(&self, value: Option<Value>) -> bool {
        let d = match value {
            Some(value) => Value::Array(vec![value]),
            None => Value::Array(vec![]),
        };
        let msg = FastMessage::end_with(
            self.msgid,
            FastMessageData::new(self.method.clone(), d),
        );
        self.send_message(msg, true).await
    }

    /// Fails the request. Only the properties representable in
    /// [`FastMessageServerError`] travel to the client; anything else the
    /// handler's error carried is stripped.
    pub async fn fail(&self, error: FastMessageServerError) -> bool {
        let msg = FastMessage::error(
            self.msgid,
            FastMessageData::new(
                self.method.clone(),
                server_error_value(&error),
            ),
        );
        self.send_message(msg, true).await
    }

    async fn send_message(&self, msg: FastMessage, terminal: bool) -> bool {
        if self.ended.load(Ordering::Acquire) {
            // The request already saw its terminal message; this write is
            // dropped per the handler contract.
            debug!(self.log, "dropping write after request termination";
                "rpcMethod" => %self.method, "rpcMsgid" => self.msgid);
            return false;
        }
        if terminal {
            self.ended.store(true, Ordering::Release);
        }

        let msg = msg.with_crc_mode(self.crc_mode);
        let accepted = self.out.send(msg).await.is_ok();
        if !accepted {
            debug!(self.log, "connection gone; discarding rpc output";
                "rpcMethod" => %self.method, "rpcMsgid" => self.msgid);
        }
        if terminal {
            self.finish();
        }
        accepted
    }

    fn finish(&self) {
        let removed = {
            let mut requests = self.requests.lock().unwrap();
            let removed = requests.active.remove(&self.msgid);
            if removed.is_some() {
                requests.terminated.insert(self.msgid);
            }
            removed
        };
        if let Some(request) = removed {
            if let Some(metrics) = &self.metrics {
                metrics.observe_request_completed(&request.method);
            }
            debug!(self.log, "rpc request completed";
                "rpcMethod" => %request.method, "rpcMsgid" => self.msgid,
                "elapsed_ms" => request.started.elapsed().as_millis() as u64);
        }
    }
}

impl Drop for FastResponseWriter {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) {
            // A handler returned without terminating its request. The
            // request stays in the active table so the msgid cannot be
            // reused against a client that is still waiting.
            warn!(self.log, "rpc handler finished without end or fail";
                "rpcMethod" => %self.method, "rpcMsgid" => self.msgid);
        }
    }
}

fn server_error_value(error: &FastMessageServerError) -> Value {
    serde_json::to_value(error).unwrap_or_else(|_| {
        json!({
            "name": error.name.clone(),
            "message": error.message.clone(),
        })
    })
}

/// Maps the checksum mode a request validated under to the concrete
/// per-message mode for its replies; the encoder refuses dual-accept as an
/// effective mode, so every reply must name a single variant. A request
/// that validated under both variants gets the legacy variant, whose
/// encoding searches for a checksum both variants accept.
fn mirror_mode(
    decoded: Option<FastCrcMode>,
    default: FastCrcMode,
) -> FastCrcMode {
    match decoded {
        Some(mode) if mode.is_concrete() => mode,
        _ => match default {
            FastCrcMode::V1V2 => FastCrcMode::V1,
            concrete => concrete,
        },
    }
}

async fn connection_task<T>(
    inner: Arc<ServerInner>,
    transport: T,
    conn_id: u64,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let log = inner.log.new(o!("connection_id" => conn_id));
    let framed = Framed::new(transport, FastRpc::new(inner.crc_mode));
    let (sink, stream) = framed.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER_SZ);
    let requests: RequestTable = Arc::new(Mutex::new(ConnRequests::default()));

    let writer = tokio::spawn(write_loop(sink, out_rx, log.clone()));

    match read_loop(stream, &inner, conn_id, &requests, &out_tx, &log).await
    {
        Ok(()) => debug!(log, "fast connection ended"),
        Err(e) => warn!(log, "fast connection failed"; "err" => %e),
    }

    // The transport is gone. Anything handlers produce from here on is
    // discarded; aborting the write loop closes the writers' channel.
    drop(out_tx);
    writer.abort();
    let _ = writer.await;

    let outstanding = requests.lock().unwrap().active.len();
    if outstanding > 0 {
        debug!(log, "connection closed with handlers still running";
            "outstanding" => outstanding);
    }

    let waiters = {
        let mut conns = inner.conns.lock().unwrap();
        conns.active.remove(&conn_id);
        if conns.active.is_empty() {
            std::mem::take(&mut conns.waiters)
        } else {
            Vec::new()
        }
    };
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, FastRpc>, FastMessage>,
    mut out_rx: mpsc::Receiver<FastMessage>,
    log: Logger,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!(log, "failed to write to transport"; "err" => %e);
            break;
        }
    }
}

async fn read_loop<T>(
    mut stream: SplitStream<Framed<T, FastRpc>>,
    inner: &Arc<ServerInner>,
    conn_id: u64,
    requests: &RequestTable,
    out_tx: &mpsc::Sender<FastMessage>,
    log: &Logger,
) -> Result<(), FastError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        handle_message(msg, inner, conn_id, requests, out_tx, log).await?;
    }
    Ok(())
}

async fn handle_message(
    msg: FastMessage,
    inner: &Arc<ServerInner>,
    conn_id: u64,
    requests: &RequestTable,
    out_tx: &mpsc::Sender<FastMessage>,
    log: &Logger,
) -> Result<(), FastError> {
    let msgid = msg.id;
    let decoded_mode = msg.crc_mode;

    // The protocol defines requests as single-message: any further
    // message on an in-flight msgid is a client bug, terminal for the
    // whole connection. The same goes for a msgid whose request has
    // already seen its terminal message.
    {
        let requests = requests.lock().unwrap();
        if requests.active.contains_key(&msgid) {
            return Err(FastProtocolError::new(
                FastReason::InvalidMsgid,
                format!(
                    "client sent another message for in-flight msgid {}",
                    msgid
                ),
            )
            .into());
        }
        if requests.terminated.contains(&msgid) {
            return Err(FastProtocolError::new(
                FastReason::InvalidMsgid,
                format!(
                    "client reused msgid {} after its request terminated",
                    msgid
                ),
            )
            .into());
        }
    }

    if msg.status != FastMessageStatus::Data {
        return Err(FastProtocolError::new(
            FastReason::UnsupportedStatus,
            format!(
                "client may only initiate a request with a DATA message \
                 (msgid {})",
                msgid
            ),
        )
        .into());
    }

    let method = msg.data.m.name.clone();
    let handler = inner.handlers.read().unwrap().get(&method).cloned();
    match handler {
        None => {
            warn!(log, "no handler registered for rpc method";
                "rpcMethod" => %method, "rpcMsgid" => msgid);
            let err = FastMessageServerError::new(
                "FastError",
                &format!("unsupported RPC method: \"{}\"", method),
            )
            .with_info(json!({
                "fastReason": "bad_method",
                "rpcMethod": method,
            }));
            let reply = FastMessage::error(
                msgid,
                FastMessageData::new(
                    method.clone(),
                    server_error_value(&err),
                ),
            )
            .with_crc_mode(mirror_mode(decoded_mode, inner.crc_mode));
            // This ERROR is the msgid's terminal message; record the id so
            // the client cannot reuse it.
            requests.lock().unwrap().terminated.insert(msgid);
            let _ = out_tx.send(reply).await;
        }
        Some(handler) => {
            debug!(log, "dispatching rpc request";
                "rpcMethod" => %method, "rpcMsgid" => msgid);
            requests.lock().unwrap().active.insert(
                msgid,
                ServerRequest {
                    method: method.clone(),
                    started: Instant::now(),
                },
            );
            let response = FastResponseWriter {
                conn_id,
                msgid,
                method,
                crc_mode: mirror_mode(decoded_mode, inner.crc_mode),
                out: out_tx.clone(),
                requests: requests.clone(),
                ended: AtomicBool::new(false),
                metrics: inner.metrics.clone(),
                log: log.clone(),
            };
            tokio::spawn(handler.invoke(response, msg.data.d));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::protocol::FastRpc;
    use serde_json::json;
    use tokio_util::codec::Framed;

    async fn test_server() -> FastServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        FastServer::new(listener, FastServerOptions::default())
    }

    #[tokio::test]
    async fn conns_destroyed_fires_when_already_empty() {
        let server = test_server().await;
        server.on_conns_destroyed().await;
    }

    #[tokio::test]
    async fn conns_destroyed_fires_on_transition_to_empty() {
        let server = test_server().await;
        let (local, remote) = tokio::io::duplex(1024);
        server.serve_connection(local);
        assert_eq!(server.conn_count(), 1);

        let destroyed = server.on_conns_destroyed();
        drop(remote);
        destroyed.await;
        assert_eq!(server.conn_count(), 0);
    }

    #[tokio::test]
    async fn unregistered_method_gets_error_reply() {
        let server = test_server().await;
        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        let request = FastMessage::data(
            77,
            FastMessageData::new(
                String::from("badmethod"),
                json!(["unused"]),
            ),
        );
        peer.send(request).await.unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.id, 77);
        assert_eq!(reply.status, FastMessageStatus::Error);
        assert_eq!(reply.data.d["name"], json!("FastError"));
        assert_eq!(
            reply.data.d["info"]["fastReason"],
            json!("bad_method")
        );
        assert_eq!(
            reply.data.d["info"]["rpcMethod"],
            json!("badmethod")
        );
    }

    #[tokio::test]
    async fn duplicate_msgid_terminates_connection() {
        let server = test_server().await;
        // A handler that never terminates its request keeps the msgid in
        // flight.
        server.register_rpc_method(
            "hang",
            |_response: FastResponseWriter, _args: Value| async move {},
        );

        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        let request = FastMessage::data(
            5,
            FastMessageData::new(String::from("hang"), json!([])),
        );
        peer.send(request.clone()).await.unwrap();
        peer.send(request).await.unwrap();

        // The server tears the connection down rather than answering.
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn msgid_reuse_after_bad_method_terminates_connection() {
        let server = test_server().await;
        server.register_rpc_method(
            "echo",
            |response: FastResponseWriter, _args: Value| async move {
                response.end(None).await;
            },
        );

        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        peer.send(FastMessage::data(
            77,
            FastMessageData::new(String::from("badmethod"), json!([])),
        ))
        .await
        .unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.status, FastMessageStatus::Error);

        // The bad_method ERROR was msgid 77's terminal message; reusing
        // the id is a protocol violation even with a registered method.
        peer.send(FastMessage::data(
            77,
            FastMessageData::new(String::from("echo"), json!([])),
        ))
        .await
        .unwrap();
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn msgid_reuse_after_end_terminates_connection() {
        let server = test_server().await;
        server.register_rpc_method(
            "echo",
            |response: FastResponseWriter, _args: Value| async move {
                response.end(None).await;
            },
        );

        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        let request = FastMessage::data(
            3,
            FastMessageData::new(String::from("echo"), json!([])),
        );
        peer.send(request.clone()).await.unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.status, FastMessageStatus::End);

        peer.send(request).await.unwrap();
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn dual_accept_server_replies_with_concrete_mode() {
        let server = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            FastServer::new(
                listener,
                FastServerOptions::default()
                    .with_crc_mode(FastCrcMode::V1V2),
            )
        };
        server.register_rpc_method(
            "echo",
            |response: FastResponseWriter, _args: Value| async move {
                response.end(None).await;
            },
        );

        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        // A request that validates under both variants mirrors back as the
        // legacy variant, never as the (unencodable) dual-accept mode.
        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        peer.send(FastMessage::data(
            11,
            FastMessageData::new(String::from("echo"), json!([])),
        ))
        .await
        .unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.status, FastMessageStatus::End);
        assert_eq!(reply.id, 11);
    }

    #[tokio::test]
    async fn non_data_first_message_terminates_connection() {
        let server = test_server().await;
        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        peer.send(FastMessage::end(7, String::from("echo")))
            .await
            .unwrap();

        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn handler_reregistration_replaces() {
        let server = test_server().await;
        server.register_rpc_method("echo", |response: FastResponseWriter, _args: Value| async move {
            response.end(Some(json!("first"))).await;
        });
        server.register_rpc_method("echo", |response: FastResponseWriter, _args: Value| async move {
            response.end(Some(json!("second"))).await;
        });

        let (local, remote) = tokio::io::duplex(8192);
        server.serve_connection(local);

        let mut peer = Framed::new(remote, FastRpc::new(FastCrcMode::V1));
        let request = FastMessage::data(
            1,
            FastMessageData::new(String::from("echo"), json!([])),
        );
        peer.send(request).await.unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.status, FastMessageStatus::End);
        assert_eq!(reply.data.d, json!(["second"]));
    }
}
