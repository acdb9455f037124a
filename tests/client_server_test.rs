// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use fast_rpc::client::{FastClient, FastClientOptions};
use fast_rpc::crc::FastCrcMode;
use fast_rpc::error::{FastReason, FastRequestCause, FastRequestError};
use fast_rpc::protocol::{
    FastMessage, FastMessageData, FastMessageServerError, FastMessageStatus,
    FastRpc,
};
use fast_rpc::server::{FastResponseWriter, FastServer, FastServerOptions};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!(),
    )
}

/// Starts a server with the demo handlers registered and its accept loop
/// running.
async fn demo_server(crc_mode: FastCrcMode) -> (SocketAddr, Arc<FastServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let options = FastServerOptions::default()
        .with_crc_mode(crc_mode)
        .with_log(test_log());
    let server = Arc::new(FastServer::new(listener, options));

    server.register_rpc_method(
        "echo",
        |response: FastResponseWriter, args: Value| async move {
            if let Value::Array(items) = args {
                for item in items {
                    response.write(json!({ "value": item })).await;
                }
            }
            response.end(None).await;
        },
    );

    server.register_rpc_method(
        "flaky",
        |response: FastResponseWriter, _args: Value| async move {
            for seq in 0..5 {
                response.write(json!({ "seq": seq })).await;
            }
            let err = FastMessageServerError::new(
                "MyStupidError",
                "the server ate my response",
            )
            .with_info(json!({ "attempt": 1, "recoverable": false }))
            .with_context(json!({ "host": "lava.example.com" }));
            response.fail(err).await;
        },
    );

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });

    (addr, server)
}

async fn connect_client(
    addr: SocketAddr,
    crc_mode: FastCrcMode,
) -> FastClient {
    let stream = TcpStream::connect(addr).await.unwrap();
    let options = FastClientOptions::default()
        .with_crc_mode(crc_mode)
        .with_log(test_log());
    FastClient::new(stream, options).unwrap()
}

async fn collect(
    client: &FastClient,
    method: &str,
    args: Value,
) -> (Vec<Value>, Option<FastRequestError>) {
    let mut stream = client.rpc(method, args).await.unwrap();
    let mut items = Vec::new();
    while let Some(next) = stream.recv().await {
        match next {
            Ok(value) => items.push(value),
            Err(err) => return (items, Some(err)),
        }
    }
    (items, None)
}

#[tokio::test]
async fn echo_roundtrip() {
    let (addr, _server) = demo_server(FastCrcMode::V1).await;
    let client = connect_client(addr, FastCrcMode::V1).await;

    let (items, err) =
        collect(&client, "echo", json!(["lafayette"])).await;
    assert!(err.is_none());
    assert_eq!(items, vec![json!({ "value": "lafayette" })]);
}

#[tokio::test]
async fn multi_message_stream_preserves_order() {
    // A raw peer can produce wire patterns the response writer does not:
    // DATA messages carrying 0, 1, 2, 3, and 4 values respectively,
    // followed by an empty END.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FastRpc::new(FastCrcMode::V2));
        let request = framed.next().await.unwrap().unwrap();
        assert_eq!(request.status, FastMessageStatus::Data);
        let msgid = request.id;
        let method = request.data.m.name;

        let batches: [&[i64]; 5] =
            [&[], &[0], &[1, 2], &[3, 4, 5], &[6, 7, 8, 9]];
        for batch in batches {
            let msg = FastMessage::data(
                msgid,
                FastMessageData::new(method.clone(), json!(batch)),
            );
            framed.send(msg).await.unwrap();
        }
        framed
            .send(FastMessage::end(msgid, method))
            .await
            .unwrap();
        while let Some(Ok(_)) = framed.next().await {}
    });

    let client = connect_client(addr, FastCrcMode::V2).await;
    let (items, err) = collect(&client, "counting", json!([])).await;
    assert!(err.is_none());
    let expected: Vec<Value> = (0..10).map(|i| json!(i)).collect();
    assert_eq!(items, expected);
}

#[tokio::test]
async fn server_error_after_partial_data() {
    let (addr, _server) = demo_server(FastCrcMode::V1).await;
    let client = connect_client(addr, FastCrcMode::V1).await;

    let (items, err) = collect(&client, "flaky", json!([])).await;
    assert_eq!(items.len(), 5);
    for (seq, item) in items.iter().enumerate() {
        assert_eq!(*item, json!({ "seq": seq }));
    }

    let err = err.expect("request must fail");
    let server_err = err.server_error().expect("server-reported failure");
    assert_eq!(server_err.name, "MyStupidError");
    assert_eq!(server_err.message, "the server ate my response");
    assert_eq!(
        server_err.info,
        Some(json!({ "attempt": 1, "recoverable": false }))
    );
    assert_eq!(
        server_err.context,
        Some(json!({ "host": "lava.example.com" }))
    );

    // The failure is a three-layer chain: request error wrapping a server
    // error wrapping the handler's error.
    use std::error::Error as StdError;
    let server_layer = err.source().expect("server layer");
    let original = server_layer.source().expect("original layer");
    assert!(original.to_string().contains("MyStupidError"));
}

#[tokio::test]
async fn unknown_method_fails_without_data() {
    let (addr, _server) = demo_server(FastCrcMode::V1).await;
    let client = connect_client(addr, FastCrcMode::V1).await;

    let (items, err) = collect(&client, "badmethod", json!([])).await;
    assert!(items.is_empty());

    let err = err.expect("request must fail");
    let server_err = err.server_error().expect("server-reported failure");
    assert_eq!(server_err.name, "FastError");
    let info = server_err.info.as_ref().expect("error info");
    assert_eq!(info["fastReason"], json!("bad_method"));
    assert_eq!(info["rpcMethod"], json!("badmethod"));
}

#[tokio::test]
async fn connection_protocol_error_fans_out() {
    // Raw server that accepts three requests and then responds with a
    // message for a msgid that was never issued.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FastRpc::new(FastCrcMode::V2));
        for _ in 0..3 {
            framed.next().await.unwrap().unwrap();
        }
        let bogus = FastMessage::data(
            777_777,
            FastMessageData::new(String::from("echo"), json!([])),
        );
        framed.send(bogus).await.unwrap();
        while let Some(Ok(_)) = framed.next().await {}
    });

    let client_a = connect_client(addr, FastCrcMode::V2).await;
    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(client_a.rpc("echo", json!(["x"])).await.unwrap());
    }

    // An unrelated client on its own connection is unaffected.
    let (echo_addr, _server) = demo_server(FastCrcMode::V1).await;
    let client_b = connect_client(echo_addr, FastCrcMode::V1).await;

    for mut stream in streams {
        match stream.recv().await {
            Some(Err(err)) => match err.cause {
                FastRequestCause::Connection(cause) => {
                    assert_eq!(
                        cause.reason(),
                        Some(FastReason::UnknownMsgid)
                    );
                }
                other => panic!("expected connection cause, got {:?}", other),
            },
            other => panic!("expected failure, got {:?}", other.is_some()),
        }
    }

    let client_err = client_a.closed().await.expect("client-level error");
    assert_eq!(client_err.reason(), Some(FastReason::UnknownMsgid));

    let (items, err) = collect(&client_b, "echo", json!(["ok"])).await;
    assert!(err.is_none());
    assert_eq!(items, vec![json!({ "value": "ok" })]);
}

#[tokio::test]
async fn dual_accept_server_with_mixed_clients() {
    let (addr, _server) = demo_server(FastCrcMode::V1V2).await;

    let legacy = connect_client(addr, FastCrcMode::V1).await;
    let corrected = connect_client(addr, FastCrcMode::V2).await;

    let (items, err) = collect(&legacy, "echo", json!(["old"])).await;
    assert!(err.is_none());
    assert_eq!(items, vec![json!({ "value": "old" })]);

    let (items, err) = collect(&corrected, "echo", json!(["new"])).await;
    assert!(err.is_none());
    assert_eq!(items, vec![json!({ "value": "new" })]);
}

#[tokio::test]
async fn dual_accept_server_mirrors_decoded_mode() {
    let (addr, _server) = demo_server(FastCrcMode::V1V2).await;

    // Speak raw protocol with a dual-accept codec so the decoded variant
    // of each reply is visible, but checksum the request with V2 alone.
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut peer = Framed::new(stream, FastRpc::new(FastCrcMode::V1V2));
    let request = FastMessage::data(
        9,
        FastMessageData::new(String::from("echo"), json!(["mirror"])),
    )
    .with_crc_mode(FastCrcMode::V2);
    peer.send(request).await.unwrap();

    // A mirrored reply is checksummed with V2 directly, so its CRC should
    // validate under V2 but not under the legacy variant.
    let reply = peer.next().await.unwrap().unwrap();
    assert_eq!(reply.status, FastMessageStatus::Data);
    assert_eq!(reply.crc_mode, Some(FastCrcMode::V2));

    let fin = peer.next().await.unwrap().unwrap();
    assert_eq!(fin.status, FastMessageStatus::End);
    assert_eq!(fin.crc_mode, Some(FastCrcMode::V2));
}

#[tokio::test]
async fn detach_fails_inflight_requests() {
    // Raw server that reads the request and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FastRpc::new(FastCrcMode::V2));
        while let Some(Ok(_)) = framed.next().await {}
    });

    let client = connect_client(addr, FastCrcMode::V2).await;
    let mut stream = client.rpc("echo", json!([])).await.unwrap();

    client.detach().await;

    match stream.recv().await {
        Some(Err(err)) => match err.cause {
            FastRequestCause::Connection(cause) => {
                assert!(cause.to_string().contains("detached"));
            }
            other => panic!("expected connection cause, got {:?}", other),
        },
        other => panic!("expected failure, got {:?}", other.is_some()),
    }

    // A detach is a clean shutdown from the connection's point of view.
    assert!(client.closed().await.is_none());

    // New requests are refused.
    assert!(client.rpc("echo", json!([])).await.is_err());
}

#[tokio::test]
async fn conns_destroyed_after_close() {
    let (addr, server) = demo_server(FastCrcMode::V1).await;
    let client = connect_client(addr, FastCrcMode::V1).await;

    let (items, err) = collect(&client, "echo", json!(["bye"])).await;
    assert!(err.is_none());
    assert_eq!(items.len(), 1);

    server.close();
    let destroyed = server.on_conns_destroyed();
    client.detach().await;
    drop(client);
    destroyed.await;
    assert_eq!(server.conn_count(), 0);
}

#[tokio::test]
async fn buffered_rpc_enforces_bound() {
    let (addr, _server) = demo_server(FastCrcMode::V1).await;
    let client = connect_client(addr, FastCrcMode::V1).await;

    let items = client
        .rpc_buffered("echo", json!(["a", "b", "c"]), 8)
        .await
        .unwrap();
    assert_eq!(items.len(), 3);

    let err = client
        .rpc_buffered("echo", json!(["a", "b", "c"]), 2)
        .await
        .unwrap_err();
    match err.cause {
        FastRequestCause::BufferExceeded(max) => assert_eq!(max, 2),
        other => panic!("expected buffer bound failure, got {:?}", other),
    }
}
