// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{o, Drain, Logger};
use tokio::net::TcpListener;

use fast_rpc::crc::FastCrcMode;
use fast_rpc::protocol::FastMessageServerError;
use fast_rpc::server::{FastResponseWriter, FastServer, FastServerOptions};

#[derive(Serialize, Deserialize)]
struct YesPayload {
    value: Value,
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: u64,
    iso8601: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct FastBenchPayload {
    echo: Value,
    delay: Option<u64>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let now_millis = now.as_secs() * 1_000 + u64::from(now.subsec_millis());
        DatePayload {
            timestamp: now_millis,
            iso8601: Utc::now(),
        }
    }
}

fn handler_error(msg: &str) -> FastMessageServerError {
    FastMessageServerError::new("FastError", msg)
}

async fn date_handler(response: FastResponseWriter, _args: Value) {
    match serde_json::to_value(DatePayload::new()) {
        Ok(date_payload) => {
            response.write(date_payload).await;
            response.end(None).await;
        }
        Err(_) => {
            response
                .fail(handler_error(
                    "Failed to construct payload for date function",
                ))
                .await;
        }
    }
}

async fn echo_handler(response: FastResponseWriter, args: Value) {
    if let Value::Array(items) = args {
        for item in items {
            response.write(item).await;
        }
        response.end(None).await;
    } else {
        response.fail(handler_error("Expected JSON array")).await;
    }
}

async fn yes_handler(response: FastResponseWriter, args: Value) {
    let payloads: Result<Vec<YesPayload>, _> = serde_json::from_value(args);
    match payloads {
        Ok(payloads) if payloads.len() == 1 => {
            for _i in 0..payloads[0].count {
                response.write(payloads[0].value.clone()).await;
            }
            response.end(None).await;
        }
        Ok(_) => {
            response
                .fail(handler_error(
                    "Expected JSON array with a single element",
                ))
                .await;
        }
        Err(_) => {
            response
                .fail(handler_error(
                    "Failed to parse JSON data as payload for yes function",
                ))
                .await;
        }
    }
}

async fn fastbench_handler(response: FastResponseWriter, args: Value) {
    let payloads: Result<Vec<FastBenchPayload>, _> =
        serde_json::from_value(args);
    match payloads {
        Ok(payloads) if payloads.len() == 1 => {
            if let Some(delay) = payloads[0].delay {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match payloads[0].echo.as_array() {
                Some(echo_payloads) => {
                    for i in echo_payloads {
                        response.write(json!({ "value": i.clone() })).await;
                    }
                    response.end(None).await;
                }
                None => {
                    response
                        .fail(handler_error("Expected JSON array"))
                        .await;
                }
            }
        }
        Ok(_) => {
            response
                .fail(handler_error(
                    "Expected JSON array with a single element",
                ))
                .await;
        }
        Err(_) => {
            response
                .fail(handler_error(
                    "Failed to parse JSON data as payload for fastbench \
                     function",
                ))
                .await;
        }
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => env!("CARGO_PKG_VERSION")),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap();

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");

    let options = FastServerOptions::default()
        .with_crc_mode(FastCrcMode::V1V2)
        .with_log(root_log);
    let server = FastServer::new(listener, options);

    server.register_rpc_method("date", date_handler);
    server.register_rpc_method("echo", echo_handler);
    server.register_rpc_method("yes", yes_handler);
    server.register_rpc_method("fastbench", fastbench_handler);

    server.run().await.expect("server failed");
}
