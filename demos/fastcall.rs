// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;

use clap::{Arg, ArgMatches, Command};
use serde_json::Value;
use tokio::net::TcpStream;

use fast_rpc::client::{FastClient, FastClientOptions};
use fast_rpc::crc::FastCrcMode;

static APP: &str = "fastcall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts(app: String) -> ArgMatches {
    Command::new(app)
        .about("Command-line tool for making a Fast RPC method call")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("host")
                .help("DNS name or IP address for remote server")
                .long("host"),
        )
        .arg(
            Arg::new("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short('p')
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short('m')
                .required(true),
        )
        .arg(
            Arg::new("args")
                .help("JSON-encoded arguments for RPC method call")
                .long("args")
                .required(true),
        )
        .arg(
            Arg::new("crc_v2")
                .help("Checksum messages with the corrected CRC16 variant")
                .long("crc-v2")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| String::from(DEFAULT_HOST));
    let port = matches
        .get_one::<u32>("port")
        .copied()
        .unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: {}",
                e
            );
            process::exit(1)
        });
    let method = matches
        .get_one::<String>("method")
        .cloned()
        .unwrap_or_else(|| {
            eprintln!("Failed to parse method argument as String");
            process::exit(1)
        });
    let args: Value = matches
        .get_one::<String>("args")
        .map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|e| {
                eprintln!("Failed to parse args as JSON: {}", e);
                process::exit(1)
            })
        })
        .unwrap_or(Value::Array(vec![]));

    let crc_mode = if matches.get_flag("crc_v2") {
        FastCrcMode::V2
    } else {
        FastCrcMode::V1
    };

    let stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let options = FastClientOptions::default().with_crc_mode(crc_mode);
    let client = FastClient::new(stream, options).unwrap_or_else(|e| {
        eprintln!("Failed to create client: {}", e);
        process::exit(1)
    });

    let mut request = match client.rpc(&method, args).await {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    };

    while let Some(next) = request.recv().await {
        match next {
            Ok(value) => println!("{}", value),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1)
            }
        }
    }
}
