// Copyright 2020 Joyent, Inc.

use std::fs;
use std::net::SocketAddr;
use std::process;

use bytes::Bytes;
use clap::{crate_version, value_t, App, Arg, ArgMatches};

use fcp_server::client::FcpClient;
use fcp_server::fieldset::FieldSet;
use fcp_server::protocol::RawMessage;

static APP: &'static str = "fcpcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 9481;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for sending one FCP message")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 9481)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("name")
                .help("Client name sent in ClientHello")
                .long("name")
                .short("n")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("message")
                .help("FCP message type, e.g. ClientGet")
                .long("message")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("field")
                .help("Message field as Key=Value; may be repeated")
                .long("field")
                .short("f")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("data")
                .help("File whose contents are sent as the message payload")
                .long("data")
                .short("d")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("count")
                .help("Stop after this many replies")
                .long("count")
                .short("c")
                .takes_value(true),
        )
        .get_matches()
}

fn print_message(msg: &RawMessage) {
    print!("{}\n{}", msg.name, msg.fields.serialize());
    match &msg.payload {
        Some(payload) => println!("Data ({} bytes)", payload.len()),
        None => println!("End"),
    }
}

fn is_terminal(name: &str) -> bool {
    match name {
        "DataFound" | "GetFailed" | "PutSuccessful" | "PutFailed"
        | "IdentifierCollision" | "ProtocolError" | "EndListPersistentRequests"
        | "PersistentRequestRemoved" | "PersistentRequestModified" => true,
        _ => false,
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let name = matches.value_of("name").unwrap_or(APP).to_string();
    let message = matches.value_of("message").unwrap_or_default().to_string();
    let count = value_t!(matches, "count", usize).ok();

    let mut fields = FieldSet::new();
    for field in matches.values_of("field").into_iter().flatten() {
        let mut parts = field.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_else(|| {
            eprintln!("Field {} is not Key=Value", field);
            process::exit(1)
        });
        if let Err(e) = fields.put_single(key, value) {
            eprintln!("Bad field {}: {}", field, e);
            process::exit(1)
        }
    }
    let identifier = fields.get("Identifier").map(String::from);
    let payload = matches.value_of("data").map(|path| {
        fs::read(path).map(Bytes::from).unwrap_or_else(|e| {
            eprintln!("Failed to read {}: {}", path, e);
            process::exit(1)
        })
    });

    let mut client = FcpClient::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let result = async {
        let hello = client.hello(&name).await?;
        print_message(&hello);
        client.send_message(&message, fields, payload).await?;

        let mut received = 0;
        while let Some(msg) = client.receive().await? {
            print_message(&msg);
            received += 1;
            let ours = identifier.is_none() || msg.get("Identifier") == identifier.as_deref();
            if count.map_or(ours && is_terminal(&msg.name), |c| received >= c) {
                break;
            }
        }
        client.close().await
    }
    .await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }
}
