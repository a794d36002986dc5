// Copyright 2020 Joyent, Inc.

use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;

use fcp_server::config::ServerConfig;
use fcp_server::engine::MemoryEngine;
use fcp_server::server::{self, FcpServer};

static APP: &'static str = "fcpd";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("FCP server backed by an in-memory content engine")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("JSON configuration file")
                .long("config")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:9481)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("persistent_file")
                .help("File holding persistent requests")
                .long("persistent-file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("no_persistence")
                .help("Refuse requests with Persistence=forever")
                .long("no-persistence")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("interval")
                .help("Milliseconds between flushes of the persistent file")
                .long("interval")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log at debug level")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn load_config(matches: &ArgMatches) -> ServerConfig {
    let mut config = match matches.value_of("config") {
        Some(path) => ServerConfig::from_file(Path::new(path)).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {}", path, e);
            process::exit(1)
        }),
        None => ServerConfig::default(),
    };
    if let Some(address) = matches.value_of("address") {
        config.bind_address = address.to_string();
    }
    if let Some(file) = matches.value_of("persistent_file") {
        config.persistent_requests_file = file.into();
    }
    if matches.is_present("no_persistence") {
        config.persistence_enabled = false;
    }
    if matches.is_present("interval") {
        config.persistence_interval_ms =
            value_t!(matches, "interval", u64).unwrap_or_else(|e| e.exit());
    }
    config
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Info
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let config = load_config(&matches);
    let engine = Arc::new(MemoryEngine::new(Some(&root_log)));
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .unwrap_or_else(|e| {
            error!(root_log, "failed to bind"; "address" => &config.bind_address, "error" => %e);
            process::exit(1)
        });
    let fcp = FcpServer::new(config, engine, Some(&root_log)).unwrap_or_else(|e| {
        error!(root_log, "failed to open persistent requests"; "error" => %e);
        process::exit(1)
    });

    fcp.load_persistent();
    let persister = fcp.spawn_persister();

    let signal_server = Arc::clone(&fcp);
    let signal_log = root_log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(signal_log, "interrupted");
            signal_server.shutdown();
        }
    });

    if let Err(e) = server::listen(listener, Arc::clone(&fcp)).await {
        error!(root_log, "accept loop failed"; "error" => %e);
    }
    let _ = persister.await;
}
