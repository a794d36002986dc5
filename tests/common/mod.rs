// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;

use fcp_server::client::FcpClient;
use fcp_server::config::ServerConfig;
use fcp_server::engine::{
    Engine, EngineError, FetchJob, InsertJob, JobHandle, JobReporter, TokenControl,
};
use fcp_server::fieldset::FieldSet;
use fcp_server::protocol::RawMessage;
use fcp_server::server::{self, FcpServer};

/// Engine that does nothing on its own; tests drive each job through the
/// reporter recorded under the job's identifier.
#[derive(Default)]
pub struct ScriptedEngine {
    jobs: Mutex<HashMap<String, JobReporter>>,
    controls: Mutex<HashMap<String, Arc<TokenControl>>>,
}

impl ScriptedEngine {
    fn handle(&self, identifier: &str, priority: u8) -> JobHandle {
        let (reporter, events) = JobReporter::channel();
        let control = Arc::new(TokenControl::new(priority));
        self.jobs
            .lock()
            .unwrap()
            .insert(identifier.to_string(), reporter);
        self.controls
            .lock()
            .unwrap()
            .insert(identifier.to_string(), Arc::clone(&control));
        JobHandle { events, control }
    }

    /// Whether the server has cancelled the job started for `identifier`.
    pub fn cancelled(&self, identifier: &str) -> bool {
        self.controls
            .lock()
            .unwrap()
            .get(identifier)
            .map(|control| control.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn forget(&self, identifier: &str) {
        self.jobs.lock().unwrap().remove(identifier);
    }

    /// Waits up to two seconds for the server to start a job for
    /// `identifier`.
    pub async fn reporter(&self, identifier: &str) -> JobReporter {
        for _ in 0..200 {
            if let Some(reporter) = self.jobs.lock().unwrap().get(identifier) {
                return reporter.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no job started for {}", identifier);
    }
}

impl Engine for ScriptedEngine {
    fn fetch(&self, job: FetchJob) -> Result<JobHandle, EngineError> {
        Ok(self.handle(&job.identifier, job.priority))
    }

    fn insert(&self, job: InsertJob) -> Result<JobHandle, EngineError> {
        Ok(self.handle(&job.identifier, job.priority))
    }
}

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn test_config(dir: &Path, persistence_enabled: bool) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        persistent_requests_file: dir.join("persistent.dat"),
        persistence_enabled,
        temp_dir: dir.to_path_buf(),
        ..ServerConfig::default()
    }
}

#[tokio::main]
async fn run_server(
    config: ServerConfig,
    engine: Arc<ScriptedEngine>,
    ready: mpsc::Sender<(SocketAddr, Arc<FcpServer>)>,
) {
    let log = test_logger();
    let listener = TcpListener::bind(&config.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fcp = FcpServer::new(config, engine, Some(&log)).unwrap();
    fcp.load_persistent();
    fcp.spawn_persister();
    ready.send((addr, Arc::clone(&fcp))).unwrap();
    server::listen(listener, fcp).await.unwrap();
}

/// Starts a server on its own thread and runtime, returning once it is
/// accepting connections. `FcpServer::shutdown` stops it.
pub fn start_server(
    config: ServerConfig,
    engine: Arc<ScriptedEngine>,
) -> (SocketAddr, Arc<FcpServer>) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || run_server(config, engine, tx));
    rx.recv_timeout(Duration::from_secs(5))
        .expect("server failed to start")
}

pub async fn connect(addr: &SocketAddr, name: &str) -> FcpClient {
    let mut client = FcpClient::connect(addr).await.unwrap();
    let hello = client.hello(name).await.unwrap();
    assert!(hello.get("ConnectionIdentifier").is_some());
    client
}

pub fn fields(pairs: &[(&str, &str)]) -> FieldSet {
    let mut fs = FieldSet::new();
    for (key, value) in pairs {
        fs.put_single(key, value).unwrap();
    }
    fs
}

pub async fn send(client: &mut FcpClient, name: &str, pairs: &[(&str, &str)]) {
    client.send_message(name, fields(pairs), None).await.unwrap();
}

pub async fn send_with_data(
    client: &mut FcpClient,
    name: &str,
    pairs: &[(&str, &str)],
    data: &'static [u8],
) {
    client
        .send_message(name, fields(pairs), Some(Bytes::from_static(data)))
        .await
        .unwrap();
}

/// Reads until a message called `name` arrives, returning everything read.
pub async fn until(client: &mut FcpClient, name: &str) -> Vec<RawMessage> {
    let wanted = name.to_string();
    tokio::time::timeout(
        Duration::from_secs(5),
        client.receive_until(move |msg| msg.name == wanted),
    )
    .await
    .expect("timed out waiting for message")
    .unwrap()
}

/// Upload spill files left in `dir`.
pub fn spilled_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("fcp-bucket-"))
        .collect()
}

pub fn names(msgs: &[RawMessage]) -> Vec<&str> {
    msgs.iter().map(|m| m.name.as_str()).collect()
}
