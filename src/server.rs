/*
 * Copyright 2020 Joyent, Inc.
 */

//! The server context shared by every connection, and the tasks that run
//! it: the accept loop, one task per connection and the persister.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketFactory;
use crate::config::ServerConfig;
use crate::connection;
use crate::engine::Engine;
use crate::manager::RequestManager;
use crate::session::SessionRegistry;
use crate::store::{DurableStore, FileStore, StoreError};

/// Everything a connection needs from the server. The global session is
/// owned here, through the registry, and reached by every connection from
/// this context.
pub struct FcpServer {
    config: ServerConfig,
    registry: SessionRegistry,
    manager: Arc<RequestManager>,
    shutdown: CancellationToken,
    next_connection: AtomicU64,
    log: Logger,
}

impl FcpServer {
    /// Builds a server, opening the FOREVER store from
    /// `config.persistent_requests_file` when persistence is enabled.
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn Engine>,
        log: Option<&Logger>,
    ) -> Result<Arc<FcpServer>, StoreError> {
        let store: Option<Arc<dyn DurableStore>> = if config.persistence_enabled {
            Some(Arc::new(FileStore::open(&config.persistent_requests_file, log)?))
        } else {
            None
        };
        Ok(FcpServer::with_store(config, engine, store, log))
    }

    pub fn with_store(
        config: ServerConfig,
        engine: Arc<dyn Engine>,
        store: Option<Arc<dyn DurableStore>>,
        log: Option<&Logger>,
    ) -> Arc<FcpServer> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let buckets = BucketFactory::new(config.temp_dir.clone());
        let manager = RequestManager::new(
            engine,
            store,
            buckets,
            Some(&log.new(o!("component" => "manager"))),
        );
        Arc::new(FcpServer {
            registry: SessionRegistry::new(Some(&log)),
            manager: Arc::new(manager),
            shutdown: CancellationToken::new(),
            next_connection: AtomicU64::new(1),
            config,
            log,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.manager
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn next_connection_id(&self) -> String {
        self.next_connection.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Restores FOREVER requests from the store and restarts the unfinished
    /// ones. Must run inside the runtime since restarted jobs spawn tasks.
    pub fn load_persistent(&self) -> usize {
        self.manager.load_persistent(&self.registry)
    }

    /// Writes the FOREVER store when it has changed, on every tick and
    /// whenever a change asks for it. The writes run on the blocking pool.
    pub fn spawn_persister(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.config.persistence_interval());
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => break,
                    _ = ticker.tick() => (),
                    _ = server.manager.flush_requested() => (),
                }
                match server.manager.flush_in_background().await {
                    Ok(true) => debug!(server.log, "flushed persistent requests"),
                    Ok(false) => (),
                    Err(e) => warn!(server.log, "persistent request flush failed"; "error" => %e),
                }
            }
        })
    }

    /// Tells every connection to close and writes the FOREVER store.
    pub fn shutdown(&self) {
        info!(self.log, "shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.manager.force_flush() {
            error!(self.log, "final flush failed"; "error" => %e);
        }
    }
}

/// Runs one client connection to completion.
pub async fn make_task(stream: TcpStream, server: Arc<FcpServer>, log: Option<&Logger>) {
    let log = log.cloned().unwrap_or_else(|| server.log.clone());
    if let Ok(peer) = stream.peer_addr() {
        debug!(log, "accepted connection"; "peer" => %peer);
    }
    connection::run(stream, server, &log).await;
}

/// Accepts connections until the server shuts down.
pub async fn listen(listener: TcpListener, server: Arc<FcpServer>) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(server.log, "listening for FCP connections"; "address" => %addr);
    }
    let shutdown = server.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        let log = server.log.clone();
                        make_task(stream, server, Some(&log)).await;
                    });
                }
                Err(e) => {
                    error!(server.log, "failed to accept socket"; "error" => %e);
                }
            },
        }
    }
}
