// Copyright 2020 Joyent, Inc.

//! One client connection: its handshake state machine, the input loop that
//! reads and dispatches client messages, and the output loop that writes
//! queued server messages in order.
//!
//! Anything may queue a message through the connection's
//! [`ConnectionHandle`]; only the output loop writes to the socket.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use slog::{debug, error, info, o, warn, Logger};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketFactory;
use crate::errors::{CodecError, LifecycleError, MessageInvalid, ProtocolErrorCode};
use crate::manager::Route;
use crate::message::client::ClientHello;
use crate::message::server::FCP_VERSION;
use crate::message::{names, ClientMessage, RequestId, ServerMessage};
use crate::protocol::{FcpCodec, RawMessage};
use crate::request::ClientRequest;
use crate::server::FcpServer;
use crate::session::Session;

/// The shareable side of a connection: its outbound queue, its close
/// signal and its connection-tier requests.
pub struct ConnectionHandle {
    id: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    closed: CancellationToken,
    requests: Mutex<BTreeMap<String, Arc<ClientRequest>>>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(id: &str) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: id.to_string(),
            outbound,
            closed: CancellationToken::new(),
            requests: Mutex::new(BTreeMap::new()),
        };
        (Arc::new(handle), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a message. Returns false once the output loop has gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, Arc<ClientRequest>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, request: Arc<ClientRequest>) -> Result<(), LifecycleError> {
        let mut table = self.table();
        if table.contains_key(&request.identifier) {
            return Err(LifecycleError::collision(request.identifier.clone(), false));
        }
        table.insert(request.identifier.clone(), request);
        Ok(())
    }

    pub fn lookup(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        self.table().get(identifier).cloned()
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        self.table().remove(identifier)
    }

    pub fn requests(&self) -> Vec<Arc<ClientRequest>> {
        self.table().values().cloned().collect()
    }
}

#[derive(Clone, Debug)]
pub enum ConnectionState {
    AwaitingHello,
    Ready(Arc<Session>),
    Closing,
    Closed,
}

/// The reply a lifecycle failure gets. Collisions have their own message;
/// everything else is a non-fatal `ProtocolError`.
pub fn lifecycle_reply(err: &LifecycleError) -> ServerMessage {
    let invalid = match err {
        LifecycleError::IdentifierCollision { identifier, global } => {
            return ServerMessage::IdentifierCollision(RequestId::new(identifier.clone(), *global))
        }
        LifecycleError::NoSuchIdentifier { identifier, global } => {
            MessageInvalid::new(ProtocolErrorCode::NoSuchIdentifier, identifier.clone())
                .for_request(Some(identifier), *global)
        }
        LifecycleError::Invalid(invalid) => invalid.clone(),
        LifecycleError::Persist {
            identifier, global, ..
        } => MessageInvalid::new(ProtocolErrorCode::InternalError, err.to_string())
            .for_request(Some(identifier), *global),
    };
    ServerMessage::protocol_error(&invalid, false)
}

pub struct Connection {
    handle: Arc<ConnectionHandle>,
    server: Arc<FcpServer>,
    state: ConnectionState,
    log: Logger,
}

impl Connection {
    pub fn new(handle: Arc<ConnectionHandle>, server: Arc<FcpServer>, log: &Logger) -> Connection {
        let log = log.new(o!("connection" => handle.id().to_string()));
        Connection {
            handle,
            server,
            state: ConnectionState::AwaitingHello,
            log,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    fn send(&self, msg: ServerMessage) {
        self.handle.send(msg);
    }

    fn protocol_error(&self, invalid: &MessageInvalid, fatal: bool) {
        warn!(self.log, "protocol error"; "error" => %invalid, "fatal" => fatal);
        self.send(ServerMessage::protocol_error(invalid, fatal));
    }

    /// Handles one framed message. Returns false when the connection must
    /// close.
    pub async fn process(&mut self, raw: RawMessage) -> bool {
        let name = raw.name.clone();
        debug!(self.log, "received message"; "name" => &name);
        let parsed = ClientMessage::parse(raw);
        let session = match &self.state {
            ConnectionState::AwaitingHello => None,
            ConnectionState::Ready(session) => Some(Arc::clone(session)),
            ConnectionState::Closing | ConnectionState::Closed => return false,
        };

        match (session, parsed) {
            (None, Ok(ClientMessage::ClientHello(hello))) => {
                self.hello(hello);
                true
            }
            (None, Err(invalid)) if name == names::CLIENT_HELLO => {
                self.protocol_error(&invalid, false);
                true
            }
            (None, _) => {
                let invalid = MessageInvalid::new(
                    ProtocolErrorCode::ClientHelloMustBeFirst,
                    format!("Received {} before ClientHello", name),
                );
                self.protocol_error(&invalid, true);
                false
            }
            (Some(session), Ok(msg)) => self.dispatch(&session, msg).await,
            (Some(_), Err(invalid)) => {
                self.protocol_error(&invalid, false);
                true
            }
        }
    }

    fn hello(&mut self, hello: ClientHello) {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        // Queued before the session is bound so it precedes any request
        // message routed to this connection.
        self.send(ServerMessage::NodeHello {
            node: self.server.config().node_name.clone(),
            version: self.server.config().node_version.clone(),
            connection_identifier: hex::encode(id),
        });

        let session = self.server.registry().register(&hello.name, &self.handle);
        self.log = self.log.new(o!("client" => hello.name.clone()));
        info!(self.log, "client connected";
            "expected_version" => &hello.expected_version,
            "fcp_version" => FCP_VERSION);
        self.server.manager().replay_completed(&session, &self.handle);
        self.state = ConnectionState::Ready(session);
    }

    /// Where a new request with these properties lives.
    fn route_for(&self, session: &Arc<Session>, request: &ClientRequest) -> Route {
        if request.global {
            Route::Session(Arc::clone(self.server.registry().global()))
        } else if request.is_persistent() {
            Route::Session(Arc::clone(session))
        } else {
            Route::Connection(Arc::clone(&self.handle))
        }
    }

    /// Where an existing request is found: the global queue, or this
    /// connection's own requests before the session's.
    fn route_of(&self, session: &Arc<Session>, identifier: &str, global: bool) -> Route {
        if global {
            Route::Session(Arc::clone(self.server.registry().global()))
        } else if self.handle.lookup(identifier).is_some() {
            Route::Connection(Arc::clone(&self.handle))
        } else {
            Route::Session(Arc::clone(session))
        }
    }

    fn submit(&self, session: &Arc<Session>, request: Result<ClientRequest, MessageInvalid>) {
        let request = match request {
            Ok(request) => request,
            Err(invalid) => {
                self.protocol_error(&invalid, false);
                return;
            }
        };
        let route = self.route_for(session, &request);
        if let Err(e) = self.server.manager().submit(request, route, Some(session)) {
            debug!(self.log, "request refused"; "error" => %e);
            self.send(lifecycle_reply(&e));
        }
    }

    /// Persistent uploads spill their payload to disk, so uploads are built
    /// on the blocking pool.
    async fn build_upload<F>(&self, build: F) -> Result<ClientRequest, MessageInvalid>
    where
        F: FnOnce(&BucketFactory) -> Result<ClientRequest, MessageInvalid> + Send + 'static,
    {
        let buckets = self.server.manager().buckets().clone();
        tokio::task::spawn_blocking(move || build(&buckets))
            .await
            .unwrap_or_else(|e| {
                Err(MessageInvalid::new(
                    ProtocolErrorCode::InternalError,
                    e.to_string(),
                ))
            })
    }

    async fn dispatch(&mut self, session: &Arc<Session>, msg: ClientMessage) -> bool {
        let manager = Arc::clone(self.server.manager());
        match msg {
            ClientMessage::ClientHello(_) => {
                let invalid = MessageInvalid::bare(ProtocolErrorCode::NoLateClientHellos);
                self.protocol_error(&invalid, false);
            }
            ClientMessage::ClientGet(get) => {
                let request = ClientRequest::from_get(get, session.name());
                self.submit(session, request);
            }
            ClientMessage::ClientPut(put) => {
                let name = session.name().to_string();
                let request = self
                    .build_upload(move |buckets| ClientRequest::from_put(put, &name, buckets))
                    .await;
                self.submit(session, request);
            }
            ClientMessage::ClientPutComplexDir(dir) => {
                let name = session.name().to_string();
                let max_files = self.server.config().max_files_in_insert;
                let request = self
                    .build_upload(move |buckets| {
                        ClientRequest::from_put_dir(dir, &name, buckets, max_files)
                    })
                    .await;
                self.submit(session, request);
            }
            ClientMessage::GetRequestStatus {
                identifier,
                global,
                only_data,
            } => {
                let route = self.route_of(session, &identifier, global);
                match manager.status(&route, &identifier, global, only_data) {
                    Ok(msgs) => msgs.into_iter().for_each(|m| self.send(m)),
                    Err(e) => self.send(lifecycle_reply(&e)),
                }
            }
            ClientMessage::ListPersistentRequests => {
                let global = self.server.registry().global();
                let watching = global.watch_mask(session.name()).is_some();
                let msgs = manager.list_pending(
                    &self.handle,
                    session,
                    if watching { Some(global.as_ref()) } else { None },
                );
                msgs.into_iter().for_each(|m| self.send(m));
            }
            ClientMessage::ModifyPersistentRequest {
                identifier,
                global,
                client_token,
                priority,
            } => {
                let route = self.route_of(session, &identifier, global);
                if let Err(e) = manager.modify(&route, &identifier, global, client_token, priority) {
                    self.send(lifecycle_reply(&e));
                }
            }
            ClientMessage::RemoveRequest { identifier, global } => {
                let route = self.route_of(session, &identifier, global);
                if let Err(e) = manager.remove(&route, &identifier, global) {
                    self.send(lifecycle_reply(&e));
                }
            }
            ClientMessage::WatchGlobal {
                enabled,
                verbosity_mask,
            } => {
                let global = self.server.registry().global();
                if enabled {
                    let already = global.watch_mask(session.name()).is_some();
                    global.add_watcher(session, verbosity_mask);
                    if !already {
                        manager.replay_completed(global, &self.handle);
                    }
                } else {
                    global.remove_watcher(session.name());
                }
                debug!(self.log, "watch global"; "enabled" => enabled, "mask" => verbosity_mask);
            }
            ClientMessage::Disconnect => {
                debug!(self.log, "client disconnected");
                return false;
            }
            ClientMessage::Void => {}
        }
        true
    }

    /// Reads and processes messages until the peer goes away, a fatal error
    /// occurs, or the connection is closed from outside.
    pub async fn input_loop(&mut self, mut reader: FramedRead<OwnedReadHalf, FcpCodec>) {
        let closed = self.handle.close_token();
        let shutdown = self.server.shutdown_token();
        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    debug!(self.log, "connection closed externally");
                    break;
                }
                _ = shutdown.cancelled() => {
                    let invalid = MessageInvalid::bare(ProtocolErrorCode::ShuttingDown);
                    self.protocol_error(&invalid, true);
                    break;
                }
                frame = reader.next() => match frame {
                    Some(Ok(raw)) => {
                        if !self.process(raw).await {
                            break;
                        }
                    }
                    Some(Err(CodecError::Io(e))) => {
                        error!(self.log, "read failed"; "error" => %e);
                        break;
                    }
                    Some(Err(e)) => {
                        let invalid = match e {
                            CodecError::PayloadLength(invalid) => invalid,
                            other => MessageInvalid::new(
                                ProtocolErrorCode::MessageParseError,
                                other.to_string(),
                            ),
                        };
                        self.protocol_error(&invalid, true);
                        break;
                    }
                    None => {
                        debug!(self.log, "peer closed connection");
                        break;
                    }
                }
            }
        }
    }

    /// Moves to Closing: cancels this connection's requests and unbinds it
    /// from its session.
    pub fn begin_close(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Closing);
        self.server.manager().abandon_connection(&self.handle);
        if let ConnectionState::Ready(session) = state {
            self.server.registry().release(&session, self.handle.id());
        }
        self.handle.close();
    }

    pub fn finish_close(&mut self) {
        self.state = ConnectionState::Closed;
        info!(self.log, "connection closed");
    }
}

/// A message that cannot be put on the wire is dropped and logged; the
/// connection carries on with the next one.
fn render(msg: &ServerMessage, log: &Logger) -> Option<RawMessage> {
    match msg.to_raw() {
        Ok(raw) => Some(raw),
        Err(e) => {
            error!(log, "dropping unrenderable message";
                "message" => msg.name(),
                "identifier" => msg.identifier(),
                "error" => %e);
            None
        }
    }
}

/// Writes queued messages in order until the connection closes, then
/// flushes whatever is still queued and shuts the write side down.
pub async fn output_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FcpCodec>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    closed: CancellationToken,
    log: Logger,
) {
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let raw = match render(&msg, &log) {
                        Some(raw) => raw,
                        None => continue,
                    };
                    if let Err(e) = writer.send(raw).await {
                        error!(log, "write failed"; "error" => %e);
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }

    while let Ok(msg) = outbound.try_recv() {
        let raw = match render(&msg, &log) {
            Some(raw) => raw,
            None => continue,
        };
        if let Err(e) = writer.send(raw).await {
            debug!(log, "dropping queued messages after write failure"; "error" => %e);
            break;
        }
    }
    let _ = writer.get_mut().shutdown().await;
}

/// Runs a connection to completion. The socket is fully closed only after
/// both the input and the output side have finished.
pub async fn run(stream: TcpStream, server: Arc<FcpServer>, log: &Logger) {
    let limits = server.config().frame_limits();
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, FcpCodec::new(limits));
    let writer = FramedWrite::new(write_half, FcpCodec::new(limits));

    let (handle, outbound) = ConnectionHandle::new(&server.next_connection_id());
    let mut conn = Connection::new(Arc::clone(&handle), server, log);
    let output = tokio::spawn(output_loop(
        writer,
        outbound,
        handle.close_token(),
        conn.log.clone(),
    ));

    conn.input_loop(reader).await;
    conn.begin_close();
    if let Err(e) = output.await {
        error!(conn.log, "output loop failed"; "error" => %e);
    }
    conn.finish_close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_replies() {
        let reply = lifecycle_reply(&LifecycleError::collision("job1", false));
        assert_eq!(
            reply,
            ServerMessage::IdentifierCollision(RequestId::new("job1", false))
        );

        match lifecycle_reply(&LifecycleError::no_such_identifier("x", true)) {
            ServerMessage::ProtocolError {
                code,
                fatal,
                identifier,
                global,
                ..
            } => {
                assert_eq!(code, ProtocolErrorCode::NoSuchIdentifier);
                assert!(!fatal);
                assert_eq!(identifier.as_deref(), Some("x"));
                assert!(global);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn handle_queue_and_close() {
        let (handle, mut rx) = ConnectionHandle::new("c1");
        assert!(handle.lookup("a").is_none());
        assert!(handle.requests().is_empty());
        assert!(handle.send(ServerMessage::EndListPersistentRequests));
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::EndListPersistentRequests));

        handle.close();
        assert!(handle.is_closed());
        drop(rx);
        assert!(!handle.send(ServerMessage::EndListPersistentRequests));
    }

    #[tokio::test]
    async fn unrenderable_message_is_skipped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let (_read, write) = server_side.into_split();
        let writer = FramedWrite::new(write, FcpCodec::new(Default::default()));

        let (tx, rx) = mpsc::unbounded_channel();
        let bad = MessageInvalid::new(ProtocolErrorCode::InternalError, "one\ntwo");
        tx.send(ServerMessage::protocol_error(&bad, false)).unwrap();
        tx.send(ServerMessage::EndListPersistentRequests).unwrap();
        drop(tx);
        let log = Logger::root(slog::Discard, o!());
        output_loop(writer, rx, CancellationToken::new(), log).await;

        let mut reader = FramedRead::new(peer, FcpCodec::new(Default::default()));
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.name, names::END_LIST_PERSISTENT_REQUESTS);
        assert!(reader.next().await.is_none());
    }
}
