// Copyright 2020 Joyent, Inc.

//! Sessions and the registry that binds them to connections.
//!
//! A [`Session`] is the server-side identity of a client name. It outlives
//! the connections that attach to it and owns the client's persistent
//! requests. At most one live connection is attached to a session at a time;
//! a new handshake with the same name takes the session over.
//!
//! The global session is an ordinary session created by the registry and
//! shared with every connection through the server context. It never has a
//! connection of its own; its messages reach the sessions watching it.
//!
//! Lock order: a request's state lock may be held while taking a session
//! lock, never the reverse. Session methods clone what they need out of the
//! lock before touching requests or other sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use slog::{debug, info, o, Drain, Logger};

use crate::connection::ConnectionHandle;
use crate::errors::LifecycleError;
use crate::message::ServerMessage;
use crate::request::ClientRequest;

pub const GLOBAL_SESSION_NAME: &str = "Global Queue";

#[derive(Default)]
struct SessionInner {
    connection: Option<Arc<ConnectionHandle>>,
    running: BTreeMap<String, Arc<ClientRequest>>,
    completed: BTreeMap<String, Arc<ClientRequest>>,
    // Sessions watching this one, by name, with their verbosity mask.
    watchers: BTreeMap<String, (Weak<Session>, u32)>,
}

pub struct Session {
    name: String,
    global: bool,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("global", &self.global)
            .finish()
    }
}

impl Session {
    pub fn new(name: &str, global: bool) -> Session {
        Session {
            name: name.to_string(),
            global,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.inner()
            .connection
            .clone()
            .filter(|conn| !conn.is_closed())
    }

    /// Binds `conn`, returning whichever connection was bound before.
    pub fn attach(&self, conn: &Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        self.inner().connection.replace(Arc::clone(conn))
    }

    /// Unbinds the connection with id `conn_id`, if it is still the bound one.
    pub fn detach(&self, conn_id: &str) -> bool {
        let mut inner = self.inner();
        match &inner.connection {
            Some(current) if current.id() == conn_id => {
                inner.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Registers a request under its identifier. Running and completed
    /// requests share the identifier space.
    pub fn add(&self, request: Arc<ClientRequest>, finished: bool) -> Result<(), LifecycleError> {
        let mut inner = self.inner();
        let identifier = request.identifier.clone();
        if inner.running.contains_key(&identifier) || inner.completed.contains_key(&identifier) {
            return Err(LifecycleError::collision(identifier, self.global));
        }
        if finished {
            inner.completed.insert(identifier, request);
        } else {
            inner.running.insert(identifier, request);
        }
        Ok(())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        let inner = self.inner();
        inner.running.contains_key(identifier) || inner.completed.contains_key(identifier)
    }

    pub fn lookup(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        let inner = self.inner();
        inner
            .running
            .get(identifier)
            .or_else(|| inner.completed.get(identifier))
            .cloned()
    }

    pub fn mark_completed(&self, identifier: &str) {
        let mut inner = self.inner();
        if let Some(request) = inner.running.remove(identifier) {
            inner.completed.insert(identifier.to_string(), request);
        }
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        let mut inner = self.inner();
        inner
            .running
            .remove(identifier)
            .or_else(|| inner.completed.remove(identifier))
    }

    /// Every request, running ones first.
    pub fn requests(&self) -> Vec<Arc<ClientRequest>> {
        let inner = self.inner();
        inner
            .running
            .values()
            .chain(inner.completed.values())
            .cloned()
            .collect()
    }

    pub fn completed(&self) -> Vec<Arc<ClientRequest>> {
        self.inner().completed.values().cloned().collect()
    }

    pub fn has_requests(&self) -> bool {
        let inner = self.inner();
        !inner.running.is_empty() || !inner.completed.is_empty()
    }

    pub fn add_watcher(&self, watcher: &Arc<Session>, mask: u32) {
        self.inner()
            .watchers
            .insert(watcher.name.clone(), (Arc::downgrade(watcher), mask));
    }

    pub fn remove_watcher(&self, name: &str) -> bool {
        self.inner().watchers.remove(name).is_some()
    }

    pub fn watch_mask(&self, name: &str) -> Option<u32> {
        self.inner()
            .watchers
            .get(name)
            .filter(|(watcher, _)| watcher.strong_count() > 0)
            .map(|(_, mask)| *mask)
    }

    /// Sends `msg` to this session's connection when `owner_wants` it, and to
    /// every watcher whose mask admits it. Level 0 messages reach every
    /// watcher.
    pub fn deliver(&self, msg: ServerMessage, owner_wants: bool) {
        let (own, watchers) = {
            let mut inner = self.inner();
            inner.watchers.retain(|_, (watcher, _)| watcher.strong_count() > 0);
            let level = msg.verbosity();
            let watchers: Vec<Arc<Session>> = inner
                .watchers
                .values()
                .filter(|(_, mask)| level == 0 || mask & level != 0)
                .filter_map(|(watcher, _)| watcher.upgrade())
                .collect();
            let own = if owner_wants {
                inner.connection.clone()
            } else {
                None
            };
            (own, watchers)
        };

        if let Some(conn) = own {
            conn.send(msg.clone());
        }
        for watcher in watchers {
            if let Some(conn) = watcher.connection() {
                conn.send(msg.clone());
            }
        }
    }
}

/// Maps client names to sessions. The global session lives outside the map.
pub struct SessionRegistry {
    global: Arc<Session>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    log: Logger,
}

impl SessionRegistry {
    pub fn new(log: Option<&Logger>) -> SessionRegistry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        SessionRegistry {
            global: Arc::new(Session::new(GLOBAL_SESSION_NAME, true)),
            sessions: Mutex::new(HashMap::new()),
            log,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn global(&self) -> &Arc<Session> {
        &self.global
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Session> {
        let mut sessions = self.sessions();
        Arc::clone(
            sessions
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Session::new(name, false))),
        )
    }

    /// The session a request belongs to: the global one, or its client's.
    pub fn session_for(&self, client_name: &str, global: bool) -> Arc<Session> {
        if global {
            Arc::clone(&self.global)
        } else {
            self.get_or_create(client_name)
        }
    }

    /// Binds `conn` to the session named `name`. A live connection already
    /// bound to it is told about the duplicate name and closed; this does
    /// not wait for its loops to finish.
    pub fn register(&self, name: &str, conn: &Arc<ConnectionHandle>) -> Arc<Session> {
        // Attached under the registry lock so a concurrent release cannot
        // see the session idle and drop it in between.
        let (session, previous) = {
            let mut sessions = self.sessions();
            let session = Arc::clone(
                sessions
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Session::new(name, false))),
            );
            let previous = session.attach(conn);
            (session, previous)
        };
        if let Some(previous) = previous {
            if previous.id() != conn.id() && !previous.is_closed() {
                info!(self.log, "client name taken over by new connection";
                    "client" => name,
                    "previous" => previous.id(),
                    "connection" => conn.id());
                previous.send(ServerMessage::CloseConnectionDuplicateClientName);
                previous.close();
            }
        }
        session
    }

    /// Called when `conn_id` closes. Drops the session once nothing keeps it
    /// alive: no connection and no requests. Idleness is judged under the
    /// registry lock, the same lock `register` attaches under.
    pub fn release(&self, session: &Arc<Session>, conn_id: &str) {
        session.detach(conn_id);
        if session.is_global() {
            return;
        }
        let mut sessions = self.sessions();
        let idle = session.connection().is_none() && !session.has_requests();
        let current = sessions
            .get(session.name())
            .map_or(false, |s| Arc::ptr_eq(s, session));
        if idle && current {
            debug!(self.log, "dropping idle session"; "client" => session.name());
            sessions.remove(session.name());
            drop(sessions);
            self.global.remove_watcher(session.name());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
