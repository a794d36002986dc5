// Copyright 2020 Joyent, Inc.

//! The request lifecycle manager.
//!
//! Every started request gets one driver task that selects on the engine's
//! event channel and the request's cancellation token. All state changes go
//! through the request's own lock, and the `finished` flag set under it is
//! what guarantees a single terminal message per request no matter how
//! completion, cancellation and late engine events interleave.

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketFactory, BucketRef};
use crate::connection::ConnectionHandle;
use crate::engine::{Engine, EngineError, JobEvent, JobFailure, ProgressEvent};
use crate::errors::{LifecycleError, MessageInvalid, ProtocolErrorCode};
use crate::message::ServerMessage;
use crate::request::failure::FailureRecord;
use crate::request::{persist, ClientRequest, FoundData, Persistence, ReturnType};
use crate::session::{Session, SessionRegistry};
use crate::store::{DurableStore, MemoryStore, StoreError};

/// Where a request lives and where its messages go.
#[derive(Clone, Debug)]
pub enum Route {
    /// A connection-tier request, owned by the connection that submitted it.
    Connection(Arc<ConnectionHandle>),
    /// A persistent request, owned by a client session or the global one.
    Session(Arc<Session>),
}

impl Route {
    pub fn deliver(&self, request: &ClientRequest, msg: ServerMessage) {
        let wants = request.wants(&msg);
        match self {
            Route::Connection(conn) => {
                if wants {
                    conn.send(msg);
                }
            }
            Route::Session(session) => session.deliver(msg, wants),
        }
    }

    pub fn lookup(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        match self {
            Route::Connection(conn) => conn.lookup(identifier),
            Route::Session(session) => session.lookup(identifier),
        }
    }

    fn insert(&self, request: Arc<ClientRequest>, finished: bool) -> Result<(), LifecycleError> {
        match self {
            Route::Connection(conn) => conn.add(request),
            Route::Session(session) => session.add(request, finished),
        }
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        match self {
            Route::Connection(conn) => conn.remove(identifier),
            Route::Session(session) => session.remove(identifier),
        }
    }

    fn mark_completed(&self, identifier: &str) {
        if let Route::Session(session) = self {
            session.mark_completed(identifier);
        }
    }
}

/// How a job ended, before it is applied to the request.
#[derive(Debug)]
enum Completion {
    Fetched {
        found: FoundData,
        data: Option<Bytes>,
        post_fetch_error: Option<MessageInvalid>,
    },
    Inserted {
        uri: Option<String>,
    },
    Failed(FailureRecord),
}

pub struct RequestManager {
    engine: Arc<dyn Engine>,
    reboot_store: MemoryStore,
    forever_store: Option<Arc<dyn DurableStore>>,
    // Wakes the persister when a change should reach disk without waiting
    // for the next tick.
    flush_wanted: Notify,
    buckets: BucketFactory,
    log: Logger,
}

impl RequestManager {
    /// `forever_store` is `None` when persistence is disabled, in which case
    /// FOREVER requests are refused.
    pub fn new(
        engine: Arc<dyn Engine>,
        forever_store: Option<Arc<dyn DurableStore>>,
        buckets: BucketFactory,
        log: Option<&Logger>,
    ) -> RequestManager {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        RequestManager {
            engine,
            reboot_store: MemoryStore::new(),
            forever_store,
            flush_wanted: Notify::new(),
            buckets,
            log,
        }
    }

    pub fn buckets(&self) -> &BucketFactory {
        &self.buckets
    }

    pub fn reboot_store(&self) -> &MemoryStore {
        &self.reboot_store
    }

    fn store_for(&self, persistence: Persistence) -> Option<&dyn DurableStore> {
        match persistence {
            Persistence::Connection => None,
            Persistence::Reboot => Some(&self.reboot_store),
            Persistence::Forever => self.forever_store.as_deref(),
        }
    }

    /// Writes the request's current field set to its tier's store. With
    /// `flush`, the persister is asked to write the FOREVER store promptly.
    fn persist(&self, request: &ClientRequest, flush: bool) -> Result<(), StoreError> {
        if let Some(store) = self.store_for(request.persistence) {
            store.put(&request.store_key(), persist::to_fieldset(request)?)?;
            if flush {
                self.request_flush(request.persistence);
            }
        }
        Ok(())
    }

    fn request_flush(&self, persistence: Persistence) {
        if persistence == Persistence::Forever {
            self.flush_wanted.notify_one();
        }
    }

    /// Resolves when a change has asked for an early flush.
    pub async fn flush_requested(&self) {
        self.flush_wanted.notified().await
    }

    fn persist_logged(&self, request: &ClientRequest, flush: bool) {
        if let Err(e) = self.persist(request, flush) {
            error!(self.log, "failed to persist request";
                "identifier" => &request.identifier,
                "error" => %e);
        }
    }

    /// Checks a new request against the store configuration and existing
    /// identifiers, and registers it with `route`.
    fn admit(
        &self,
        request: &Arc<ClientRequest>,
        route: &Route,
        session: Option<&Arc<Session>>,
    ) -> Result<(), LifecycleError> {
        let identifier = &request.identifier;
        let global = request.global;
        if request.persistence == Persistence::Forever && self.forever_store.is_none() {
            return Err(MessageInvalid::new(
                ProtocolErrorCode::NotSupported,
                "Persistence is disabled",
            )
            .for_request(Some(identifier), global)
            .into());
        }
        if let (Route::Connection(_), Some(session)) = (route, session) {
            if session.contains(identifier) {
                return Err(LifecycleError::collision(identifier.as_str(), global));
            }
        }
        if let (Route::Session(target), Some(conn)) = (route, session.and_then(|s| s.connection())) {
            if !target.is_global() && conn.lookup(identifier).is_some() {
                return Err(LifecycleError::collision(identifier.as_str(), global));
            }
        }
        route.insert(Arc::clone(request), false)
    }

    /// Registers a new request and starts it. Persistent requests are stored
    /// and announced with their tag message before the job begins.
    ///
    /// `session` is the submitting client's own session, checked for
    /// collisions even when the request is connection-tier.
    pub fn submit(
        self: &Arc<Self>,
        request: ClientRequest,
        route: Route,
        session: Option<&Arc<Session>>,
    ) -> Result<Arc<ClientRequest>, LifecycleError> {
        let identifier = request.identifier.clone();
        let global = request.global;
        let request = Arc::new(request);

        // A refused request never runs, so the payload it was given is
        // released here.
        if let Err(e) = self.admit(&request, &route, session) {
            request.release_buckets();
            return Err(e);
        }

        if request.is_persistent() {
            if let Err(source) = self.persist(&request, false) {
                route.remove(&identifier);
                request.release_buckets();
                return Err(LifecycleError::Persist {
                    identifier,
                    global,
                    source,
                });
            }
            let tag = request.persistent_tag(&request.state());
            match tag {
                Ok(tag) => route.deliver(&request, tag),
                Err(e) => warn!(self.log, "cannot describe request";
                    "identifier" => &identifier,
                    "error" => %e),
            }
        }

        debug!(self.log, "request submitted";
            "identifier" => &request.identifier,
            "uri" => &request.uri,
            "persistence" => request.persistence.as_str(),
            "global" => request.global);
        self.start(Arc::clone(&request), route);
        Ok(request)
    }

    /// Hands the request to the engine. Only the first call on a request
    /// does anything.
    pub fn start(self: &Arc<Self>, request: Arc<ClientRequest>, route: Route) {
        let (submitted, cancel) = {
            let mut state = request.state();
            if state.started || state.finished {
                return;
            }
            state.started = true;
            state.touch();
            let submitted = match request.fetch_job(&state) {
                Some(job) => self.engine.fetch(job),
                None => match request.insert_job(&state) {
                    Some(job) => self.engine.insert(job),
                    None => Err(EngineError::Rejected {
                        code: request.failure_kind().internal_error_code(),
                        reason: "request has no job".into(),
                    }),
                },
            };
            if let Ok(handle) = &submitted {
                state.job = Some(Arc::clone(&handle.control));
            }
            (submitted, state.cancel.clone())
        };

        match submitted {
            Ok(handle) => {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.drive(request, route, handle.events, cancel).await;
                });
            }
            Err(e) => {
                warn!(self.log, "engine refused job";
                    "identifier" => &request.identifier,
                    "error" => %e);
                let kind = request.failure_kind();
                let code = match e {
                    EngineError::Rejected { code, .. } => code,
                    EngineError::ShuttingDown => kind.internal_error_code(),
                };
                let failure = FailureRecord::from_job(kind, JobFailure::with_extra(code, e.to_string()));
                self.complete(&request, &route, Completion::Failed(failure));
            }
        }
    }

    async fn drive(
        self: Arc<Self>,
        request: Arc<ClientRequest>,
        route: Route,
        mut events: mpsc::UnboundedReceiver<JobEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        self.handle_event(&request, &route, event).await;
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        let kind = request.failure_kind();
                        let failure = FailureRecord::from_job(
                            kind,
                            JobFailure::with_extra(
                                kind.internal_error_code(),
                                "job ended without a result",
                            ),
                        );
                        self.complete(&request, &route, Completion::Failed(failure));
                        break;
                    }
                }
            }
        }
    }

    /// Applies one engine event. Events for a finished request are dropped.
    pub async fn handle_event(&self, request: &Arc<ClientRequest>, route: &Route, event: JobEvent) {
        match event {
            JobEvent::Progress(progress) => self.progress(request, route, progress),
            JobEvent::UriGenerated(uri) => {
                {
                    let mut state = request.state();
                    if state.finished {
                        return;
                    }
                    state.generated_uri = Some(uri.clone());
                    state.touch();
                    route.deliver(request, ServerMessage::UriGenerated(request.request_id(), uri));
                }
                self.persist_logged(request, false);
            }
            JobEvent::Fetchable(uri) => {
                let state = request.state();
                if !state.finished {
                    route.deliver(request, ServerMessage::PutFetchable(request.request_id(), uri));
                }
            }
            JobEvent::FetchSucceeded { data, mime } => {
                if request.state().finished {
                    data.free();
                    return;
                }
                let completion = self.collect_fetched(request, data, mime).await;
                self.complete(request, route, completion);
            }
            JobEvent::InsertSucceeded { uri } => {
                self.complete(request, route, Completion::Inserted { uri: Some(uri) });
            }
            JobEvent::Failed(failure) => {
                let record = FailureRecord::from_job(request.failure_kind(), failure);
                self.complete(request, route, Completion::Failed(record));
            }
        }
    }

    fn progress(&self, request: &ClientRequest, route: &Route, event: ProgressEvent) {
        let mut state = request.state();
        if state.finished {
            return;
        }
        let msg = ServerMessage::progress(request.request_id(), &event);
        if let ProgressEvent::Splitfile(progress) = &event {
            state.progress = Some(progress.clone());
            state.latest_progress = Some(msg.clone());
        }
        state.touch();
        route.deliver(request, msg);
    }

    /// Moves fetched data to wherever the request asked for it.
    async fn collect_fetched(
        &self,
        request: &ClientRequest,
        data: BucketRef,
        mime: Option<String>,
    ) -> Completion {
        let found = FoundData {
            length: data.size(),
            mime,
        };
        let result = match request.return_type() {
            Some(ReturnType::Direct) => data.read_all().map(|bytes| Completion::Fetched {
                found: found.clone(),
                data: Some(bytes),
                post_fetch_error: None,
            }),
            Some(ReturnType::Disk {
                filename,
                temp_filename,
            }) => {
                let post_fetch_error = write_to_disk(&data, filename, temp_filename)
                    .await
                    .err()
                    .map(|e| e.for_request(Some(&request.identifier), request.global));
                if let Some(e) = &post_fetch_error {
                    warn!(self.log, "could not store fetched data";
                        "identifier" => &request.identifier,
                        "error" => %e);
                }
                Ok(Completion::Fetched {
                    found: found.clone(),
                    data: None,
                    post_fetch_error,
                })
            }
            _ => Ok(Completion::Fetched {
                found: found.clone(),
                data: None,
                post_fetch_error: None,
            }),
        };
        data.free();
        result.unwrap_or_else(|e| {
            let kind = request.failure_kind();
            Completion::Failed(FailureRecord::from_job(
                kind,
                JobFailure::with_extra(kind.internal_error_code(), e.to_string()),
            ))
        })
    }

    /// Finishes a request. Returns false if it had already finished, in
    /// which case nothing is sent.
    fn complete(&self, request: &ClientRequest, route: &Route, completion: Completion) -> bool {
        {
            let mut state = request.state();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.touch();
            state.job = None;
            state.cancel.cancel();

            let mut post_fetch_error = None;
            match completion {
                Completion::Fetched {
                    found,
                    data,
                    post_fetch_error: error,
                } => {
                    state.succeeded = true;
                    state.found = Some(found);
                    state.all_data = data;
                    post_fetch_error = error;
                }
                Completion::Inserted { uri } => {
                    state.succeeded = true;
                    if uri.is_some() {
                        state.generated_uri = uri;
                    }
                }
                Completion::Failed(failure) => {
                    state.failure = Some(failure);
                }
            }
            state.post_fetch_error = post_fetch_error.clone();
            request.release_buckets();

            if let Some(terminal) = request.terminal_message(&state) {
                route.deliver(request, terminal);
            }
            if let Some(invalid) = post_fetch_error {
                route.deliver(request, ServerMessage::protocol_error(&invalid, false));
            }
            // Connection-tier clients get their data right away; persistent
            // ones ask for it with GetRequestStatus.
            if let Route::Connection(_) = route {
                if let Some(all_data) = request.all_data_message(&state) {
                    route.deliver(request, all_data);
                }
            }
            route.mark_completed(&request.identifier);

            info!(self.log, "request finished";
                "identifier" => &request.identifier,
                "succeeded" => state.succeeded);
        }
        if request.is_persistent() {
            self.persist_logged(request, true);
        }
        true
    }

    /// Cancels a request that has not finished yet. The engine job is told
    /// to stop and the request finishes with a cancelled failure.
    pub fn cancel(&self, request: &ClientRequest, route: &Route) -> bool {
        let job = {
            let mut state = request.state();
            if state.finished {
                return false;
            }
            state.job.take()
        };
        if let Some(job) = job {
            job.cancel();
        }
        let failure = FailureRecord::cancelled(request.failure_kind());
        self.complete(request, route, Completion::Failed(failure))
    }

    /// The messages answering a `GetRequestStatus`.
    pub fn status(
        &self,
        route: &Route,
        identifier: &str,
        global: bool,
        only_data: bool,
    ) -> Result<Vec<ServerMessage>, LifecycleError> {
        let request = route
            .lookup(identifier)
            .ok_or_else(|| LifecycleError::no_such_identifier(identifier, global))?;
        let state = request.state();
        if only_data {
            return Ok(request.all_data_message(&state).into_iter().collect());
        }
        request.status_messages(&state, true, true).map_err(|e| {
            LifecycleError::from(
                MessageInvalid::new(ProtocolErrorCode::InternalError, e.to_string())
                    .for_request(Some(identifier), global),
            )
        })
    }

    /// Status messages for listings and replays. A request whose messages
    /// cannot be rendered is logged and left out.
    fn status_logged(&self, request: &ClientRequest) -> Vec<ServerMessage> {
        let state = request.state();
        match request.status_messages(&state, true, false) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(self.log, "cannot describe request";
                    "identifier" => &request.identifier,
                    "error" => %e);
                Vec::new()
            }
        }
    }

    /// Tags plus cached progress and terminal messages for every request
    /// `conn` can see, closed by `EndListPersistentRequests`.
    pub fn list_pending(
        &self,
        conn: &ConnectionHandle,
        session: &Session,
        global: Option<&Session>,
    ) -> Vec<ServerMessage> {
        let mut requests = conn.requests();
        requests.extend(session.requests());
        if let Some(global) = global {
            requests.extend(global.requests());
        }
        let mut out = Vec::new();
        for request in requests {
            out.extend(self.status_logged(&request));
        }
        out.push(ServerMessage::EndListPersistentRequests);
        out
    }

    /// Replays every completed request in `session` to `conn`.
    pub fn replay_completed(&self, session: &Session, conn: &ConnectionHandle) {
        for request in session.completed() {
            for msg in self.status_logged(&request) {
                conn.send(msg);
            }
        }
    }

    /// Changes the live fields of a request. A `PersistentRequestModified`
    /// goes out only when something actually changed.
    pub fn modify(
        &self,
        route: &Route,
        identifier: &str,
        global: bool,
        client_token: Option<String>,
        priority: Option<u8>,
    ) -> Result<bool, LifecycleError> {
        let request = route
            .lookup(identifier)
            .ok_or_else(|| LifecycleError::no_such_identifier(identifier, global))?;
        let (msg, job) = {
            let mut state = request.state();
            let client_token =
                client_token.filter(|token| Some(token) != state.client_token.as_ref());
            let priority = priority.filter(|&priority| priority != state.priority);
            if client_token.is_none() && priority.is_none() {
                return Ok(false);
            }
            if client_token.is_some() {
                state.client_token = client_token.clone();
            }
            if let Some(priority) = priority {
                state.priority = priority;
            }
            state.touch();
            // Finished requests keep the new values for listings only.
            let job = match (state.finished, priority) {
                (false, Some(priority)) => state.job.clone().map(|job| (job, priority)),
                _ => None,
            };
            let msg = ServerMessage::PersistentRequestModified {
                request: request.request_id(),
                client_token,
                priority,
            };
            route.deliver(&request, msg.clone());
            (msg, job)
        };
        if let Some((job, priority)) = job {
            job.set_priority(priority);
        }
        debug!(self.log, "request modified"; "identifier" => identifier, "message" => ?msg);
        if request.is_persistent() {
            self.persist(&request, true).map_err(|source| LifecycleError::Persist {
                identifier: identifier.to_string(),
                global,
                source,
            })?;
        }
        Ok(true)
    }

    /// Cancels the request if it is still running, forgets it and deletes it
    /// from its store.
    pub fn remove(&self, route: &Route, identifier: &str, global: bool) -> Result<(), LifecycleError> {
        let request = route
            .lookup(identifier)
            .ok_or_else(|| LifecycleError::no_such_identifier(identifier, global))?;
        self.cancel(&request, route);
        route.remove(identifier);
        request.state().all_data = None;
        request.release_buckets();

        if let Some(store) = self.store_for(request.persistence) {
            if let Err(source) = store.remove(&request.store_key()) {
                return Err(LifecycleError::Persist {
                    identifier: identifier.to_string(),
                    global,
                    source,
                });
            }
            self.request_flush(request.persistence);
        }
        route.deliver(
            &request,
            ServerMessage::PersistentRequestRemoved(request.request_id()),
        );
        info!(self.log, "request removed"; "identifier" => identifier, "global" => global);
        Ok(())
    }

    /// Cancels and forgets every connection-tier request of a closing
    /// connection.
    pub fn abandon_connection(&self, conn: &Arc<ConnectionHandle>) {
        let route = Route::Connection(Arc::clone(conn));
        for request in conn.requests() {
            if self.cancel(&request, &route) {
                debug!(self.log, "cancelled request of closed connection";
                    "identifier" => &request.identifier);
            }
            route.remove(&request.identifier);
            request.state().all_data = None;
        }
    }

    /// Rebuilds FOREVER requests from the durable store, registering each
    /// with its session and restarting the unfinished ones. Returns how many
    /// were restored.
    pub fn load_persistent(self: &Arc<Self>, registry: &SessionRegistry) -> usize {
        let store = match &self.forever_store {
            Some(store) => Arc::clone(store),
            None => return 0,
        };
        let entries = match store.load_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(self.log, "failed to load persistent requests"; "error" => %e);
                return 0;
            }
        };

        let mut restored = 0;
        for fields in entries {
            let request = match persist::from_fieldset(&fields, &self.buckets) {
                Ok(request) => request,
                Err(e) => {
                    warn!(self.log, "skipping persisted request";
                        "identifier" => fields.get("Identifier").unwrap_or(""),
                        "error" => %e);
                    continue;
                }
            };
            let session = registry.session_for(&request.client_name, request.global);
            let finished = {
                let mut state = request.state();
                // Restarted jobs begin from scratch.
                state.started = false;
                state.finished
            };
            let request = Arc::new(request);
            let route = Route::Session(session);
            if let Err(e) = route.insert(Arc::clone(&request), finished) {
                warn!(self.log, "skipping duplicate persisted request"; "error" => %e);
                continue;
            }
            if !finished {
                self.start(Arc::clone(&request), route);
            }
            restored += 1;
        }
        info!(self.log, "restored persistent requests"; "count" => restored);
        restored
    }

    /// Flushes the FOREVER store if anything changed since the last flush.
    pub fn flush_if_dirty(&self) -> Result<bool, StoreError> {
        match &self.forever_store {
            Some(store) => store.flush_if_dirty(),
            None => Ok(false),
        }
    }

    pub fn force_flush(&self) -> Result<(), StoreError> {
        match &self.forever_store {
            Some(store) => store.force_flush(),
            None => Ok(()),
        }
    }

    /// [`RequestManager::flush_if_dirty`] on the blocking pool, for callers
    /// running on the runtime.
    pub async fn flush_in_background(self: &Arc<Self>) -> Result<bool, StoreError> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.flush_if_dirty())
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

/// Writes fetched data to the temp file, then renames it over the target.
async fn write_to_disk(
    data: &BucketRef,
    filename: &Path,
    temp_filename: &Path,
) -> Result<(), MessageInvalid> {
    let bytes = data.read_all().map_err(|e| write_error(temp_filename, e))?;
    tokio::fs::write(temp_filename, &bytes)
        .await
        .map_err(|e| write_error(temp_filename, e))?;
    tokio::fs::rename(temp_filename, filename).await.map_err(|e| {
        MessageInvalid::new(
            ProtocolErrorCode::CouldNotRenameFile,
            format!("{}: {}", filename.display(), e),
        )
    })
}

fn write_error(path: &Path, e: io::Error) -> MessageInvalid {
    MessageInvalid::new(
        ProtocolErrorCode::CouldNotWriteFile,
        format!("{}: {}", path.display(), e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use crate::engine::{
        FetchContext, FetchJob, InsertJob, JobHandle, JobReporter, SplitfileProgress,
        TokenControl, VERBOSITY_SPLITFILE_PROGRESS,
    };
    use crate::message::client::{ClientGet, ClientPut, PutSource, RequestCommon};
    use crate::request::failure::fetch_codes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Engine whose jobs are driven by the test through their reporters.
    #[derive(Default)]
    struct ManualEngine {
        jobs: Mutex<HashMap<String, JobReporter>>,
        controls: Mutex<HashMap<String, Arc<TokenControl>>>,
    }

    impl ManualEngine {
        fn handle(&self, identifier: &str) -> JobHandle {
            let (reporter, events) = JobReporter::channel();
            let control = Arc::new(TokenControl::new(2));
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

        fn reporter(&self, identifier: &str) -> JobReporter {
            self.jobs.lock().unwrap().get(identifier).cloned().unwrap()
        }

        fn job_priority(&self, identifier: &str) -> u8 {
            let controls = self.controls.lock().unwrap();
            let priority = *controls[identifier].priority.lock().unwrap();
            priority
        }
    }

    impl Engine for ManualEngine {
        fn fetch(&self, job: FetchJob) -> Result<JobHandle, EngineError> {
            Ok(self.handle(&job.identifier))
        }

        fn insert(&self, job: InsertJob) -> Result<JobHandle, EngineError> {
            Ok(self.handle(&job.identifier))
        }
    }

    fn get(identifier: &str, persistence: Persistence, verbosity: u32) -> ClientRequest {
        let get = ClientGet {
            common: RequestCommon {
                identifier: identifier.into(),
                uri: "KSK@test.txt".into(),
                global: false,
                persistence,
                priority: 2,
                verbosity,
                client_token: None,
                max_retries: 0,
            },
            return_type: ReturnType::Direct,
            context: FetchContext::default(),
        };
        ClientRequest::from_get(get, "tester").unwrap()
    }

    fn setup() -> (Arc<ManualEngine>, Arc<RequestManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ManualEngine::default());
        let manager = Arc::new(RequestManager::new(
            engine.clone(),
            None,
            BucketFactory::new(dir.path().to_path_buf()),
            None,
        ));
        (engine, manager, dir)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn success_is_reported_once() {
        let (engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        let request = manager
            .submit(get("job1", Persistence::Connection, 0), route.clone(), None)
            .unwrap();

        let reporter = engine.reporter("job1");
        reporter.report(JobEvent::FetchSucceeded {
            data: Arc::new(MemoryBucket::new(Bytes::from(vec![7u8; 42]))),
            mime: Some("text/plain".into()),
        });
        reporter.fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
        settle().await;

        let msgs = drain(&mut rx);
        let names: Vec<&str> = msgs.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["DataFound", "AllData"]);
        assert!(request.state().succeeded);

        let replay = manager.status(&route, "job1", false, false).unwrap();
        assert!(replay.iter().any(|m| m.name() == "DataFound"));
        assert!(!manager.cancel(&request, &route));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn progress_respects_verbosity() {
        let (engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        manager
            .submit(get("quiet", Persistence::Connection, 0), route.clone(), None)
            .unwrap();
        manager
            .submit(
                get("loud", Persistence::Connection, VERBOSITY_SPLITFILE_PROGRESS),
                route,
                None,
            )
            .unwrap();

        for id in &["quiet", "loud"] {
            let reporter = engine.reporter(id);
            reporter.progress(ProgressEvent::Splitfile(SplitfileProgress::default()));
            reporter.progress(ProgressEvent::SendingToNetwork);
        }
        settle().await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].identifier(), Some("loud"));
        assert_eq!(msgs[0].name(), "SimpleProgress");
    }

    #[tokio::test]
    async fn cancel_then_late_events() {
        let (engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        let request = manager
            .submit(get("c", Persistence::Connection, 0), route.clone(), None)
            .unwrap();

        assert!(manager.cancel(&request, &route));
        let reporter = engine.reporter("c");
        reporter.report(JobEvent::FetchSucceeded {
            data: Arc::new(MemoryBucket::new(Bytes::from_static(b"late"))),
            mime: None,
        });
        settle().await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerMessage::GetFailed(_, failure) => assert!(failure.is_cancelled()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn persistent_requests_are_stored_and_removed() {
        let (engine, manager, _dir) = setup();
        let session = Arc::new(Session::new("tester", false));
        let (conn, mut rx) = ConnectionHandle::new("c1");
        session.attach(&conn);
        let route = Route::Session(Arc::clone(&session));

        manager
            .submit(get("p", Persistence::Reboot, 0), route.clone(), Some(&session))
            .unwrap();
        assert_eq!(manager.reboot_store().len(), 1);
        engine
            .reporter("p")
            .fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
        settle().await;
        assert_eq!(session.completed().len(), 1);

        manager.remove(&route, "p", false).unwrap();
        assert!(manager.reboot_store().is_empty());
        let names: Vec<&str> = drain(&mut rx).iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec!["PersistentGet", "GetFailed", "PersistentRequestRemoved"]
        );

        match manager.remove(&route, "p", false) {
            Err(LifecycleError::NoSuchIdentifier { identifier, .. }) => assert_eq!(identifier, "p"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn forever_refused_without_store() {
        let (_engine, manager, _dir) = setup();
        let session = Arc::new(Session::new("tester", false));
        let route = Route::Session(Arc::clone(&session));
        match manager.submit(get("f", Persistence::Forever, 0), route, Some(&session)) {
            Err(LifecycleError::Invalid(invalid)) => {
                assert_eq!(invalid.code, ProtocolErrorCode::NotSupported)
            }
            other => panic!("unexpected {:?}", other.map(|r| r.identifier.clone())),
        }
    }

    fn spilled_files(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("fcp-bucket-")
            })
            .count()
    }

    #[tokio::test]
    async fn refused_put_frees_its_payload() {
        let (_engine, manager, dir) = setup();
        let session = Arc::new(Session::new("tester", false));
        let put = |identifier: &str| ClientPut {
            common: RequestCommon {
                identifier: identifier.into(),
                uri: "CHK@".into(),
                global: false,
                persistence: Persistence::Forever,
                priority: 2,
                verbosity: 0,
                client_token: None,
                max_retries: 0,
            },
            source: PutSource::Direct(Bytes::from_static(b"payload")),
            content_type: None,
            target_filename: None,
            get_chk_only: false,
            dont_compress: false,
        };

        let request = ClientRequest::from_put(put("p"), "tester", manager.buckets()).unwrap();
        assert_eq!(spilled_files(&dir), 1);
        let route = Route::Session(Arc::clone(&session));
        match manager.submit(request, route, Some(&session)) {
            Err(LifecycleError::Invalid(invalid)) => {
                assert_eq!(invalid.code, ProtocolErrorCode::NotSupported)
            }
            other => panic!("unexpected {:?}", other.map(|r| r.identifier.clone())),
        }
        assert_eq!(spilled_files(&dir), 0);

        // Same for an identifier already taken on the client's connection.
        let (conn, _rx) = ConnectionHandle::new("c1");
        session.attach(&conn);
        manager
            .submit(
                get("dup", Persistence::Connection, 0),
                Route::Connection(Arc::clone(&conn)),
                Some(&session),
            )
            .unwrap();
        let mut reboot = put("dup");
        reboot.common.persistence = Persistence::Reboot;
        let request = ClientRequest::from_put(reboot, "tester", manager.buckets()).unwrap();
        assert_eq!(spilled_files(&dir), 1);
        let route = Route::Session(Arc::clone(&session));
        match manager.submit(request, route, Some(&session)) {
            Err(LifecycleError::IdentifierCollision { identifier, .. }) => {
                assert_eq!(identifier, "dup")
            }
            other => panic!("unexpected {:?}", other.map(|r| r.identifier.clone())),
        }
        assert_eq!(spilled_files(&dir), 0);
    }

    #[tokio::test]
    async fn modify_only_reports_changes() {
        let (_engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        manager
            .submit(get("m", Persistence::Connection, 0), route.clone(), None)
            .unwrap();

        assert!(!manager.modify(&route, "m", false, None, Some(2)).unwrap());
        assert!(manager
            .modify(&route, "m", false, Some("tok".into()), Some(4))
            .unwrap());
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs,
            vec![ServerMessage::PersistentRequestModified {
                request: crate::message::RequestId::new("m", false),
                client_token: Some("tok".into()),
                priority: Some(4),
            }]
        );
    }

    #[tokio::test]
    async fn modify_reports_only_changed_fields() {
        let (engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        manager
            .submit(get("t", Persistence::Connection, 0), route.clone(), None)
            .unwrap();

        assert!(manager
            .modify(&route, "t", false, Some("tok".into()), Some(2))
            .unwrap());
        assert!(manager.modify(&route, "t", false, None, Some(5)).unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::PersistentRequestModified {
                    request: crate::message::RequestId::new("t", false),
                    client_token: Some("tok".into()),
                    priority: None,
                },
                ServerMessage::PersistentRequestModified {
                    request: crate::message::RequestId::new("t", false),
                    client_token: None,
                    priority: Some(5),
                },
            ]
        );
        assert_eq!(engine.job_priority("t"), 5);
    }

    #[tokio::test]
    async fn finished_request_can_be_modified() {
        let (engine, manager, _dir) = setup();
        let (conn, mut rx) = ConnectionHandle::new("c1");
        let route = Route::Connection(Arc::clone(&conn));
        let request = manager
            .submit(get("done", Persistence::Connection, 0), route.clone(), None)
            .unwrap();
        engine
            .reporter("done")
            .fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
        settle().await;
        drain(&mut rx);

        assert!(manager
            .modify(&route, "done", false, Some("later".into()), Some(6))
            .unwrap());
        let state = request.state();
        assert_eq!(state.client_token.as_deref(), Some("later"));
        assert_eq!(state.priority, 6);
        drop(state);
        assert_eq!(engine.job_priority("done"), 2);
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::PersistentRequestModified {
                request: crate::message::RequestId::new("done", false),
                client_token: Some("later".into()),
                priority: Some(6),
            }]
        );
    }
}
