// Copyright 2020 Joyent, Inc.

//! Client requests: the jobs a client submits, with their lifecycle state.
//!
//! A [`ClientRequest`] holds the fields fixed at submission alongside a
//! mutex-guarded [`RequestState`] for everything that changes while the job
//! runs. Every message about a request is produced while holding that lock,
//! which is what keeps a request's progress messages ahead of its single
//! terminal message.

pub mod dir;
pub mod failure;
pub mod persist;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketFactory, BucketRef, FileBucket};
use crate::engine::{
    FetchContext, FetchJob, InsertData, InsertFile, InsertJob, InsertPayload,
    JobControl, SplitfileProgress, VERBOSITY_ALL,
};
use crate::errors::{FieldSetError, MessageInvalid, ProtocolErrorCode};
use crate::fieldset::FieldSet;
use crate::message::client::{
    ClientGet, ClientPut, ClientPutComplexDir, DirFileSpec, PutSource,
    RequestCommon,
};
use crate::message::{RequestId, ServerMessage};
use crate::store::StoreKey;

use self::dir::{DirFile, DirTree};
use self::failure::{FailureKind, FailureRecord};

pub const MAX_PRIORITY_CLASS: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Persistence {
    /// Dies with the connection that submitted it.
    Connection,
    /// Survives reconnects but not a restart.
    Reboot,
    /// Survives restarts through the durable store.
    Forever,
}

impl Persistence {
    pub fn parse(raw: &str) -> Option<Persistence> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "connection" => Some(Persistence::Connection),
            "reboot" => Some(Persistence::Reboot),
            "forever" => Some(Persistence::Forever),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persistence::Connection => "connection",
            Persistence::Reboot => "reboot",
            Persistence::Forever => "forever",
        }
    }

    pub fn is_persistent(self) -> bool {
        self != Persistence::Connection
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnType {
    Direct,
    None,
    Disk {
        filename: PathBuf,
        temp_filename: PathBuf,
    },
}

impl ReturnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnType::Direct => "direct",
            ReturnType::None => "none",
            ReturnType::Disk { .. } => "disk",
        }
    }
}

/// Upload data once it has been accepted into a bucket.
#[derive(Clone, Debug)]
pub enum UploadSource {
    Direct(BucketRef),
    Disk { filename: PathBuf, data: BucketRef },
    Redirect(String),
}

impl UploadSource {
    pub fn upload_from(&self) -> &'static str {
        match self {
            UploadSource::Direct(_) => "direct",
            UploadSource::Disk { .. } => "disk",
            UploadSource::Redirect(_) => "redirect",
        }
    }

    pub fn bucket(&self) -> Option<&BucketRef> {
        match self {
            UploadSource::Direct(data) | UploadSource::Disk { data, .. } => Some(data),
            UploadSource::Redirect(_) => None,
        }
    }

    pub fn data_length(&self) -> u64 {
        self.bucket().map_or(0, |b| b.size())
    }

    fn insert_data(&self) -> InsertData {
        match self {
            UploadSource::Direct(data) | UploadSource::Disk { data, .. } => {
                InsertData::Bucket(Arc::clone(data))
            }
            UploadSource::Redirect(target) => InsertData::Redirect(target.clone()),
        }
    }

    /// Turns a message source into a bucket-backed one. Direct data for
    /// persistent requests is spilled to a file so it can be found again.
    fn accept(
        source: PutSource,
        persistence: Persistence,
        buckets: &BucketFactory,
    ) -> Result<UploadSource, MessageInvalid> {
        match source {
            PutSource::Direct(data) => {
                if persistence.is_persistent() {
                    let bucket = buckets.persistent(&data).map_err(|e| {
                        MessageInvalid::new(ProtocolErrorCode::CouldNotCreateFile, e.to_string())
                    })?;
                    Ok(UploadSource::Direct(bucket))
                } else {
                    Ok(UploadSource::Direct(buckets.memory(data)))
                }
            }
            PutSource::Disk(filename) => {
                let bucket = FileBucket::open(&filename, false).map_err(|e| {
                    let code = match e.kind() {
                        io::ErrorKind::NotFound => ProtocolErrorCode::FileNotFound,
                        io::ErrorKind::PermissionDenied => ProtocolErrorCode::AccessDenied,
                        io::ErrorKind::InvalidInput => ProtocolErrorCode::NotAFile,
                        _ => ProtocolErrorCode::FileNotFound,
                    };
                    MessageInvalid::new(code, filename.display().to_string())
                })?;
                Ok(UploadSource::Disk {
                    filename,
                    data: Arc::new(bucket),
                })
            }
            PutSource::Redirect(target) => Ok(UploadSource::Redirect(target)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadSpec {
    pub return_type: ReturnType,
    pub context: FetchContext,
}

#[derive(Clone, Debug)]
pub struct UploadSpec {
    pub source: UploadSource,
    pub content_type: Option<String>,
    pub target_filename: Option<String>,
    pub get_chk_only: bool,
    pub dont_compress: bool,
}

#[derive(Clone, Debug)]
pub struct DirectorySpec {
    pub tree: DirTree,
    pub default_name: Option<String>,
    pub get_chk_only: bool,
    pub dont_compress: bool,
}

#[derive(Clone, Debug)]
pub enum RequestKind {
    Download(DownloadSpec),
    UploadFile(UploadSpec),
    UploadDirectory(DirectorySpec),
}

impl RequestKind {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RequestKind::Download(_) => FailureKind::Fetch,
            _ => FailureKind::Insert,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RequestKind::Download(_) => "GET",
            RequestKind::UploadFile(_) => "PUT",
            RequestKind::UploadDirectory(_) => "PUTDIR",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FoundData {
    pub length: u64,
    pub mime: Option<String>,
}

/// The mutable part of a request.
pub struct RequestState {
    pub priority: u8,
    pub client_token: Option<String>,
    pub started: bool,
    pub finished: bool,
    pub succeeded: bool,
    pub last_activity: DateTime<Utc>,
    pub progress: Option<SplitfileProgress>,
    /// Only the most recent progress message is kept for replay.
    pub latest_progress: Option<ServerMessage>,
    pub generated_uri: Option<String>,
    pub found: Option<FoundData>,
    /// Fetched data for `ReturnType::Direct`, held until the client
    /// removes the request.
    pub all_data: Option<Bytes>,
    pub failure: Option<FailureRecord>,
    pub post_fetch_error: Option<MessageInvalid>,
    pub job: Option<Arc<dyn JobControl>>,
    pub cancel: CancellationToken,
}

impl RequestState {
    fn new(priority: u8, client_token: Option<String>) -> RequestState {
        RequestState {
            priority,
            client_token,
            started: false,
            finished: false,
            succeeded: false,
            last_activity: Utc::now(),
            progress: None,
            latest_progress: None,
            generated_uri: None,
            found: None,
            all_data: None,
            failure: None,
            post_fetch_error: None,
            job: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

pub struct ClientRequest {
    pub identifier: String,
    pub uri: String,
    pub client_name: String,
    pub persistence: Persistence,
    pub global: bool,
    pub verbosity: u32,
    pub max_retries: i32,
    pub kind: RequestKind,
    state: Mutex<RequestState>,
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("identifier", &self.identifier)
            .field("uri", &self.uri)
            .field("client_name", &self.client_name)
            .field("persistence", &self.persistence)
            .field("global", &self.global)
            .field("kind", &self.kind.type_name())
            .finish()
    }
}

impl ClientRequest {
    pub fn new(common: RequestCommon, client_name: &str, kind: RequestKind) -> ClientRequest {
        // Global requests report everything; watchers apply their own mask.
        let verbosity = if common.global {
            VERBOSITY_ALL
        } else {
            common.verbosity
        };
        ClientRequest {
            identifier: common.identifier,
            uri: common.uri,
            client_name: client_name.to_string(),
            persistence: common.persistence,
            global: common.global,
            verbosity,
            max_retries: common.max_retries,
            kind,
            state: Mutex::new(RequestState::new(common.priority, common.client_token)),
        }
    }

    pub fn from_get(msg: ClientGet, client_name: &str) -> Result<ClientRequest, MessageInvalid> {
        if let ReturnType::Disk { filename, .. } = &msg.return_type {
            if filename.exists() {
                return Err(MessageInvalid::new(
                    ProtocolErrorCode::DiskTargetExists,
                    filename.display().to_string(),
                ));
            }
        }
        let kind = RequestKind::Download(DownloadSpec {
            return_type: msg.return_type,
            context: msg.context,
        });
        Ok(ClientRequest::new(msg.common, client_name, kind))
    }

    pub fn from_put(
        msg: ClientPut,
        client_name: &str,
        buckets: &BucketFactory,
    ) -> Result<ClientRequest, MessageInvalid> {
        let source = UploadSource::accept(msg.source, msg.common.persistence, buckets)?;
        let kind = RequestKind::UploadFile(UploadSpec {
            source,
            content_type: msg.content_type,
            target_filename: msg.target_filename,
            get_chk_only: msg.get_chk_only,
            dont_compress: msg.dont_compress,
        });
        Ok(ClientRequest::new(msg.common, client_name, kind))
    }

    pub fn from_put_dir(
        msg: ClientPutComplexDir,
        client_name: &str,
        buckets: &BucketFactory,
        max_files: usize,
    ) -> Result<ClientRequest, MessageInvalid> {
        if msg.files.len() > max_files {
            return Err(MessageInvalid::new(
                ProtocolErrorCode::TooManyFilesInInsert,
                format!("{} files, limit is {}", msg.files.len(), max_files),
            ));
        }
        let persistence = msg.common.persistence;
        let mut tree = DirTree::new();
        let mut accepted: Vec<BucketRef> = Vec::new();
        for DirFileSpec {
            name,
            source,
            content_type,
        } in msg.files
        {
            let accepted_file = UploadSource::accept(source, persistence, buckets);
            let result = accepted_file.and_then(|source| {
                if let UploadSource::Direct(bucket) = &source {
                    accepted.push(Arc::clone(bucket));
                }
                tree.insert(
                    &name,
                    DirFile {
                        source,
                        content_type,
                    },
                )
            });
            if let Err(e) = result {
                for bucket in &accepted {
                    bucket.free();
                }
                return Err(e);
            }
        }
        let kind = RequestKind::UploadDirectory(DirectorySpec {
            tree,
            default_name: msg.default_name,
            get_chk_only: msg.get_chk_only,
            dont_compress: msg.dont_compress,
        });
        Ok(ClientRequest::new(msg.common, client_name, kind))
    }

    pub fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::new(self.identifier.clone(), self.global)
    }

    pub fn store_key(&self) -> StoreKey {
        StoreKey::new(self.global, &self.client_name, &self.identifier)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_persistent()
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.kind.failure_kind()
    }

    pub fn return_type(&self) -> Option<&ReturnType> {
        match &self.kind {
            RequestKind::Download(spec) => Some(&spec.return_type),
            _ => None,
        }
    }

    /// Whether this request's client asked for messages like `msg`.
    pub fn wants(&self, msg: &ServerMessage) -> bool {
        let bit = msg.verbosity();
        bit == 0 || self.verbosity & bit != 0
    }

    pub fn fetch_job(&self, state: &RequestState) -> Option<FetchJob> {
        match &self.kind {
            RequestKind::Download(spec) => Some(FetchJob {
                identifier: self.identifier.clone(),
                uri: self.uri.clone(),
                priority: state.priority,
                context: spec.context.clone(),
            }),
            _ => None,
        }
    }

    pub fn insert_job(&self, state: &RequestState) -> Option<InsertJob> {
        let (payload, get_chk_only, dont_compress) = match &self.kind {
            RequestKind::Download(_) => return None,
            RequestKind::UploadFile(spec) => (
                InsertPayload::Single {
                    data: spec.source.insert_data(),
                    content_type: spec.content_type.clone(),
                    target_filename: spec.target_filename.clone(),
                },
                spec.get_chk_only,
                spec.dont_compress,
            ),
            RequestKind::UploadDirectory(spec) => (
                InsertPayload::Directory {
                    files: spec
                        .tree
                        .files()
                        .into_iter()
                        .map(|(path, file)| InsertFile {
                            path,
                            data: file.source.insert_data(),
                            content_type: file.content_type.clone(),
                        })
                        .collect(),
                    default_name: spec.default_name.clone(),
                },
                spec.get_chk_only,
                spec.dont_compress,
            ),
        };
        Some(InsertJob {
            identifier: self.identifier.clone(),
            uri: self.uri.clone(),
            priority: state.priority,
            payload,
            get_chk_only,
            dont_compress,
            max_retries: self.max_retries,
        })
    }

    /// Frees the buckets this request owns. Client files used as upload
    /// sources are left alone.
    pub fn release_buckets(&self) {
        match &self.kind {
            RequestKind::Download(_) => {}
            RequestKind::UploadFile(spec) => {
                if let Some(bucket) = spec.source.bucket() {
                    bucket.free();
                }
            }
            RequestKind::UploadDirectory(spec) => {
                for (_, file) in spec.tree.files() {
                    if let Some(bucket) = file.source.bucket() {
                        bucket.free();
                    }
                }
            }
        }
    }

    /// The `PersistentGet`/`PersistentPut`/`PersistentPutDir` message
    /// describing this request.
    pub fn persistent_tag(&self, state: &RequestState) -> Result<ServerMessage, FieldSetError> {
        let mut fs = FieldSet::new();
        fs.put_single("Identifier", &self.identifier)?;
        fs.put_single("URI", &self.uri)?;
        fs.put_single("Verbosity", self.verbosity)?;
        fs.put_single("PersistenceType", self.persistence.as_str())?;
        fs.put_single("PriorityClass", state.priority)?;
        if let Some(token) = &state.client_token {
            fs.put_single("ClientToken", token)?;
        }
        fs.put_single("Global", self.global)?;
        fs.put_single("MaxRetries", self.max_retries)?;
        fs.put_single("Started", state.started)?;

        match &self.kind {
            RequestKind::Download(spec) => {
                fs.put_single("ReturnType", spec.return_type.as_str())?;
                if let ReturnType::Disk {
                    filename,
                    temp_filename,
                } = &spec.return_type
                {
                    fs.put_single("Filename", filename.display())?;
                    fs.put_single("TempFilename", temp_filename.display())?;
                }
                if let Some(max) = spec.context.max_size {
                    fs.put_single("MaxSize", max)?;
                }
                Ok(ServerMessage::PersistentGet(fs))
            }
            RequestKind::UploadFile(spec) => {
                fs.put_single("UploadFrom", spec.source.upload_from())?;
                match &spec.source {
                    UploadSource::Direct(data) => {
                        fs.put_single("DataLength", data.size())?;
                    }
                    UploadSource::Disk { filename, data } => {
                        fs.put_single("Filename", filename.display())?;
                        fs.put_single("DataLength", data.size())?;
                    }
                    UploadSource::Redirect(target) => {
                        fs.put_single("TargetURI", target)?;
                    }
                }
                if let Some(ct) = &spec.content_type {
                    fs.put_single("Metadata.ContentType", ct)?;
                }
                if let Some(name) = &spec.target_filename {
                    fs.put_single("TargetFilename", name)?;
                }
                fs.put_single("GetCHKOnly", spec.get_chk_only)?;
                fs.put_single("DontCompress", spec.dont_compress)?;
                Ok(ServerMessage::PersistentPut(fs))
            }
            RequestKind::UploadDirectory(spec) => {
                for (n, (path, file)) in spec.tree.files().into_iter().enumerate() {
                    let prefix = format!("Files.{}.", n);
                    fs.put_single(&format!("{}Name", prefix), path)?;
                    fs.put_single(&format!("{}UploadFrom", prefix), file.source.upload_from())?;
                    match &file.source {
                        UploadSource::Redirect(target) => {
                            fs.put_single(&format!("{}TargetURI", prefix), target)?;
                        }
                        source => {
                            fs.put_single(&format!("{}DataLength", prefix), source.data_length())?;
                        }
                    }
                    if let Some(ct) = &file.content_type {
                        fs.put_single(&format!("{}Metadata.ContentType", prefix), ct)?;
                    }
                }
                if let Some(name) = &spec.default_name {
                    fs.put_single("DefaultName", name)?;
                }
                fs.put_single("GetCHKOnly", spec.get_chk_only)?;
                fs.put_single("DontCompress", spec.dont_compress)?;
                Ok(ServerMessage::PersistentPutDir(fs))
            }
        }
    }

    /// The single terminal message of a finished request.
    pub fn terminal_message(&self, state: &RequestState) -> Option<ServerMessage> {
        if !state.finished {
            return None;
        }
        let id = self.request_id();
        let msg = match (&self.kind, state.succeeded) {
            (RequestKind::Download(_), true) => {
                let found = state.found.clone().unwrap_or_default();
                ServerMessage::DataFound {
                    request: id,
                    mime: found.mime,
                    length: found.length,
                }
            }
            (_, true) => ServerMessage::PutSuccessful(id, state.generated_uri.clone()),
            (kind, false) => {
                let failure = state
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureRecord::cancelled(kind.failure_kind()));
                match kind {
                    RequestKind::Download(_) => ServerMessage::GetFailed(id, failure),
                    _ => ServerMessage::PutFailed(id, failure),
                }
            }
        };
        Some(msg)
    }

    /// The `AllData` message for a finished direct download, if the data is
    /// still held.
    pub fn all_data_message(&self, state: &RequestState) -> Option<ServerMessage> {
        let data = state.all_data.clone()?;
        Some(ServerMessage::AllData {
            request: self.request_id(),
            mime: state.found.as_ref().and_then(|f| f.mime.clone()),
            data,
        })
    }

    /// Everything a client needs to catch up on this request: its tag, the
    /// generated URI, the latest progress and the terminal message.
    pub fn status_messages(
        &self,
        state: &RequestState,
        include_tag: bool,
        include_data: bool,
    ) -> Result<Vec<ServerMessage>, FieldSetError> {
        let mut out = Vec::new();
        if include_tag {
            out.push(self.persistent_tag(state)?);
        }
        if let Some(uri) = &state.generated_uri {
            if !matches!(self.kind, RequestKind::Download(_)) {
                out.push(ServerMessage::UriGenerated(self.request_id(), uri.clone()));
            }
        }
        if !state.finished {
            if let Some(progress) = &state.latest_progress {
                out.push(progress.clone());
            }
        }
        if let Some(terminal) = self.terminal_message(state) {
            out.push(terminal);
        }
        if let Some(invalid) = &state.post_fetch_error {
            out.push(ServerMessage::protocol_error(invalid, false));
        }
        if include_data {
            if let Some(all_data) = self.all_data_message(state) {
                out.push(all_data);
            }
        }
        Ok(out)
    }
}
