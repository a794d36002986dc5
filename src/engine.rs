// Copyright 2020 Joyent, Inc.

//! The contract between the request manager and the content engine that
//! performs the actual fetches and inserts.
//!
//! Submitting a job returns a [`JobHandle`]: a channel of [`JobEvent`]s plus a
//! control handle for cancellation and priority changes. An engine emits any
//! number of progress events followed by exactly one terminal event. The
//! manager tolerates engines that misbehave (events after the terminal one are
//! discarded, a closed channel without a terminal event is a failure).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use slog::{debug, o, Drain, Logger};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketRef, MemoryBucket};
use crate::request::failure::{fetch_codes, insert_codes};

pub const VERBOSITY_SPLITFILE_PROGRESS: u32 = 1;
pub const VERBOSITY_SENDING_TO_NETWORK: u32 = 2;
pub const VERBOSITY_EXPECTED_MIME: u32 = 32;
pub const VERBOSITY_EXPECTED_DATA_LENGTH: u32 = 64;
pub const VERBOSITY_PUT_FETCHABLE: u32 = 256;
pub const VERBOSITY_COMPRESSION: u32 = 512;
pub const VERBOSITY_ALL: u32 = i32::max_value() as u32;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitfileProgress {
    pub total: u32,
    pub required: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub fatally_failed: u32,
    pub finalized_total: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Splitfile(SplitfileProgress),
    SendingToNetwork,
    ExpectedMime(String),
    ExpectedDataLength(u64),
    StartedCompression {
        codec: u32,
    },
    FinishedCompression {
        codec: u32,
        original_size: u64,
        compressed_size: u64,
    },
}

impl ProgressEvent {
    /// The verbosity bit a client must set to see this event.
    pub fn verbosity(&self) -> u32 {
        match self {
            ProgressEvent::Splitfile(_) => VERBOSITY_SPLITFILE_PROGRESS,
            ProgressEvent::SendingToNetwork => VERBOSITY_SENDING_TO_NETWORK,
            ProgressEvent::ExpectedMime(_) => VERBOSITY_EXPECTED_MIME,
            ProgressEvent::ExpectedDataLength(_) => {
                VERBOSITY_EXPECTED_DATA_LENGTH
            }
            ProgressEvent::StartedCompression { .. }
            | ProgressEvent::FinishedCompression { .. } => {
                VERBOSITY_COMPRESSION
            }
        }
    }
}

/// Typed failure detail as reported by the engine. Descriptions are derived
/// from `code` when the failure is recorded on the request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobFailure {
    pub code: u32,
    pub extra_description: Option<String>,
    pub redirect_uri: Option<String>,
    pub error_counts: BTreeMap<u32, u32>,
    pub expected_data_length: Option<u64>,
    pub expected_mime: Option<String>,
    pub finalized_expected: bool,
}

impl JobFailure {
    pub fn new(code: u32) -> JobFailure {
        JobFailure {
            code,
            ..JobFailure::default()
        }
    }

    pub fn with_extra(code: u32, extra: impl Into<String>) -> JobFailure {
        JobFailure {
            code,
            extra_description: Some(extra.into()),
            ..JobFailure::default()
        }
    }
}

#[derive(Clone, Debug)]
pub enum JobEvent {
    Progress(ProgressEvent),
    UriGenerated(String),
    Fetchable(String),
    FetchSucceeded {
        data: BucketRef,
        mime: Option<String>,
    },
    InsertSucceeded {
        uri: String,
    },
    Failed(JobFailure),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            JobEvent::FetchSucceeded { .. }
            | JobEvent::InsertSucceeded { .. }
            | JobEvent::Failed(_) => true,
            _ => false,
        }
    }
}

/// Limits applied to a fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchContext {
    pub max_size: Option<u64>,
    pub max_temp_size: Option<u64>,
    pub max_retries: i32,
    pub ignore_ds: bool,
    pub ds_only: bool,
}

#[derive(Clone, Debug)]
pub struct FetchJob {
    pub identifier: String,
    pub uri: String,
    pub priority: u8,
    pub context: FetchContext,
}

#[derive(Clone, Debug)]
pub enum InsertData {
    Bucket(BucketRef),
    Redirect(String),
}

#[derive(Clone, Debug)]
pub struct InsertFile {
    pub path: String,
    pub data: InsertData,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub enum InsertPayload {
    Single {
        data: InsertData,
        content_type: Option<String>,
        target_filename: Option<String>,
    },
    Directory {
        files: Vec<InsertFile>,
        default_name: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct InsertJob {
    pub identifier: String,
    pub uri: String,
    pub priority: u8,
    pub payload: InsertPayload,
    pub get_chk_only: bool,
    pub dont_compress: bool,
    pub max_retries: i32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job rejected ({code}): {reason}")]
    Rejected { code: u32, reason: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

pub trait JobControl: Send + Sync {
    fn cancel(&self);

    fn set_priority(&self, priority: u8);
}

pub struct JobHandle {
    pub events: mpsc::UnboundedReceiver<JobEvent>,
    pub control: Arc<dyn JobControl>,
}

pub trait Engine: Send + Sync {
    fn fetch(&self, job: FetchJob) -> Result<JobHandle, EngineError>;

    fn insert(&self, job: InsertJob) -> Result<JobHandle, EngineError>;
}

/// Sending side of a job's event channel, for engine implementations.
#[derive(Clone)]
pub struct JobReporter {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobReporter {
    pub fn channel() -> (JobReporter, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobReporter { tx }, rx)
    }

    /// Returns false once the manager has stopped listening.
    pub fn report(&self, event: JobEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn progress(&self, event: ProgressEvent) -> bool {
        self.report(JobEvent::Progress(event))
    }

    pub fn fail(&self, failure: JobFailure) -> bool {
        self.report(JobEvent::Failed(failure))
    }
}

/// Job control for engines that only need cooperative cancellation.
pub struct TokenControl {
    pub token: CancellationToken,
    pub priority: Mutex<u8>,
}

impl TokenControl {
    pub fn new(priority: u8) -> TokenControl {
        TokenControl {
            token: CancellationToken::new(),
            priority: Mutex::new(priority),
        }
    }
}

impl JobControl for TokenControl {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn set_priority(&self, priority: u8) {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner()) = priority;
    }
}

/// Engine that keeps inserted content in process memory and serves fetches
/// from it. Content hash keys are derived from the data; other key types are
/// stored under the URI they were inserted to.
pub struct MemoryEngine {
    content: Arc<Mutex<HashMap<String, (bytes::Bytes, Option<String>)>>>,
    log: Logger,
}

impl MemoryEngine {
    pub fn new(log: Option<&Logger>) -> MemoryEngine {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        MemoryEngine {
            content: Arc::new(Mutex::new(HashMap::new())),
            log,
        }
    }

    fn key_for(uri: &str, data: &[u8]) -> String {
        if uri.starts_with("CHK@") {
            let mut hasher = DefaultHasher::new();
            data.hash(&mut hasher);
            format!("CHK@{}", hex::encode(hasher.finish().to_be_bytes()))
        } else {
            uri.to_string()
        }
    }

    fn lookup_key(uri: &str) -> &str {
        uri.trim_end_matches('/')
    }
}

impl Engine for MemoryEngine {
    fn fetch(&self, job: FetchJob) -> Result<JobHandle, EngineError> {
        let (reporter, events) = JobReporter::channel();
        let control = Arc::new(TokenControl::new(job.priority));
        let token = control.token.clone();
        let content = Arc::clone(&self.content);
        let log = self.log.new(o!("identifier" => job.identifier.clone()));

        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            let found = content
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(MemoryEngine::lookup_key(&job.uri))
                .cloned();
            match found {
                Some((data, mime)) => {
                    let len = data.len() as u64;
                    if job.context.max_size.map_or(false, |max| len > max) {
                        reporter.fail(JobFailure {
                            expected_data_length: Some(len),
                            expected_mime: mime,
                            finalized_expected: true,
                            ..JobFailure::new(fetch_codes::TOO_BIG)
                        });
                        return;
                    }
                    reporter.progress(ProgressEvent::ExpectedDataLength(len));
                    if let Some(mime) = &mime {
                        reporter.progress(ProgressEvent::ExpectedMime(
                            mime.clone(),
                        ));
                    }
                    reporter.progress(ProgressEvent::Splitfile(
                        SplitfileProgress {
                            total: 1,
                            required: 1,
                            succeeded: 1,
                            finalized_total: true,
                            ..SplitfileProgress::default()
                        },
                    ));
                    debug!(log, "serving fetch from memory"; "length" => len);
                    reporter.report(JobEvent::FetchSucceeded {
                        data: Arc::new(MemoryBucket::new(data)),
                        mime,
                    });
                }
                None => {
                    reporter.fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
                }
            }
        });

        Ok(JobHandle { events, control })
    }

    fn insert(&self, job: InsertJob) -> Result<JobHandle, EngineError> {
        let (reporter, events) = JobReporter::channel();
        let control = Arc::new(TokenControl::new(job.priority));
        let token = control.token.clone();
        let content = Arc::clone(&self.content);
        let log = self.log.new(o!("identifier" => job.identifier.clone()));

        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            let (data, content_type) = match &job.payload {
                InsertPayload::Single {
                    data: InsertData::Bucket(bucket),
                    content_type,
                    ..
                } => match bucket.read_all() {
                    Ok(data) => (data, content_type.clone()),
                    Err(e) => {
                        reporter.fail(JobFailure::with_extra(
                            insert_codes::BUCKET_ERROR,
                            e.to_string(),
                        ));
                        return;
                    }
                },
                InsertPayload::Single {
                    data: InsertData::Redirect(target),
                    ..
                } => (bytes::Bytes::from(target.clone().into_bytes()), None),
                InsertPayload::Directory { files, .. } => {
                    let mut manifest = String::new();
                    for file in files {
                        manifest.push_str(&file.path);
                        manifest.push('\n');
                    }
                    (bytes::Bytes::from(manifest.into_bytes()), None)
                }
            };

            if !job.dont_compress && data.len() > 1024 {
                reporter.progress(ProgressEvent::StartedCompression { codec: 0 });
                reporter.progress(ProgressEvent::FinishedCompression {
                    codec: 0,
                    original_size: data.len() as u64,
                    compressed_size: data.len() as u64,
                });
            }

            let key = MemoryEngine::key_for(&job.uri, &data);
            reporter.report(JobEvent::UriGenerated(key.clone()));
            if job.get_chk_only {
                reporter.report(JobEvent::InsertSucceeded { uri: key });
                return;
            }
            reporter.progress(ProgressEvent::SendingToNetwork);

            let collision = {
                let mut content =
                    content.lock().unwrap_or_else(|e| e.into_inner());
                match content.get(&key) {
                    Some((existing, _)) if *existing != data => true,
                    _ => {
                        content.insert(key.clone(), (data, content_type));
                        false
                    }
                }
            };
            if collision {
                reporter.fail(JobFailure::new(insert_codes::COLLISION));
                return;
            }
            debug!(log, "stored insert in memory"; "uri" => &key);
            reporter.report(JobEvent::Fetchable(key.clone()));
            reporter.report(JobEvent::InsertSucceeded { uri: key });
        });

        Ok(JobHandle { events, control })
    }
}
