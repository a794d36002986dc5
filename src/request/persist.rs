// Copyright 2020 Joyent, Inc.

//! Conversion of requests to and from the field sets kept in the request
//! stores.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use thiserror::Error;

use crate::bucket::{BucketFactory, BucketRef, FileBucket, NullBucket};
use crate::engine::FetchContext;
use crate::errors::{FieldSetError, MessageInvalid, ProtocolErrorCode};
use crate::fieldset::FieldSet;
use crate::message::client::RequestCommon;
use crate::request::dir::{DirFile, DirTree};
use crate::request::failure::FailureRecord;
use crate::request::{
    ClientRequest, DirectorySpec, DownloadSpec, FoundData, Persistence,
    RequestKind, ReturnType, UploadSource, UploadSpec,
};

#[derive(Debug, Error)]
pub enum PersistenceParseError {
    #[error("persisted request is missing {0}")]
    Missing(&'static str),

    #[error("persisted request has invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },

    #[error("persisted request is malformed: {0}")]
    FieldSet(#[from] FieldSetError),

    #[error("persisted request data is gone: {0}")]
    Bucket(#[from] std::io::Error),
}

fn put_common(request: &ClientRequest, fs: &mut FieldSet) -> Result<(), FieldSetError> {
    let state = request.state();
    fs.put_single("Type", request.kind.type_name())?;
    fs.put_single("Identifier", &request.identifier)?;
    fs.put_single("URI", &request.uri)?;
    fs.put_single("ClientName", &request.client_name)?;
    fs.put_single("Global", request.global)?;
    fs.put_single("Persistence", request.persistence.as_str())?;
    fs.put_single("PriorityClass", state.priority)?;
    fs.put_single("Verbosity", request.verbosity)?;
    if let Some(token) = &state.client_token {
        fs.put_single("ClientToken", token)?;
    }
    fs.put_single("Started", state.started)?;
    fs.put_single("Finished", state.finished)?;
    fs.put_single("Succeeded", state.succeeded)?;
    fs.put_single("LastActivity", state.last_activity.timestamp_millis())?;
    fs.put_single("MaxRetries", request.max_retries)
}

fn put_source(
    prefix: &str,
    source: &UploadSource,
    finished: bool,
    fs: &mut FieldSet,
) -> Result<(), FieldSetError> {
    let key = |name: &str| format!("{}{}", prefix, name);
    fs.put_single(&key("UploadFrom"), source.upload_from())?;
    match source {
        UploadSource::Direct(data) => {
            fs.put_single(&key("DataLength"), data.size())?;
            // The data is only needed again if the job has to be restarted.
            if !finished {
                if let Some(reference) = data.persist_ref() {
                    fs.put_subset(&key("Data"), reference)?;
                }
            }
        }
        UploadSource::Disk { filename, data } => {
            fs.put_single(&key("DataLength"), data.size())?;
            fs.put_single(&key("Filename"), filename.display())?;
        }
        UploadSource::Redirect(target) => {
            fs.put_single(&key("TargetURI"), target)?;
        }
    }
    Ok(())
}

/// Serializes everything needed to rebuild `request` after a restart.
pub fn to_fieldset(request: &ClientRequest) -> Result<FieldSet, FieldSetError> {
    let mut fs = FieldSet::new();
    put_common(request, &mut fs)?;
    let state = request.state();

    match &request.kind {
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
            if let Some(max) = spec.context.max_temp_size {
                fs.put_single("MaxTempSize", max)?;
            }
            fs.put_single("IgnoreDS", spec.context.ignore_ds)?;
            fs.put_single("DSOnly", spec.context.ds_only)?;
            if let Some(found) = &state.found {
                fs.put_single("FoundDataLength", found.length)?;
                if let Some(mime) = &found.mime {
                    fs.put_single("FoundDataMimeType", mime)?;
                }
            }
            if let Some(failure) = &state.failure {
                fs.put_subset("GetFailed", failure.to_fieldset(false)?)?;
            }
            if let Some(invalid) = &state.post_fetch_error {
                let mut error = FieldSet::new();
                error.put_single("Code", invalid.code.code())?;
                if let Some(detail) = &invalid.detail {
                    error.put_single("ExtraDescription", detail)?;
                }
                fs.put_subset("PostFetchProtocolError", error)?;
            }
        }
        RequestKind::UploadFile(spec) => {
            put_source("", &spec.source, state.finished, &mut fs)?;
            if let Some(ct) = &spec.content_type {
                fs.put_single("Metadata.ContentType", ct)?;
            }
            if let Some(name) = &spec.target_filename {
                fs.put_single("TargetFilename", name)?;
            }
            fs.put_single("GetCHKOnly", spec.get_chk_only)?;
            fs.put_single("DontCompress", spec.dont_compress)?;
        }
        RequestKind::UploadDirectory(spec) => {
            for (n, (path, file)) in spec.tree.files().into_iter().enumerate() {
                let prefix = format!("Files.{}.", n);
                fs.put_single(&format!("{}Name", prefix), path)?;
                put_source(&prefix, &file.source, state.finished, &mut fs)?;
                if let Some(ct) = &file.content_type {
                    fs.put_single(&format!("{}Metadata.ContentType", prefix), ct)?;
                }
            }
            if let Some(name) = &spec.default_name {
                fs.put_single("DefaultName", name)?;
            }
            fs.put_single("GetCHKOnly", spec.get_chk_only)?;
            fs.put_single("DontCompress", spec.dont_compress)?;
        }
    }

    if !matches!(request.kind, RequestKind::Download(_)) {
        if let Some(uri) = &state.generated_uri {
            fs.put_single("GeneratedURI", uri)?;
        }
        if let Some(failure) = &state.failure {
            fs.put_subset("PutFailed", failure.to_fieldset(false)?)?;
        }
    }
    Ok(fs)
}

fn required<'a>(fs: &'a FieldSet, key: &'static str) -> Result<&'a str, PersistenceParseError> {
    fs.get_nonempty(key).ok_or(PersistenceParseError::Missing(key))
}

fn restore_source(
    fs: &FieldSet,
    prefix: &str,
    finished: bool,
    buckets: &BucketFactory,
) -> Result<UploadSource, PersistenceParseError> {
    let key = |name: &str| format!("{}{}", prefix, name);
    let upload_from = fs.get_nonempty(&key("UploadFrom")).unwrap_or("direct");
    match upload_from.to_ascii_lowercase().as_str() {
        "direct" => {
            let data: BucketRef = match fs.subset(&key("Data")) {
                Some(reference) => buckets.restore(reference)?,
                None if finished => Arc::new(NullBucket),
                None => return Err(PersistenceParseError::Missing("Data")),
            };
            Ok(UploadSource::Direct(data))
        }
        "disk" => {
            let filename = PathBuf::from(
                fs.get_nonempty(&key("Filename"))
                    .ok_or(PersistenceParseError::Missing("Filename"))?,
            );
            let data: BucketRef = match FileBucket::open(&filename, false) {
                Ok(bucket) => Arc::new(bucket),
                Err(_) if finished => Arc::new(NullBucket),
                Err(e) => return Err(e.into()),
            };
            Ok(UploadSource::Disk { filename, data })
        }
        "redirect" => {
            let target = fs
                .get_nonempty(&key("TargetURI"))
                .ok_or(PersistenceParseError::Missing("TargetURI"))?;
            Ok(UploadSource::Redirect(target.to_string()))
        }
        other => Err(PersistenceParseError::Invalid {
            field: "UploadFrom",
            value: other.to_string(),
        }),
    }
}

/// Rebuilds a request written by [`to_fieldset`]. Buckets for unfinished
/// uploads are reopened through `buckets`.
pub fn from_fieldset(
    fs: &FieldSet,
    buckets: &BucketFactory,
) -> Result<ClientRequest, PersistenceParseError> {
    let type_name = required(fs, "Type")?;
    let persistence_raw = required(fs, "Persistence")?;
    let persistence =
        Persistence::parse(persistence_raw).ok_or_else(|| PersistenceParseError::Invalid {
            field: "Persistence",
            value: persistence_raw.to_string(),
        })?;
    let finished = fs.get_bool_or("Finished", false)?;

    let common = RequestCommon {
        identifier: required(fs, "Identifier")?.to_string(),
        uri: required(fs, "URI")?.to_string(),
        global: fs.get_bool_or("Global", false)?,
        persistence,
        priority: fs.get_number_or("PriorityClass", 2u8)?,
        verbosity: fs.get_number_or("Verbosity", 0u32)?,
        client_token: fs.get_nonempty("ClientToken").map(String::from),
        max_retries: fs.get_number_or("MaxRetries", 0i32)?,
    };
    let client_name = required(fs, "ClientName")?;

    let kind = match type_name {
        "GET" => {
            let return_type = match required(fs, "ReturnType")? {
                "direct" => ReturnType::Direct,
                "none" => ReturnType::None,
                "disk" => ReturnType::Disk {
                    filename: PathBuf::from(required(fs, "Filename")?),
                    temp_filename: PathBuf::from(required(fs, "TempFilename")?),
                },
                other => {
                    return Err(PersistenceParseError::Invalid {
                        field: "ReturnType",
                        value: other.to_string(),
                    })
                }
            };
            RequestKind::Download(DownloadSpec {
                return_type,
                context: FetchContext {
                    max_size: fs.get_number("MaxSize")?,
                    max_temp_size: fs.get_number("MaxTempSize")?,
                    max_retries: common.max_retries,
                    ignore_ds: fs.get_bool_or("IgnoreDS", false)?,
                    ds_only: fs.get_bool_or("DSOnly", false)?,
                },
            })
        }
        "PUT" => RequestKind::UploadFile(UploadSpec {
            source: restore_source(fs, "", finished, buckets)?,
            content_type: fs.get_nonempty("Metadata.ContentType").map(String::from),
            target_filename: fs.get_nonempty("TargetFilename").map(String::from),
            get_chk_only: fs.get_bool_or("GetCHKOnly", false)?,
            dont_compress: fs.get_bool_or("DontCompress", false)?,
        }),
        "PUTDIR" => {
            let mut tree = DirTree::new();
            let mut n = 0usize;
            while let Some(name) = fs.get_nonempty(&format!("Files.{}.Name", n)) {
                let prefix = format!("Files.{}.", n);
                let file = DirFile {
                    source: restore_source(fs, &prefix, finished, buckets)?,
                    content_type: fs
                        .get_nonempty(&format!("{}Metadata.ContentType", prefix))
                        .map(String::from),
                };
                tree.insert(name, file)
                    .map_err(|e| PersistenceParseError::Invalid {
                        field: "Files",
                        value: e.to_string(),
                    })?;
                n += 1;
            }
            RequestKind::UploadDirectory(DirectorySpec {
                tree,
                default_name: fs.get_nonempty("DefaultName").map(String::from),
                get_chk_only: fs.get_bool_or("GetCHKOnly", false)?,
                dont_compress: fs.get_bool_or("DontCompress", false)?,
            })
        }
        other => {
            return Err(PersistenceParseError::Invalid {
                field: "Type",
                value: other.to_string(),
            })
        }
    };

    // Verbosity was already widened for global requests when persisted.
    let verbosity = common.verbosity;
    let mut request = ClientRequest::new(common, client_name, kind);
    request.verbosity = verbosity;

    {
        let mut state = request.state();
        state.started = fs.get_bool_or("Started", false)?;
        state.finished = finished;
        state.succeeded = fs.get_bool_or("Succeeded", false)?;
        if let Some(ms) = fs.get_number::<i64>("LastActivity")? {
            if let Some(when) = Utc.timestamp_millis_opt(ms).single() {
                state.last_activity = when;
            }
        }
        if let Some(length) = fs.get_number::<u64>("FoundDataLength")? {
            state.found = Some(FoundData {
                length,
                mime: fs.get_nonempty("FoundDataMimeType").map(String::from),
            });
        }
        state.generated_uri = fs.get_nonempty("GeneratedURI").map(String::from);
        let failed = fs.subset("GetFailed").or_else(|| fs.subset("PutFailed"));
        if let Some(failed) = failed {
            state.failure = Some(FailureRecord::from_fieldset(
                request.failure_kind(),
                failed,
            )?);
        }
        if let Some(error) = fs.subset("PostFetchProtocolError") {
            let code: u32 = error
                .get_number("Code")?
                .ok_or(PersistenceParseError::Missing("PostFetchProtocolError.Code"))?;
            let code = num_traits::FromPrimitive::from_u32(code).unwrap_or(
                ProtocolErrorCode::InternalError,
            );
            let mut invalid = MessageInvalid::bare(code);
            invalid.detail = error.get_nonempty("ExtraDescription").map(String::from);
            state.post_fetch_error =
                Some(invalid.for_request(Some(&request.identifier), request.global));
        }
    }
    Ok(request)
}
