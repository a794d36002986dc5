// Copyright 2020 Joyent, Inc.

//! Messages the server sends to clients.

use bytes::Bytes;

use crate::engine::{
    ProgressEvent, SplitfileProgress, VERBOSITY_COMPRESSION,
    VERBOSITY_EXPECTED_DATA_LENGTH, VERBOSITY_EXPECTED_MIME,
    VERBOSITY_PUT_FETCHABLE, VERBOSITY_SENDING_TO_NETWORK,
    VERBOSITY_SPLITFILE_PROGRESS,
};
use crate::errors::{FieldSetError, MessageInvalid, ProtocolErrorCode};
use crate::fieldset::FieldSet;
use crate::message::names;
use crate::protocol::RawMessage;
use crate::request::failure::FailureRecord;

pub const FCP_VERSION: &str = "2.0";

/// The request a server message is about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId {
    pub identifier: String,
    pub global: bool,
}

impl RequestId {
    pub fn new(identifier: impl Into<String>, global: bool) -> RequestId {
        RequestId {
            identifier: identifier.into(),
            global,
        }
    }

    fn put(&self, fs: &mut FieldSet) -> Result<(), FieldSetError> {
        fs.put_single("Identifier", &self.identifier)?;
        fs.put_single("Global", self.global)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    NodeHello {
        node: String,
        version: String,
        connection_identifier: String,
    },
    CloseConnectionDuplicateClientName,
    ProtocolError {
        code: ProtocolErrorCode,
        extra_description: Option<String>,
        fatal: bool,
        identifier: Option<String>,
        global: bool,
    },
    IdentifierCollision(RequestId),
    SimpleProgress(RequestId, SplitfileProgress),
    StartedCompression(RequestId, u32),
    FinishedCompression {
        request: RequestId,
        codec: u32,
        original_size: u64,
        compressed_size: u64,
    },
    ExpectedMime(RequestId, String),
    ExpectedDataLength(RequestId, u64),
    SendingToNetwork(RequestId),
    PutFetchable(RequestId, String),
    UriGenerated(RequestId, String),
    DataFound {
        request: RequestId,
        mime: Option<String>,
        length: u64,
    },
    AllData {
        request: RequestId,
        mime: Option<String>,
        data: Bytes,
    },
    GetFailed(RequestId, FailureRecord),
    PutSuccessful(RequestId, Option<String>),
    PutFailed(RequestId, FailureRecord),
    PersistentGet(FieldSet),
    PersistentPut(FieldSet),
    PersistentPutDir(FieldSet),
    PersistentRequestModified {
        request: RequestId,
        client_token: Option<String>,
        priority: Option<u8>,
    },
    PersistentRequestRemoved(RequestId),
    EndListPersistentRequests,
}

impl ServerMessage {
    pub fn protocol_error(invalid: &MessageInvalid, fatal: bool) -> ServerMessage {
        ServerMessage::ProtocolError {
            code: invalid.code,
            extra_description: invalid.detail.clone(),
            fatal,
            identifier: invalid.identifier.clone(),
            global: invalid.global,
        }
    }

    pub fn progress(request: RequestId, event: &ProgressEvent) -> ServerMessage {
        match event {
            ProgressEvent::Splitfile(p) => ServerMessage::SimpleProgress(request, p.clone()),
            ProgressEvent::SendingToNetwork => ServerMessage::SendingToNetwork(request),
            ProgressEvent::ExpectedMime(mime) => ServerMessage::ExpectedMime(request, mime.clone()),
            ProgressEvent::ExpectedDataLength(length) => {
                ServerMessage::ExpectedDataLength(request, *length)
            }
            ProgressEvent::StartedCompression { codec } => {
                ServerMessage::StartedCompression(request, *codec)
            }
            ProgressEvent::FinishedCompression {
                codec,
                original_size,
                compressed_size,
            } => ServerMessage::FinishedCompression {
                request,
                codec: *codec,
                original_size: *original_size,
                compressed_size: *compressed_size,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::NodeHello { .. } => names::NODE_HELLO,
            ServerMessage::CloseConnectionDuplicateClientName => {
                names::CLOSE_CONNECTION_DUPLICATE_CLIENT_NAME
            }
            ServerMessage::ProtocolError { .. } => names::PROTOCOL_ERROR,
            ServerMessage::IdentifierCollision(_) => names::IDENTIFIER_COLLISION,
            ServerMessage::SimpleProgress(..) => names::SIMPLE_PROGRESS,
            ServerMessage::StartedCompression(..) => names::STARTED_COMPRESSION,
            ServerMessage::FinishedCompression { .. } => names::FINISHED_COMPRESSION,
            ServerMessage::ExpectedMime(..) => names::EXPECTED_MIME,
            ServerMessage::ExpectedDataLength(..) => names::EXPECTED_DATA_LENGTH,
            ServerMessage::SendingToNetwork(_) => names::SENDING_TO_NETWORK,
            ServerMessage::PutFetchable(..) => names::PUT_FETCHABLE,
            ServerMessage::UriGenerated(..) => names::URI_GENERATED,
            ServerMessage::DataFound { .. } => names::DATA_FOUND,
            ServerMessage::AllData { .. } => names::ALL_DATA,
            ServerMessage::GetFailed(..) => names::GET_FAILED,
            ServerMessage::PutSuccessful(..) => names::PUT_SUCCESSFUL,
            ServerMessage::PutFailed(..) => names::PUT_FAILED,
            ServerMessage::PersistentGet(_) => names::PERSISTENT_GET,
            ServerMessage::PersistentPut(_) => names::PERSISTENT_PUT,
            ServerMessage::PersistentPutDir(_) => names::PERSISTENT_PUT_DIR,
            ServerMessage::PersistentRequestModified { .. } => {
                names::PERSISTENT_REQUEST_MODIFIED
            }
            ServerMessage::PersistentRequestRemoved(_) => names::PERSISTENT_REQUEST_REMOVED,
            ServerMessage::EndListPersistentRequests => names::END_LIST_PERSISTENT_REQUESTS,
        }
    }

    /// The verbosity bit gating this message. Zero means it is always sent.
    pub fn verbosity(&self) -> u32 {
        match self {
            ServerMessage::SimpleProgress(..) => VERBOSITY_SPLITFILE_PROGRESS,
            ServerMessage::SendingToNetwork(_) => VERBOSITY_SENDING_TO_NETWORK,
            ServerMessage::ExpectedMime(..) => VERBOSITY_EXPECTED_MIME,
            ServerMessage::ExpectedDataLength(..) => VERBOSITY_EXPECTED_DATA_LENGTH,
            ServerMessage::PutFetchable(..) => VERBOSITY_PUT_FETCHABLE,
            ServerMessage::StartedCompression(..)
            | ServerMessage::FinishedCompression { .. } => VERBOSITY_COMPRESSION,
            _ => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ServerMessage::DataFound { .. }
            | ServerMessage::GetFailed(..)
            | ServerMessage::PutSuccessful(..)
            | ServerMessage::PutFailed(..) => true,
            _ => false,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            ServerMessage::IdentifierCollision(r)
            | ServerMessage::SimpleProgress(r, _)
            | ServerMessage::StartedCompression(r, _)
            | ServerMessage::FinishedCompression { request: r, .. }
            | ServerMessage::ExpectedMime(r, _)
            | ServerMessage::ExpectedDataLength(r, _)
            | ServerMessage::SendingToNetwork(r)
            | ServerMessage::PutFetchable(r, _)
            | ServerMessage::UriGenerated(r, _)
            | ServerMessage::DataFound { request: r, .. }
            | ServerMessage::AllData { request: r, .. }
            | ServerMessage::GetFailed(r, _)
            | ServerMessage::PutSuccessful(r, _)
            | ServerMessage::PutFailed(r, _)
            | ServerMessage::PersistentRequestModified { request: r, .. }
            | ServerMessage::PersistentRequestRemoved(r) => Some(&r.identifier),
            ServerMessage::ProtocolError { identifier, .. } => identifier.as_deref(),
            ServerMessage::PersistentGet(fs)
            | ServerMessage::PersistentPut(fs)
            | ServerMessage::PersistentPutDir(fs) => fs.get("Identifier"),
            ServerMessage::NodeHello { .. }
            | ServerMessage::CloseConnectionDuplicateClientName
            | ServerMessage::EndListPersistentRequests => None,
        }
    }

    /// Renders the message for the wire. Fails only if a value cannot be
    /// carried on a line.
    pub fn to_raw(&self) -> Result<RawMessage, FieldSetError> {
        let mut fs = FieldSet::new();
        match self {
            ServerMessage::NodeHello {
                node,
                version,
                connection_identifier,
            } => {
                fs.put_single("FCPVersion", FCP_VERSION)?;
                fs.put_single("Node", node)?;
                fs.put_single("Version", version)?;
                fs.put_single("ConnectionIdentifier", connection_identifier)?;
            }
            ServerMessage::CloseConnectionDuplicateClientName
            | ServerMessage::EndListPersistentRequests => {}
            ServerMessage::ProtocolError {
                code,
                extra_description,
                fatal,
                identifier,
                global,
            } => {
                fs.put_single("Code", code.code())?;
                fs.put_single("CodeDescription", code.description())?;
                if let Some(extra) = extra_description {
                    fs.put_single("ExtraDescription", extra)?;
                }
                fs.put_single("Fatal", fatal)?;
                if let Some(identifier) = identifier {
                    fs.put_single("Identifier", identifier)?;
                }
                fs.put_single("Global", global)?;
            }
            ServerMessage::IdentifierCollision(r)
            | ServerMessage::SendingToNetwork(r)
            | ServerMessage::PersistentRequestRemoved(r) => r.put(&mut fs)?,
            ServerMessage::SimpleProgress(r, p) => {
                fs.put_single("Total", p.total)?;
                fs.put_single("Required", p.required)?;
                fs.put_single("Failed", p.failed)?;
                fs.put_single("FatallyFailed", p.fatally_failed)?;
                fs.put_single("Succeeded", p.succeeded)?;
                fs.put_single("FinalizedTotal", p.finalized_total)?;
                r.put(&mut fs)?;
            }
            ServerMessage::StartedCompression(r, codec) => {
                r.put(&mut fs)?;
                fs.put_single("Codec", codec)?;
            }
            ServerMessage::FinishedCompression {
                request,
                codec,
                original_size,
                compressed_size,
            } => {
                request.put(&mut fs)?;
                fs.put_single("Codec", codec)?;
                fs.put_single("OriginalSize", original_size)?;
                fs.put_single("CompressedSize", compressed_size)?;
            }
            ServerMessage::ExpectedMime(r, mime) => {
                r.put(&mut fs)?;
                fs.put_single("Metadata.ContentType", mime)?;
            }
            ServerMessage::ExpectedDataLength(r, length) => {
                r.put(&mut fs)?;
                fs.put_single("DataLength", length)?;
            }
            ServerMessage::PutFetchable(r, uri) | ServerMessage::UriGenerated(r, uri) => {
                r.put(&mut fs)?;
                fs.put_single("URI", uri)?;
            }
            ServerMessage::DataFound {
                request,
                mime,
                length,
            } => {
                request.put(&mut fs)?;
                if let Some(mime) = mime {
                    fs.put_single("Metadata.ContentType", mime)?;
                }
                fs.put_single("DataLength", length)?;
            }
            ServerMessage::AllData {
                request,
                mime,
                data,
            } => {
                request.put(&mut fs)?;
                fs.put_single("DataLength", data.len())?;
                if let Some(mime) = mime {
                    fs.put_single("Metadata.ContentType", mime)?;
                }
                return Ok(RawMessage::with_payload(self.name(), fs, data.clone()));
            }
            ServerMessage::GetFailed(r, failure) | ServerMessage::PutFailed(r, failure) => {
                fs = failure.to_fieldset(true)?;
                r.put(&mut fs)?;
            }
            ServerMessage::PutSuccessful(r, uri) => {
                r.put(&mut fs)?;
                if let Some(uri) = uri {
                    fs.put_single("URI", uri)?;
                }
            }
            ServerMessage::PersistentGet(tag)
            | ServerMessage::PersistentPut(tag)
            | ServerMessage::PersistentPutDir(tag) => {
                fs = tag.clone();
            }
            ServerMessage::PersistentRequestModified {
                request,
                client_token,
                priority,
            } => {
                request.put(&mut fs)?;
                if let Some(token) = client_token {
                    fs.put_single("ClientToken", token)?;
                }
                if let Some(priority) = priority {
                    fs.put_single("PriorityClass", priority)?;
                }
            }
        }
        Ok(RawMessage::new(self.name(), fs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobFailure;
    use crate::request::failure::{fetch_codes, FailureKind};

    #[test]
    fn protocol_error_fields() {
        let invalid = MessageInvalid::missing("URI").for_request(Some("job1"), false);
        let raw = ServerMessage::protocol_error(&invalid, false).to_raw().unwrap();
        assert_eq!(raw.name, "ProtocolError");
        assert_eq!(raw.get("Code"), Some("5"));
        assert_eq!(raw.get("Fatal"), Some("false"));
        assert_eq!(raw.get("Identifier"), Some("job1"));
        assert_eq!(raw.get("ExtraDescription"), Some("No URI"));
    }

    #[test]
    fn multi_line_values_are_refused() {
        let invalid = MessageInvalid::new(ProtocolErrorCode::InternalError, "first\nsecond");
        match ServerMessage::protocol_error(&invalid, false).to_raw() {
            Err(FieldSetError::InvalidValue { key }) => assert_eq!(key, "ExtraDescription"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn all_data_carries_payload() {
        let msg = ServerMessage::AllData {
            request: RequestId::new("job1", false),
            mime: Some("text/plain".into()),
            data: Bytes::from_static(b"0123456789"),
        };
        let raw = msg.to_raw().unwrap();
        assert_eq!(raw.end_marker, "Data");
        assert_eq!(raw.get("DataLength"), Some("10"));
        assert_eq!(raw.payload.as_deref(), Some(&b"0123456789"[..]));
        assert!(!msg.is_terminal());
    }

    #[test]
    fn get_failed_carries_failure_and_identifier() {
        let record = FailureRecord::from_job(
            FailureKind::Fetch,
            JobFailure::new(fetch_codes::DATA_NOT_FOUND),
        );
        let msg = ServerMessage::GetFailed(RequestId::new("job1", true), record);
        assert!(msg.is_terminal());
        assert_eq!(msg.identifier(), Some("job1"));
        let raw = msg.to_raw().unwrap();
        assert_eq!(raw.get("Code"), Some("13"));
        assert_eq!(raw.get("Global"), Some("true"));
        assert_eq!(raw.get("Fatal"), Some("false"));
    }

    #[test]
    fn progress_messages_map_verbosity() {
        let id = RequestId::new("a", false);
        let cases = vec![
            (ProgressEvent::SendingToNetwork, 2),
            (ProgressEvent::ExpectedMime("text/plain".into()), 32),
            (ProgressEvent::ExpectedDataLength(4), 64),
            (ProgressEvent::StartedCompression { codec: 1 }, 512),
        ];
        for (event, bit) in cases {
            let msg = ServerMessage::progress(id.clone(), &event);
            assert_eq!(msg.verbosity(), bit);
            assert_eq!(msg.verbosity(), event.verbosity());
        }
        assert_eq!(ServerMessage::UriGenerated(id, "CHK@x".into()).verbosity(), 0);
    }
}
