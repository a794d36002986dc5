// Copyright 2020 Joyent, Inc.

//! Error types for framing, message validation and request lifecycle.
//!
//! Three classes of failure are distinguished. Framing and validation errors
//! ([`CodecError`], [`FieldSetError`], [`MessageInvalid`]) are reported back to
//! the client as a `ProtocolError` message. Lifecycle errors
//! ([`LifecycleError`]) have their own typed replies. Job failures never
//! surface here at all: they are captured by the request as a
//! [`FailureRecord`](crate::request::FailureRecord).

use std::fmt;
use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

use crate::store::StoreError;

/// Numeric protocol error codes carried in the `Code` field of a
/// `ProtocolError` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ProtocolErrorCode {
    ClientHelloMustBeFirst = 1,
    NoLateClientHellos = 2,
    MessageParseError = 3,
    UriParseError = 4,
    MissingField = 5,
    ErrorParsingNumber = 6,
    InvalidMessage = 7,
    InvalidField = 8,
    FileNotFound = 9,
    DiskTargetExists = 10,
    SameDirectoryExpected = 11,
    CouldNotCreateFile = 12,
    CouldNotWriteFile = 13,
    CouldNotRenameFile = 14,
    NoSuchIdentifier = 15,
    NotSupported = 16,
    InternalError = 17,
    ShuttingDown = 18,
    NotAFile = 23,
    AccessDenied = 24,
    TooManyFilesInInsert = 34,
    IdentifierCollision = 35,
}

impl ProtocolErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn description(self) -> &'static str {
        match self {
            ProtocolErrorCode::ClientHelloMustBeFirst => {
                "ClientHello must be first message"
            }
            ProtocolErrorCode::NoLateClientHellos => {
                "No late ClientHello's accepted"
            }
            ProtocolErrorCode::MessageParseError => "Unknown message parsing error",
            ProtocolErrorCode::UriParseError => "Error parsing URI",
            ProtocolErrorCode::MissingField => "Missing field",
            ProtocolErrorCode::ErrorParsingNumber => "Error parsing a numeric field",
            ProtocolErrorCode::InvalidMessage => "Don't know what to do with message",
            ProtocolErrorCode::InvalidField => "Invalid field value",
            ProtocolErrorCode::FileNotFound => "File not found, not a file or not readable",
            ProtocolErrorCode::DiskTargetExists => "Disk target exists, refusing to overwrite for security reasons",
            ProtocolErrorCode::SameDirectoryExpected => {
                "Filename and temp filename must be in the same directory (so can rename)"
            }
            ProtocolErrorCode::CouldNotCreateFile => "Could not create file",
            ProtocolErrorCode::CouldNotWriteFile => "Could not write file",
            ProtocolErrorCode::CouldNotRenameFile => "Could not rename file",
            ProtocolErrorCode::NoSuchIdentifier => "No such identifier",
            ProtocolErrorCode::NotSupported => "Not supported",
            ProtocolErrorCode::InternalError => "Internal error",
            ProtocolErrorCode::ShuttingDown => "Shutting down",
            ProtocolErrorCode::NotAFile => "Path does not point to a file",
            ProtocolErrorCode::AccessDenied => "Access denied",
            ProtocolErrorCode::TooManyFilesInInsert => "Too many files in a single folder on a freesite insert",
            ProtocolErrorCode::IdentifierCollision => "Identifier collision",
        }
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Failures raised by [`FieldSet`](crate::fieldset::FieldSet) construction and
/// typed accessors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FieldSetError {
    #[error("key already present: {0}")]
    DuplicateKey(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("value for {key} contains a newline")]
    InvalidValue { key: String },

    #[error("missing end marker")]
    MissingEndMarker,

    #[error("error parsing {key} as a number: {value:?}")]
    NumberParse { key: String, value: String },

    #[error("error parsing {key} as a boolean: {value:?}")]
    BooleanParse { key: String, value: String },

    #[error("missing field {0}")]
    MissingField(String),
}

/// Wire framing failures. All of these leave the input stream in an unknown
/// position, so the connection cannot continue after one.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("message exceeds {limit} lines")]
    TooManyLines { limit: usize },

    #[error("payload of {length} bytes exceeds {limit} byte limit")]
    PayloadTooLarge { length: u64, limit: u64 },

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed message body: {0}")]
    FieldSet(#[from] FieldSetError),

    #[error("cannot determine payload length: {0}")]
    PayloadLength(MessageInvalid),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A message failed validation. Reported to the client as a `ProtocolError`
/// carrying `code`, `detail` and, where known, the request identifier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct MessageInvalid {
    pub code: ProtocolErrorCode,
    pub detail: Option<String>,
    pub identifier: Option<String>,
    pub global: bool,
}

impl fmt::Display for MessageInvalid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.code, detail),
            None => write!(f, "{}", self.code),
        }
    }
}

impl MessageInvalid {
    pub fn new(code: ProtocolErrorCode, detail: impl Into<String>) -> Self {
        MessageInvalid {
            code,
            detail: Some(detail.into()),
            identifier: None,
            global: false,
        }
    }

    pub fn bare(code: ProtocolErrorCode) -> Self {
        MessageInvalid {
            code,
            detail: None,
            identifier: None,
            global: false,
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::new(ProtocolErrorCode::MissingField, format!("No {}", field))
    }

    /// Attaches the request identifier and global flag, unless one was
    /// already recorded.
    pub fn for_request(mut self, identifier: Option<&str>, global: bool) -> Self {
        if self.identifier.is_none() {
            self.identifier = identifier.map(String::from);
        }
        self.global = self.global || global;
        self
    }
}

impl From<FieldSetError> for MessageInvalid {
    fn from(err: FieldSetError) -> Self {
        let code = match err {
            FieldSetError::NumberParse { .. } => ProtocolErrorCode::ErrorParsingNumber,
            FieldSetError::MissingField(_) => ProtocolErrorCode::MissingField,
            FieldSetError::BooleanParse { .. }
            | FieldSetError::InvalidValue { .. }
            | FieldSetError::InvalidKey(_) => ProtocolErrorCode::InvalidField,
            FieldSetError::DuplicateKey(_) | FieldSetError::MissingEndMarker => {
                ProtocolErrorCode::MessageParseError
            }
        };
        MessageInvalid::new(code, err.to_string())
    }
}

/// Errors from the request lifecycle. Each has a dedicated reply rather than
/// the generic `ProtocolError`.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("identifier collision on {identifier}")]
    IdentifierCollision { identifier: String, global: bool },

    #[error("no such identifier: {identifier}")]
    NoSuchIdentifier { identifier: String, global: bool },

    #[error(transparent)]
    Invalid(#[from] MessageInvalid),

    #[error("failed to persist request {identifier}: {source}")]
    Persist {
        identifier: String,
        global: bool,
        #[source]
        source: StoreError,
    },
}

impl LifecycleError {
    pub fn collision(identifier: impl Into<String>, global: bool) -> Self {
        LifecycleError::IdentifierCollision {
            identifier: identifier.into(),
            global,
        }
    }

    pub fn no_such_identifier(identifier: impl Into<String>, global: bool) -> Self {
        LifecycleError::NoSuchIdentifier {
            identifier: identifier.into(),
            global,
        }
    }
}
