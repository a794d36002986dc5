// Copyright 2020 Joyent, Inc.

//! Messages a client sends to the server.

use std::path::PathBuf;

use bytes::Bytes;

use crate::engine::{FetchContext, VERBOSITY_ALL};
use crate::errors::{FieldSetError, MessageInvalid, ProtocolErrorCode};
use crate::fieldset::FieldSet;
use crate::message::{is_server_message, names};
use crate::protocol::RawMessage;
use crate::request::{Persistence, ReturnType, MAX_PRIORITY_CLASS};

const KEY_TYPES: &[&str] = &["CHK", "SSK", "USK", "KSK"];

pub const DEFAULT_GET_PRIORITY_DIRECT: u8 = 2;
pub const DEFAULT_GET_PRIORITY_DISK: u8 = 4;
pub const DEFAULT_GET_PRIORITY_NONE: u8 = 5;
pub const DEFAULT_PUT_PRIORITY: u8 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct ClientHello {
    pub name: String,
    pub expected_version: String,
}

/// Fields shared by every request-creating message.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestCommon {
    pub identifier: String,
    pub uri: String,
    pub global: bool,
    pub persistence: Persistence,
    pub priority: u8,
    pub verbosity: u32,
    pub client_token: Option<String>,
    pub max_retries: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientGet {
    pub common: RequestCommon,
    pub return_type: ReturnType,
    pub context: FetchContext,
}

/// Where the data of an upload comes from, before it has been turned into a
/// bucket.
#[derive(Clone, Debug, PartialEq)]
pub enum PutSource {
    Direct(Bytes),
    Disk(PathBuf),
    Redirect(String),
}

impl PutSource {
    pub fn upload_from(&self) -> &'static str {
        match self {
            PutSource::Direct(_) => "direct",
            PutSource::Disk(_) => "disk",
            PutSource::Redirect(_) => "redirect",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientPut {
    pub common: RequestCommon,
    pub source: PutSource,
    pub content_type: Option<String>,
    pub target_filename: Option<String>,
    pub get_chk_only: bool,
    pub dont_compress: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirFileSpec {
    pub name: String,
    pub source: PutSource,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientPutComplexDir {
    pub common: RequestCommon,
    pub files: Vec<DirFileSpec>,
    pub default_name: Option<String>,
    pub get_chk_only: bool,
    pub dont_compress: bool,
}

/// Every message a client may send. Anything else, including the name of a
/// server message, is rejected by [`ClientMessage::parse`].
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    ClientHello(ClientHello),
    ClientGet(ClientGet),
    ClientPut(ClientPut),
    ClientPutComplexDir(ClientPutComplexDir),
    GetRequestStatus {
        identifier: String,
        global: bool,
        only_data: bool,
    },
    ListPersistentRequests,
    ModifyPersistentRequest {
        identifier: String,
        global: bool,
        client_token: Option<String>,
        priority: Option<u8>,
    },
    RemoveRequest {
        identifier: String,
        global: bool,
    },
    WatchGlobal {
        enabled: bool,
        verbosity_mask: u32,
    },
    Disconnect,
    Void,
}

fn identifier_of(fs: &FieldSet) -> Option<&str> {
    fs.get_nonempty("Identifier")
}

fn optional_string(fs: &FieldSet, key: &str) -> Option<String> {
    fs.get_nonempty(key).map(String::from)
}

/// Checks that `uri` names a key type we know, i.e. looks like `KSK@...`.
pub fn validate_uri(uri: &str) -> Result<(), MessageInvalid> {
    let body = uri.strip_prefix("freenet:").unwrap_or(uri);
    let key_type = match body.find('@') {
        Some(idx) => body[..idx].to_ascii_uppercase(),
        None => {
            return Err(MessageInvalid::new(
                ProtocolErrorCode::UriParseError,
                format!("No @ in URI {}", uri),
            ))
        }
    };
    if KEY_TYPES.contains(&key_type.as_str()) {
        Ok(())
    } else {
        Err(MessageInvalid::new(
            ProtocolErrorCode::UriParseError,
            format!("Unknown key type in URI {}", uri),
        ))
    }
}

fn parse_priority_field(fs: &FieldSet) -> Result<Option<u8>, MessageInvalid> {
    let raw = fs.get_number::<u32>("PriorityClass")?;
    match raw {
        Some(p) if p > u32::from(MAX_PRIORITY_CLASS) => Err(MessageInvalid::new(
            ProtocolErrorCode::InvalidField,
            format!("Invalid priority class {} - range is 0 to {}", p, MAX_PRIORITY_CLASS),
        )),
        Some(p) => Ok(Some(p as u8)),
        None => Ok(None),
    }
}

fn parse_common(
    fs: &FieldSet,
    default_priority: u8,
) -> Result<RequestCommon, MessageInvalid> {
    let identifier = fs
        .get_nonempty("Identifier")
        .ok_or_else(|| MessageInvalid::missing("Identifier"))?
        .to_string();
    let uri = fs
        .get_nonempty("URI")
        .ok_or_else(|| MessageInvalid::missing("URI"))?
        .trim()
        .to_string();
    validate_uri(&uri)?;

    let persistence = match fs.get_nonempty("Persistence") {
        None => Persistence::Connection,
        Some(raw) => Persistence::parse(raw).ok_or_else(|| {
            MessageInvalid::new(
                ProtocolErrorCode::InvalidField,
                format!("Error parsing Persistence field: {}", raw),
            )
        })?,
    };
    let global = fs.get_bool_or("Global", false)?;
    if global && persistence == Persistence::Connection {
        return Err(MessageInvalid::new(
            ProtocolErrorCode::NotSupported,
            "Global requests must be persistent",
        ));
    }

    Ok(RequestCommon {
        identifier,
        uri,
        global,
        persistence,
        priority: parse_priority_field(fs)?.unwrap_or(default_priority),
        verbosity: fs.get_number_or::<u32>("Verbosity", 0)?,
        client_token: optional_string(fs, "ClientToken"),
        max_retries: fs.get_number_or::<i32>("MaxRetries", 0)?,
    })
}

fn parse_return_type(fs: &FieldSet) -> Result<ReturnType, MessageInvalid> {
    let raw = fs.get_nonempty("ReturnType").unwrap_or("direct");
    match raw.to_ascii_lowercase().as_str() {
        "direct" => Ok(ReturnType::Direct),
        "none" => Ok(ReturnType::None),
        "disk" => {
            let filename = PathBuf::from(
                fs.get_nonempty("Filename")
                    .ok_or_else(|| MessageInvalid::missing("Filename"))?,
            );
            let temp_filename = match fs.get_nonempty("TempFilename") {
                Some(temp) => PathBuf::from(temp),
                None => {
                    let mut temp = filename.clone().into_os_string();
                    temp.push(".freenet-tmp");
                    PathBuf::from(temp)
                }
            };
            if filename.parent() != temp_filename.parent() {
                return Err(MessageInvalid::bare(
                    ProtocolErrorCode::SameDirectoryExpected,
                ));
            }
            Ok(ReturnType::Disk {
                filename,
                temp_filename,
            })
        }
        other => Err(MessageInvalid::new(
            ProtocolErrorCode::InvalidMessage,
            format!("Unknown return-type {}", other),
        )),
    }
}

fn parse_get(fs: &FieldSet) -> Result<ClientGet, MessageInvalid> {
    let return_type = parse_return_type(fs)?;
    let default_priority = match return_type {
        ReturnType::Direct => DEFAULT_GET_PRIORITY_DIRECT,
        ReturnType::None => DEFAULT_GET_PRIORITY_NONE,
        ReturnType::Disk { .. } => DEFAULT_GET_PRIORITY_DISK,
    };
    let common = parse_common(fs, default_priority)?;
    let context = FetchContext {
        max_size: fs.get_number("MaxSize")?,
        max_temp_size: fs.get_number("MaxTempSize")?,
        max_retries: common.max_retries,
        ignore_ds: fs.get_bool_or("IgnoreDS", false)?,
        ds_only: fs.get_bool_or("DSOnly", false)?,
    };
    Ok(ClientGet {
        common,
        return_type,
        context,
    })
}

/// Parses the `UploadFrom` family of fields, taking `length` bytes from
/// `payload` for direct uploads.
fn parse_source(
    fs: &FieldSet,
    prefix: &str,
    payload: &mut Bytes,
) -> Result<PutSource, MessageInvalid> {
    let key = |name: &str| format!("{}{}", prefix, name);
    let upload_from = fs
        .get_nonempty(&key("UploadFrom"))
        .unwrap_or("direct")
        .to_ascii_lowercase();
    match upload_from.as_str() {
        "direct" => {
            let length = fs
                .get_number::<u64>(&key("DataLength"))?
                .ok_or_else(|| MessageInvalid::missing(&key("DataLength")))?;
            if length > payload.len() as u64 {
                return Err(MessageInvalid::new(
                    ProtocolErrorCode::MessageParseError,
                    "Payload shorter than declared DataLength",
                ));
            }
            Ok(PutSource::Direct(payload.split_to(length as usize)))
        }
        "disk" => {
            let filename = fs
                .get_nonempty(&key("Filename"))
                .ok_or_else(|| MessageInvalid::missing(&key("Filename")))?;
            Ok(PutSource::Disk(PathBuf::from(filename)))
        }
        "redirect" => {
            let target = fs
                .get_nonempty(&key("TargetURI"))
                .ok_or_else(|| MessageInvalid::missing(&key("TargetURI")))?;
            validate_uri(target)?;
            Ok(PutSource::Redirect(target.to_string()))
        }
        other => Err(MessageInvalid::new(
            ProtocolErrorCode::InvalidField,
            format!("UploadFrom invalid or unrecognized: {}", other),
        )),
    }
}

fn parse_put(fs: &FieldSet, payload: Option<Bytes>) -> Result<ClientPut, MessageInvalid> {
    let common = parse_common(fs, DEFAULT_PUT_PRIORITY)?;
    let mut payload = payload.unwrap_or_default();
    let source = parse_source(fs, "", &mut payload)?;
    Ok(ClientPut {
        common,
        source,
        content_type: optional_string(fs, "Metadata.ContentType"),
        target_filename: optional_string(fs, "TargetFilename"),
        get_chk_only: fs.get_bool_or("GetCHKOnly", false)?,
        dont_compress: fs.get_bool_or("DontCompress", false)?,
    })
}

fn parse_put_dir(
    fs: &FieldSet,
    payload: Option<Bytes>,
) -> Result<ClientPutComplexDir, MessageInvalid> {
    let common = parse_common(fs, DEFAULT_PUT_PRIORITY)?;
    let mut payload = payload.unwrap_or_default();
    let mut files = Vec::new();
    let mut n = 0usize;
    while fs.subset(&format!("Files.{}", n)).is_some() {
        let prefix = format!("Files.{}.", n);
        let name = fs
            .get_nonempty(&format!("{}Name", prefix))
            .ok_or_else(|| MessageInvalid::missing(&format!("{}Name", prefix)))?
            .to_string();
        let source = parse_source(fs, &prefix, &mut payload)?;
        files.push(DirFileSpec {
            name,
            source,
            content_type: optional_string(fs, &format!("{}Metadata.ContentType", prefix)),
        });
        n += 1;
    }
    if !payload.is_empty() {
        return Err(MessageInvalid::new(
            ProtocolErrorCode::MessageParseError,
            "Payload longer than the sum of direct file lengths",
        ));
    }
    Ok(ClientPutComplexDir {
        common,
        files,
        default_name: optional_string(fs, "DefaultName"),
        get_chk_only: fs.get_bool_or("GetCHKOnly", false)?,
        dont_compress: fs.get_bool_or("DontCompress", false)?,
    })
}

fn require_identifier(fs: &FieldSet) -> Result<String, MessageInvalid> {
    identifier_of(fs)
        .map(String::from)
        .ok_or_else(|| MessageInvalid::missing("Identifier"))
}

impl ClientMessage {
    /// Validates a framed message and builds the typed form. Validation
    /// failures carry the request identifier when one was present.
    pub fn parse(raw: RawMessage) -> Result<ClientMessage, MessageInvalid> {
        let RawMessage {
            name,
            fields,
            end_marker: _,
            payload,
            body_error,
        } = raw;
        let fs = &fields;
        let global = fs.get_bool("Global").ok().flatten().unwrap_or(false);
        let result = match body_error {
            Some(e) => Err(MessageInvalid::new(
                ProtocolErrorCode::MessageParseError,
                e.to_string(),
            )),
            None => ClientMessage::parse_fields(&name, fs, payload),
        };
        result.map_err(|e| e.for_request(identifier_of(fs), global))
    }

    fn parse_fields(
        name: &str,
        fs: &FieldSet,
        payload: Option<Bytes>,
    ) -> Result<ClientMessage, MessageInvalid> {
        let msg = match name {
            names::CLIENT_HELLO => ClientMessage::ClientHello(ClientHello {
                name: fs
                    .get_nonempty("Name")
                    .ok_or_else(|| MessageInvalid::missing("Name"))?
                    .to_string(),
                expected_version: fs
                    .get_nonempty("ExpectedVersion")
                    .ok_or_else(|| MessageInvalid::missing("ExpectedVersion"))?
                    .to_string(),
            }),
            names::CLIENT_GET => ClientMessage::ClientGet(parse_get(fs)?),
            names::CLIENT_PUT => ClientMessage::ClientPut(parse_put(fs, payload)?),
            names::CLIENT_PUT_COMPLEX_DIR => {
                ClientMessage::ClientPutComplexDir(parse_put_dir(fs, payload)?)
            }
            names::GET_REQUEST_STATUS => ClientMessage::GetRequestStatus {
                identifier: require_identifier(fs)?,
                global: fs.get_bool_or("Global", false)?,
                only_data: fs.get_bool_or("OnlyData", false)?,
            },
            names::LIST_PERSISTENT_REQUESTS => ClientMessage::ListPersistentRequests,
            names::MODIFY_PERSISTENT_REQUEST => ClientMessage::ModifyPersistentRequest {
                identifier: require_identifier(fs)?,
                global: fs.get_bool_or("Global", false)?,
                client_token: fs.get("ClientToken").map(String::from),
                priority: parse_priority_field(fs)?,
            },
            names::REMOVE_REQUEST | names::REMOVE_PERSISTENT_REQUEST => {
                ClientMessage::RemoveRequest {
                    identifier: require_identifier(fs)?,
                    global: fs.get_bool_or("Global", false)?,
                }
            }
            names::WATCH_GLOBAL => ClientMessage::WatchGlobal {
                enabled: fs.get_bool_or("Enabled", true)?,
                verbosity_mask: fs.get_number_or::<u32>("VerbosityMask", VERBOSITY_ALL)?,
            },
            names::DISCONNECT => ClientMessage::Disconnect,
            names::VOID => ClientMessage::Void,
            other if is_server_message(other) => {
                return Err(MessageInvalid::new(
                    ProtocolErrorCode::InvalidMessage,
                    format!("{} goes from server to client not the other way around", other),
                ))
            }
            other => {
                return Err(MessageInvalid::new(
                    ProtocolErrorCode::InvalidMessage,
                    format!("Unknown message name {}", other),
                ))
            }
        };
        Ok(msg)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::ClientHello(_) => names::CLIENT_HELLO,
            ClientMessage::ClientGet(_) => names::CLIENT_GET,
            ClientMessage::ClientPut(_) => names::CLIENT_PUT,
            ClientMessage::ClientPutComplexDir(_) => names::CLIENT_PUT_COMPLEX_DIR,
            ClientMessage::GetRequestStatus { .. } => names::GET_REQUEST_STATUS,
            ClientMessage::ListPersistentRequests => names::LIST_PERSISTENT_REQUESTS,
            ClientMessage::ModifyPersistentRequest { .. } => names::MODIFY_PERSISTENT_REQUEST,
            ClientMessage::RemoveRequest { .. } => names::REMOVE_REQUEST,
            ClientMessage::WatchGlobal { .. } => names::WATCH_GLOBAL,
            ClientMessage::Disconnect => names::DISCONNECT,
            ClientMessage::Void => names::VOID,
        }
    }

    /// Renders the message back into wire form.
    pub fn to_raw(&self) -> Result<RawMessage, FieldSetError> {
        let mut fs = FieldSet::new();
        let mut payload: Vec<Bytes> = Vec::new();
        match self {
            ClientMessage::ClientHello(hello) => {
                fs.put_single("Name", &hello.name)?;
                fs.put_single("ExpectedVersion", &hello.expected_version)?;
            }
            ClientMessage::ClientGet(get) => {
                put_common(&mut fs, &get.common)?;
                match &get.return_type {
                    ReturnType::Direct => {
                        fs.put_single("ReturnType", "direct")?;
                    }
                    ReturnType::None => {
                        fs.put_single("ReturnType", "none")?;
                    }
                    ReturnType::Disk {
                        filename,
                        temp_filename,
                    } => {
                        fs.put_single("ReturnType", "disk")?;
                        fs.put_single("Filename", filename.display())?;
                        fs.put_single("TempFilename", temp_filename.display())?;
                    }
                }
                if let Some(max) = get.context.max_size {
                    fs.put_single("MaxSize", max)?;
                }
                if let Some(max) = get.context.max_temp_size {
                    fs.put_single("MaxTempSize", max)?;
                }
                fs.put_single("IgnoreDS", get.context.ignore_ds)?;
                fs.put_single("DSOnly", get.context.ds_only)?;
            }
            ClientMessage::ClientPut(put) => {
                put_common(&mut fs, &put.common)?;
                put_source(&mut fs, "", &put.source, &mut payload)?;
                if let Some(ct) = &put.content_type {
                    fs.put_single("Metadata.ContentType", ct)?;
                }
                if let Some(target) = &put.target_filename {
                    fs.put_single("TargetFilename", target)?;
                }
                fs.put_single("GetCHKOnly", put.get_chk_only)?;
                fs.put_single("DontCompress", put.dont_compress)?;
            }
            ClientMessage::ClientPutComplexDir(dir) => {
                put_common(&mut fs, &dir.common)?;
                for (n, file) in dir.files.iter().enumerate() {
                    let prefix = format!("Files.{}.", n);
                    fs.put_single(&format!("{}Name", prefix), &file.name)?;
                    put_source(&mut fs, &prefix, &file.source, &mut payload)?;
                    if let Some(ct) = &file.content_type {
                        fs.put_single(&format!("{}Metadata.ContentType", prefix), ct)?;
                    }
                }
                if let Some(name) = &dir.default_name {
                    fs.put_single("DefaultName", name)?;
                }
                fs.put_single("GetCHKOnly", dir.get_chk_only)?;
                fs.put_single("DontCompress", dir.dont_compress)?;
            }
            ClientMessage::GetRequestStatus {
                identifier,
                global,
                only_data,
            } => {
                fs.put_single("Identifier", identifier)?;
                fs.put_single("Global", global)?;
                fs.put_single("OnlyData", only_data)?;
            }
            ClientMessage::ModifyPersistentRequest {
                identifier,
                global,
                client_token,
                priority,
            } => {
                fs.put_single("Identifier", identifier)?;
                fs.put_single("Global", global)?;
                if let Some(token) = client_token {
                    fs.put_single("ClientToken", token)?;
                }
                if let Some(priority) = priority {
                    fs.put_single("PriorityClass", priority)?;
                }
            }
            ClientMessage::RemoveRequest { identifier, global } => {
                fs.put_single("Identifier", identifier)?;
                fs.put_single("Global", global)?;
            }
            ClientMessage::WatchGlobal {
                enabled,
                verbosity_mask,
            } => {
                fs.put_single("Enabled", enabled)?;
                fs.put_single("VerbosityMask", verbosity_mask)?;
            }
            ClientMessage::ListPersistentRequests
            | ClientMessage::Disconnect
            | ClientMessage::Void => {}
        }

        Ok(match self {
            ClientMessage::ClientPut(_) | ClientMessage::ClientPutComplexDir(_)
                if !payload.is_empty() =>
            {
                let mut data = Vec::new();
                for chunk in payload {
                    data.extend_from_slice(&chunk);
                }
                RawMessage::with_payload(self.name(), fs, Bytes::from(data))
            }
            _ => RawMessage::new(self.name(), fs),
        })
    }
}

fn put_common(fs: &mut FieldSet, common: &RequestCommon) -> Result<(), FieldSetError> {
    fs.put_single("Identifier", &common.identifier)?;
    fs.put_single("URI", &common.uri)?;
    fs.put_single("Verbosity", common.verbosity)?;
    fs.put_single("PriorityClass", common.priority)?;
    fs.put_single("Persistence", common.persistence.as_str())?;
    fs.put_single("Global", common.global)?;
    fs.put_single("MaxRetries", common.max_retries)?;
    if let Some(token) = &common.client_token {
        fs.put_single("ClientToken", token)?;
    }
    Ok(())
}

fn put_source(
    fs: &mut FieldSet,
    prefix: &str,
    source: &PutSource,
    payload: &mut Vec<Bytes>,
) -> Result<(), FieldSetError> {
    fs.put_single(&format!("{}UploadFrom", prefix), source.upload_from())?;
    match source {
        PutSource::Direct(data) => {
            fs.put_single(&format!("{}DataLength", prefix), data.len())?;
            payload.push(data.clone());
        }
        PutSource::Disk(path) => {
            fs.put_single(&format!("{}Filename", prefix), path.display())?;
        }
        PutSource::Redirect(target) => {
            fs.put_single(&format!("{}TargetURI", prefix), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, lines: &[(&str, &str)]) -> RawMessage {
        let mut fs = FieldSet::new();
        for (k, v) in lines {
            fs.put_single(k, v).unwrap();
        }
        RawMessage::new(name, fs)
    }

    #[test]
    fn hello_requires_both_fields() {
        let err = ClientMessage::parse(raw("ClientHello", &[("Name", "x")])).unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::MissingField);

        let ok = ClientMessage::parse(raw(
            "ClientHello",
            &[("Name", "x"), ("ExpectedVersion", "2.0")],
        ))
        .unwrap();
        assert_eq!(ok.name(), "ClientHello");
    }

    #[test]
    fn server_messages_are_invalid() {
        let err = ClientMessage::parse(raw("GetFailed", &[("Identifier", "a")])).unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidMessage);
        assert_eq!(err.identifier.as_deref(), Some("a"));

        let err = ClientMessage::parse(raw("NoSuchThing", &[])).unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidMessage);
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let mut msg = raw("ClientGet", &[("Identifier", "d1"), ("URI", "KSK@d")]);
        msg.body_error = Some(crate::errors::FieldSetError::DuplicateKey("URI".into()));
        let err = ClientMessage::parse(msg).unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::MessageParseError);
        assert_eq!(err.identifier.as_deref(), Some("d1"));
    }

    #[test]
    fn get_defaults() {
        let msg = ClientMessage::parse(raw(
            "ClientGet",
            &[("Identifier", "job1"), ("URI", "KSK@test.txt")],
        ))
        .unwrap();
        match msg {
            ClientMessage::ClientGet(get) => {
                assert_eq!(get.common.persistence, Persistence::Connection);
                assert_eq!(get.common.priority, DEFAULT_GET_PRIORITY_DIRECT);
                assert_eq!(get.common.verbosity, 0);
                assert_eq!(get.return_type, ReturnType::Direct);
                assert!(!get.common.global);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn get_validation_failures() {
        let cases: &[(&[(&str, &str)], ProtocolErrorCode)] = &[
            (&[("URI", "KSK@a")], ProtocolErrorCode::MissingField),
            (&[("Identifier", "a")], ProtocolErrorCode::MissingField),
            (&[("Identifier", "a"), ("URI", "nonsense")], ProtocolErrorCode::UriParseError),
            (&[("Identifier", "a"), ("URI", "XYZ@abc")], ProtocolErrorCode::UriParseError),
            (
                &[("Identifier", "a"), ("URI", "KSK@a"), ("PriorityClass", "7")],
                ProtocolErrorCode::InvalidField,
            ),
            (
                &[("Identifier", "a"), ("URI", "KSK@a"), ("Verbosity", "lots")],
                ProtocolErrorCode::ErrorParsingNumber,
            ),
            (
                &[("Identifier", "a"), ("URI", "KSK@a"), ("Global", "true")],
                ProtocolErrorCode::NotSupported,
            ),
            (
                &[("Identifier", "a"), ("URI", "KSK@a"), ("Persistence", "sometimes")],
                ProtocolErrorCode::InvalidField,
            ),
            (
                &[("Identifier", "a"), ("URI", "KSK@a"), ("ReturnType", "disk")],
                ProtocolErrorCode::MissingField,
            ),
            (
                &[
                    ("Identifier", "a"),
                    ("URI", "KSK@a"),
                    ("ReturnType", "disk"),
                    ("Filename", "/tmp/a/out"),
                    ("TempFilename", "/tmp/b/out.tmp"),
                ],
                ProtocolErrorCode::SameDirectoryExpected,
            ),
        ];
        for (fields, code) in cases {
            let err = ClientMessage::parse(raw("ClientGet", fields)).unwrap_err();
            assert_eq!(err.code, *code, "fields {:?}", fields);
        }
    }

    #[test]
    fn persistence_is_case_insensitive() {
        let msg = ClientMessage::parse(raw(
            "ClientGet",
            &[
                ("Identifier", "a"),
                ("URI", "CHK@abc"),
                ("Persistence", "Forever"),
                ("Global", "true"),
                ("ReturnType", "none"),
            ],
        ))
        .unwrap();
        match msg {
            ClientMessage::ClientGet(get) => {
                assert_eq!(get.common.persistence, Persistence::Forever);
                assert_eq!(get.common.priority, DEFAULT_GET_PRIORITY_NONE);
                assert!(get.common.global);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn disk_get_defaults_temp_filename() {
        let msg = ClientMessage::parse(raw(
            "ClientGet",
            &[
                ("Identifier", "a"),
                ("URI", "KSK@a"),
                ("ReturnType", "disk"),
                ("Filename", "/tmp/out.bin"),
            ],
        ))
        .unwrap();
        match msg {
            ClientMessage::ClientGet(get) => assert_eq!(
                get.return_type,
                ReturnType::Disk {
                    filename: PathBuf::from("/tmp/out.bin"),
                    temp_filename: PathBuf::from("/tmp/out.bin.freenet-tmp"),
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn complex_dir_splits_payload_in_order() {
        let mut fs = FieldSet::new();
        fs.put_single("Identifier", "site").unwrap();
        fs.put_single("URI", "CHK@").unwrap();
        fs.put_single("Files.0.Name", "index.html").unwrap();
        fs.put_single("Files.0.DataLength", 3).unwrap();
        fs.put_single("Files.1.Name", "img/logo.png").unwrap();
        fs.put_single("Files.1.UploadFrom", "redirect").unwrap();
        fs.put_single("Files.1.TargetURI", "CHK@logo").unwrap();
        fs.put_single("Files.2.Name", "about.html").unwrap();
        fs.put_single("Files.2.UploadFrom", "direct").unwrap();
        fs.put_single("Files.2.DataLength", 2).unwrap();
        fs.put_single("Files.4.Name", "unreachable").unwrap();
        let raw = RawMessage::with_payload("ClientPutComplexDir", fs, Bytes::from_static(b"abcde"));

        match ClientMessage::parse(raw).unwrap() {
            ClientMessage::ClientPutComplexDir(dir) => {
                assert_eq!(dir.files.len(), 3);
                assert_eq!(dir.files[0].source, PutSource::Direct(Bytes::from_static(b"abc")));
                assert_eq!(dir.files[1].source, PutSource::Redirect("CHK@logo".into()));
                assert_eq!(dir.files[2].source, PutSource::Direct(Bytes::from_static(b"de")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rendered_messages_parse_back() {
        let original = ClientMessage::ClientPut(ClientPut {
            common: RequestCommon {
                identifier: "up1".into(),
                uri: "KSK@file".into(),
                global: false,
                persistence: Persistence::Reboot,
                priority: 3,
                verbosity: 1,
                client_token: Some("token".into()),
                max_retries: -1,
            },
            source: PutSource::Direct(Bytes::from_static(b"payload")),
            content_type: Some("text/plain".into()),
            target_filename: None,
            get_chk_only: false,
            dont_compress: true,
        });
        assert_eq!(ClientMessage::parse(original.to_raw().unwrap()).unwrap(), original);

        let modify = ClientMessage::ModifyPersistentRequest {
            identifier: "up1".into(),
            global: true,
            client_token: None,
            priority: Some(1),
        };
        assert_eq!(ClientMessage::parse(modify.to_raw().unwrap()).unwrap(), modify);
    }

    #[test]
    fn unrenderable_token_is_an_error() {
        let modify = ClientMessage::ModifyPersistentRequest {
            identifier: "up1".into(),
            global: false,
            client_token: Some("two\nlines".into()),
            priority: None,
        };
        match modify.to_raw() {
            Err(FieldSetError::InvalidValue { key }) => assert_eq!(key, "ClientToken"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
