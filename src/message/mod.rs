// Copyright 2020 Joyent, Inc.

//! Typed FCP messages.
//!
//! [`ClientMessage`] covers everything a client may send and
//! [`ServerMessage`] everything the server may send. The two sets are
//! disjoint; a server message name arriving from a client fails validation
//! with `InvalidMessage`.

pub mod client;
pub mod server;

pub use self::client::ClientMessage;
pub use self::server::{RequestId, ServerMessage};

use crate::errors::MessageInvalid;
use crate::fieldset::FieldSet;

pub mod names {
    pub const CLIENT_HELLO: &str = "ClientHello";
    pub const CLIENT_GET: &str = "ClientGet";
    pub const CLIENT_PUT: &str = "ClientPut";
    pub const CLIENT_PUT_COMPLEX_DIR: &str = "ClientPutComplexDir";
    pub const GET_REQUEST_STATUS: &str = "GetRequestStatus";
    pub const LIST_PERSISTENT_REQUESTS: &str = "ListPersistentRequests";
    pub const MODIFY_PERSISTENT_REQUEST: &str = "ModifyPersistentRequest";
    pub const REMOVE_REQUEST: &str = "RemoveRequest";
    pub const REMOVE_PERSISTENT_REQUEST: &str = "RemovePersistentRequest";
    pub const WATCH_GLOBAL: &str = "WatchGlobal";
    pub const DISCONNECT: &str = "Disconnect";
    pub const VOID: &str = "Void";

    pub const NODE_HELLO: &str = "NodeHello";
    pub const CLOSE_CONNECTION_DUPLICATE_CLIENT_NAME: &str =
        "CloseConnectionDuplicateClientName";
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    pub const IDENTIFIER_COLLISION: &str = "IdentifierCollision";
    pub const SIMPLE_PROGRESS: &str = "SimpleProgress";
    pub const STARTED_COMPRESSION: &str = "StartedCompression";
    pub const FINISHED_COMPRESSION: &str = "FinishedCompression";
    pub const EXPECTED_MIME: &str = "ExpectedMIME";
    pub const EXPECTED_DATA_LENGTH: &str = "ExpectedDataLength";
    pub const SENDING_TO_NETWORK: &str = "SendingToNetwork";
    pub const PUT_FETCHABLE: &str = "PutFetchable";
    pub const URI_GENERATED: &str = "URIGenerated";
    pub const DATA_FOUND: &str = "DataFound";
    pub const ALL_DATA: &str = "AllData";
    pub const GET_FAILED: &str = "GetFailed";
    pub const PUT_SUCCESSFUL: &str = "PutSuccessful";
    pub const PUT_FAILED: &str = "PutFailed";
    pub const PERSISTENT_GET: &str = "PersistentGet";
    pub const PERSISTENT_PUT: &str = "PersistentPut";
    pub const PERSISTENT_PUT_DIR: &str = "PersistentPutDir";
    pub const PERSISTENT_REQUEST_MODIFIED: &str = "PersistentRequestModified";
    pub const PERSISTENT_REQUEST_REMOVED: &str = "PersistentRequestRemoved";
    pub const END_LIST_PERSISTENT_REQUESTS: &str = "EndListPersistentRequests";

    pub const SERVER_MESSAGES: &[&str] = &[
        NODE_HELLO,
        CLOSE_CONNECTION_DUPLICATE_CLIENT_NAME,
        PROTOCOL_ERROR,
        IDENTIFIER_COLLISION,
        SIMPLE_PROGRESS,
        STARTED_COMPRESSION,
        FINISHED_COMPRESSION,
        EXPECTED_MIME,
        EXPECTED_DATA_LENGTH,
        SENDING_TO_NETWORK,
        PUT_FETCHABLE,
        URI_GENERATED,
        DATA_FOUND,
        ALL_DATA,
        GET_FAILED,
        PUT_SUCCESSFUL,
        PUT_FAILED,
        PERSISTENT_GET,
        PERSISTENT_PUT,
        PERSISTENT_PUT_DIR,
        PERSISTENT_REQUEST_MODIFIED,
        PERSISTENT_REQUEST_REMOVED,
        END_LIST_PERSISTENT_REQUESTS,
    ];
}

pub fn is_server_message(name: &str) -> bool {
    names::SERVER_MESSAGES.contains(&name)
}

/// The number of payload bytes that follow a `Data`-terminated message.
///
/// `ClientPutComplexDir` carries the concatenated data of its direct files;
/// every other message declares a single `DataLength`.
pub fn declared_payload_length(
    name: &str,
    fields: &FieldSet,
) -> Result<u64, MessageInvalid> {
    if name != names::CLIENT_PUT_COMPLEX_DIR {
        return fields
            .get_number::<u64>("DataLength")?
            .ok_or_else(|| MessageInvalid::missing("DataLength"));
    }

    let mut total: u64 = 0;
    let mut n = 0usize;
    while let Some(file) = fields.subset(&format!("Files.{}", n)) {
        let upload_from = file.get_nonempty("UploadFrom").unwrap_or("direct");
        if upload_from.eq_ignore_ascii_case("direct") {
            let length = file.get_number::<u64>("DataLength")?.ok_or_else(|| {
                MessageInvalid::missing(&format!("Files.{}.DataLength", n))
            })?;
            total = total.saturating_add(length);
        }
        n += 1;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProtocolErrorCode;

    #[test]
    fn complex_dir_length_sums_direct_files() {
        let mut fs = FieldSet::new();
        fs.put_single("Files.0.Name", "a").unwrap();
        fs.put_single("Files.0.DataLength", 10).unwrap();
        fs.put_single("Files.1.Name", "b").unwrap();
        fs.put_single("Files.1.UploadFrom", "disk").unwrap();
        fs.put_single("Files.1.DataLength", 99).unwrap();
        fs.put_single("Files.2.Name", "c").unwrap();
        fs.put_single("Files.2.UploadFrom", "Direct").unwrap();
        fs.put_single("Files.2.DataLength", 5).unwrap();
        assert_eq!(declared_payload_length("ClientPutComplexDir", &fs), Ok(15));
    }

    #[test]
    fn single_length() {
        let mut fs = FieldSet::new();
        assert_eq!(
            declared_payload_length("ClientPut", &fs).unwrap_err().code,
            ProtocolErrorCode::MissingField
        );
        fs.put_single("DataLength", "x").unwrap();
        assert_eq!(
            declared_payload_length("ClientPut", &fs).unwrap_err().code,
            ProtocolErrorCode::ErrorParsingNumber
        );
    }

    #[test]
    fn server_names_are_recognized() {
        assert!(is_server_message("NodeHello"));
        assert!(is_server_message("AllData"));
        assert!(!is_server_message("ClientHello"));
    }
}
