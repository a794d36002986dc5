// Copyright 2020 Joyent, Inc.

//! Typed failure records for finished requests, plus the fetch and insert
//! failure code tables they are rendered from.

use std::collections::BTreeMap;

use crate::engine::JobFailure;
use crate::errors::FieldSetError;
use crate::fieldset::FieldSet;

pub mod fetch_codes {
    pub const TOO_DEEP_ARCHIVE_RECURSION: u32 = 1;
    pub const UNKNOWN_SPLITFILE_METADATA: u32 = 2;
    pub const UNKNOWN_METADATA: u32 = 3;
    pub const INVALID_METADATA: u32 = 4;
    pub const ARCHIVE_FAILURE: u32 = 5;
    pub const BLOCK_DECODE_ERROR: u32 = 6;
    pub const TOO_MANY_METADATA_LEVELS: u32 = 7;
    pub const TOO_MANY_ARCHIVE_RESTARTS: u32 = 8;
    pub const TOO_MUCH_RECURSION: u32 = 9;
    pub const NOT_IN_ARCHIVE: u32 = 10;
    pub const TOO_MANY_PATH_COMPONENTS: u32 = 11;
    pub const BUCKET_ERROR: u32 = 12;
    pub const DATA_NOT_FOUND: u32 = 13;
    pub const ROUTE_NOT_FOUND: u32 = 14;
    pub const REJECTED_OVERLOAD: u32 = 15;
    pub const TOO_MANY_REDIRECTS: u32 = 16;
    pub const INTERNAL_ERROR: u32 = 17;
    pub const TRANSFER_FAILED: u32 = 18;
    pub const SPLITFILE_ERROR: u32 = 19;
    pub const INVALID_URI: u32 = 20;
    pub const TOO_BIG: u32 = 21;
    pub const TOO_BIG_METADATA: u32 = 22;
    pub const TOO_MANY_BLOCKS_PER_SEGMENT: u32 = 23;
    pub const NOT_ENOUGH_PATH_COMPONENTS: u32 = 24;
    pub const CANCELLED: u32 = 25;
    pub const ARCHIVE_RESTART: u32 = 26;
    pub const PERMANENT_REDIRECT: u32 = 27;
    pub const ALL_DATA_NOT_FOUND: u32 = 28;
    pub const WRONG_MIME_TYPE: u32 = 29;
    pub const RECENTLY_FAILED: u32 = 30;
}

pub mod insert_codes {
    pub const INVALID_URI: u32 = 1;
    pub const BUCKET_ERROR: u32 = 2;
    pub const INTERNAL_ERROR: u32 = 3;
    pub const REJECTED_OVERLOAD: u32 = 4;
    pub const ROUTE_NOT_FOUND: u32 = 5;
    pub const FATAL_ERRORS_IN_BLOCKS: u32 = 6;
    pub const TOO_MANY_RETRIES_IN_BLOCKS: u32 = 7;
    pub const ROUTE_REALLY_NOT_FOUND: u32 = 8;
    pub const COLLISION: u32 = 9;
    pub const CANCELLED: u32 = 10;
    pub const META_STRINGS_NOT_SUPPORTED: u32 = 11;
    pub const BINARY_BLOB_FORMAT_ERROR: u32 = 12;
    pub const TOO_MANY_FILES: u32 = 13;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Fetch,
    Insert,
}

impl FailureKind {
    pub fn cancelled_code(self) -> u32 {
        match self {
            FailureKind::Fetch => fetch_codes::CANCELLED,
            FailureKind::Insert => insert_codes::CANCELLED,
        }
    }

    pub fn internal_error_code(self) -> u32 {
        match self {
            FailureKind::Fetch => fetch_codes::INTERNAL_ERROR,
            FailureKind::Insert => insert_codes::INTERNAL_ERROR,
        }
    }

    /// Returns `(short, long)` descriptions for `code`.
    pub fn describe(self, code: u32) -> (&'static str, &'static str) {
        match self {
            FailureKind::Fetch => describe_fetch(code),
            FailureKind::Insert => describe_insert(code),
        }
    }

    /// Whether retrying a request that failed with `code` is pointless.
    pub fn is_fatal(self, code: u32) -> bool {
        match self {
            FailureKind::Fetch => !matches!(
                code,
                fetch_codes::DATA_NOT_FOUND
                    | fetch_codes::ROUTE_NOT_FOUND
                    | fetch_codes::REJECTED_OVERLOAD
                    | fetch_codes::TRANSFER_FAILED
                    | fetch_codes::ALL_DATA_NOT_FOUND
                    | fetch_codes::RECENTLY_FAILED
                    | fetch_codes::SPLITFILE_ERROR
            ),
            FailureKind::Insert => matches!(
                code,
                insert_codes::INVALID_URI
                    | insert_codes::FATAL_ERRORS_IN_BLOCKS
                    | insert_codes::COLLISION
                    | insert_codes::CANCELLED
                    | insert_codes::META_STRINGS_NOT_SUPPORTED
                    | insert_codes::BINARY_BLOB_FORMAT_ERROR
                    | insert_codes::TOO_MANY_FILES
            ),
        }
    }
}

fn describe_fetch(code: u32) -> (&'static str, &'static str) {
    use self::fetch_codes::*;
    match code {
        TOO_DEEP_ARCHIVE_RECURSION => ("Archive recursion", "Too many levels of recursion into archives"),
        UNKNOWN_SPLITFILE_METADATA => ("Unknown splitfile metadata", "Don't know what to do with splitfile"),
        UNKNOWN_METADATA => ("Unknown metadata", "Don't know what to do with the metadata"),
        INVALID_METADATA => ("Invalid metadata", "Failed to parse metadata"),
        ARCHIVE_FAILURE => ("Archive failure", "Failure in extracting files from an archive"),
        BLOCK_DECODE_ERROR => ("Block decode error", "Failed to decode a block"),
        TOO_MANY_METADATA_LEVELS => ("Too many metadata levels", "Too many layers of metadata"),
        TOO_MANY_ARCHIVE_RESTARTS => ("Too many archive restarts", "Request was restarted too many times due to archives changing"),
        TOO_MUCH_RECURSION => ("Too much recursion", "Too many redirects"),
        NOT_IN_ARCHIVE => ("Not in archive", "File not in archive"),
        TOO_MANY_PATH_COMPONENTS => ("Too many path components", "Too many path components - not a manifest?"),
        BUCKET_ERROR => ("Temporary files problem", "Disk or temporary storage error"),
        DATA_NOT_FOUND => ("Data not found", "Data not found"),
        ROUTE_NOT_FOUND => ("Route not found", "Route not found - could not find enough nodes to be sure the data doesn't exist"),
        REJECTED_OVERLOAD => ("Timeout or overload", "A node was overloaded or timed out"),
        TOO_MANY_REDIRECTS => ("Too many redirects", "Too many redirects"),
        INTERNAL_ERROR => ("Internal error", "Internal error, probably a bug"),
        TRANSFER_FAILED => ("Transfer failed", "Found the data but couldn't transfer it"),
        SPLITFILE_ERROR => ("Splitfile error", "Some blocks of a splitfile could not be fetched"),
        INVALID_URI => ("Invalid URI", "Invalid URI"),
        TOO_BIG => ("Too big", "Data exceeds the maximum size for this request"),
        TOO_BIG_METADATA => ("Metadata too big", "Metadata is too big"),
        TOO_MANY_BLOCKS_PER_SEGMENT => ("Too many blocks per segment", "Splitfile has too many blocks in a segment"),
        NOT_ENOUGH_PATH_COMPONENTS => ("Not enough path components", "Not enough meta-strings in the URI, probably a site without a default document"),
        CANCELLED => ("Cancelled", "Cancelled by the client"),
        ARCHIVE_RESTART => ("Archive restart", "Archive restarted"),
        PERMANENT_REDIRECT => ("New URI", "Permanent redirect: use the new URI"),
        ALL_DATA_NOT_FOUND => ("All data not found", "Found the final metadata but not all the data"),
        WRONG_MIME_TYPE => ("Wrong MIME type", "Content has an unexpected MIME type"),
        RECENTLY_FAILED => ("Recently failed", "Data was recently not found, waiting before retrying"),
        _ => ("Unknown error", "Unknown fetch error code"),
    }
}

fn describe_insert(code: u32) -> (&'static str, &'static str) {
    use self::insert_codes::*;
    match code {
        INVALID_URI => ("Invalid URI", "Caller supplied a URI we cannot use"),
        BUCKET_ERROR => ("Temporary files problem", "Disk or temporary storage error"),
        INTERNAL_ERROR => ("Internal error", "Internal error, probably a bug"),
        REJECTED_OVERLOAD => ("Timeout or overload", "A downstream node timed out or was overloaded"),
        ROUTE_NOT_FOUND => ("Route not found", "Could not propagate the insert to enough nodes"),
        FATAL_ERRORS_IN_BLOCKS => ("Some blocks failed", "Some blocks failed fatally"),
        TOO_MANY_RETRIES_IN_BLOCKS => ("Some blocks ran out of retries", "Some blocks failed after the maximum number of retries"),
        ROUTE_REALLY_NOT_FOUND => ("Request could not leave the node", "The insert could not leave the node"),
        COLLISION => ("Collided with existing data", "Insert collided with different data under the same key"),
        CANCELLED => ("Cancelled", "Cancelled by the client"),
        META_STRINGS_NOT_SUPPORTED => ("Meta strings not supported", "Meta strings are not supported on this key type"),
        BINARY_BLOB_FORMAT_ERROR => ("Binary blob format error", "Binary blob format error"),
        TOO_MANY_FILES => ("Too many files", "Too many files in a single folder"),
        _ => ("Unknown error", "Unknown insert error code"),
    }
}

/// The terminal failure of a request, as reported in `GetFailed`/`PutFailed`
/// and persisted with the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub code: u32,
    pub extra_description: Option<String>,
    pub fatal: bool,
    pub redirect_uri: Option<String>,
    pub error_counts: BTreeMap<u32, u32>,
    pub expected_data_length: Option<u64>,
    pub expected_mime: Option<String>,
    pub finalized_expected: bool,
}

impl FailureRecord {
    pub fn from_job(kind: FailureKind, failure: JobFailure) -> FailureRecord {
        FailureRecord {
            kind,
            fatal: kind.is_fatal(failure.code),
            code: failure.code,
            extra_description: failure.extra_description,
            redirect_uri: failure.redirect_uri,
            error_counts: failure.error_counts,
            expected_data_length: failure.expected_data_length,
            expected_mime: failure.expected_mime,
            finalized_expected: failure.finalized_expected,
        }
    }

    pub fn cancelled(kind: FailureKind) -> FailureRecord {
        FailureRecord::from_job(kind, JobFailure::new(kind.cancelled_code()))
    }

    pub fn short_description(&self) -> &'static str {
        self.kind.describe(self.code).0
    }

    pub fn description(&self) -> &'static str {
        self.kind.describe(self.code).1
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == self.kind.cancelled_code()
    }

    /// Fields shared by the wire message and the persisted form.
    /// Descriptions are included only when `verbose`, since they can be
    /// rebuilt from the code.
    pub fn to_fieldset(&self, verbose: bool) -> Result<FieldSet, FieldSetError> {
        let mut fs = FieldSet::new();
        fs.put_single("Code", self.code)?;
        if verbose {
            fs.put_single("CodeDescription", self.description())?;
        }
        if let Some(extra) = &self.extra_description {
            fs.put_single("ExtraDescription", extra)?;
        }
        if verbose {
            fs.put_single("Fatal", self.fatal)?;
        }
        let mut errors = FieldSet::new();
        for (code, count) in &self.error_counts {
            let (_, long) = self.kind.describe(*code);
            if verbose {
                errors.put_single(&format!("{}.Description", code), long)?;
            }
            errors.put_single(&format!("{}.Count", code), count)?;
        }
        fs.put_subset("Errors", errors)?;
        if verbose {
            fs.put_single("ShortCodeDescription", self.short_description())?;
        }
        if let Some(length) = self.expected_data_length {
            fs.put_single("ExpectedDataLength", length)?;
        }
        if let Some(mime) = &self.expected_mime {
            fs.put_single("ExpectedMetadata.ContentType", mime)?;
        }
        if self.finalized_expected {
            fs.put_single("FinalizedExpected", true)?;
        }
        if let Some(uri) = &self.redirect_uri {
            fs.put_single("RedirectURI", uri)?;
        }
        Ok(fs)
    }

    pub fn from_fieldset(
        kind: FailureKind,
        fs: &FieldSet,
    ) -> Result<FailureRecord, FieldSetError> {
        let code = fs
            .get_number::<u32>("Code")?
            .ok_or_else(|| FieldSetError::MissingField("Code".into()))?;
        let mut error_counts = BTreeMap::new();
        if let Some(errors) = fs.subset("Errors") {
            for (name, entry) in errors.subsets() {
                let sub_code = name.parse::<u32>().map_err(|_| {
                    FieldSetError::NumberParse {
                        key: format!("Errors.{}", name),
                        value: name.to_string(),
                    }
                })?;
                let count = entry.get_number_or::<u32>("Count", 0)?;
                error_counts.insert(sub_code, count);
            }
        }
        Ok(FailureRecord {
            kind,
            code,
            extra_description: fs.get("ExtraDescription").map(String::from),
            fatal: fs.get_bool_or("Fatal", kind.is_fatal(code))?,
            redirect_uri: fs.get_nonempty("RedirectURI").map(String::from),
            error_counts,
            expected_data_length: fs.get_number("ExpectedDataLength")?,
            expected_mime: fs
                .get_nonempty("ExpectedMetadata.ContentType")
                .map(String::from),
            finalized_expected: fs.get_bool_or("FinalizedExpected", false)?,
        })
    }
}
