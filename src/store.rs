// Copyright 2020 Joyent, Inc.

//! Durable storage for persistent requests.
//!
//! Stores map a [`StoreKey`] to the field set a request serializes itself to.
//! The REBOOT tier uses a [`MemoryStore`], which lives as long as the process.
//! The FOREVER tier uses a [`FileStore`], which keeps its entries in memory
//! and rewrites its backing file on flush: every entry is written as a field
//! set terminated by an `End` line, to a temporary file that is then renamed
//! over the real one.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use slog::{debug, info, o, warn, Drain, Logger};
use thiserror::Error;

use crate::errors::FieldSetError;
use crate::fieldset::FieldSet;
use crate::protocol::END_MARKER;
use crate::session::GLOBAL_SESSION_NAME;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed store entry: {0}")]
    Entry(#[from] FieldSetError),
}

/// Identifies a request across all sessions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    pub global: bool,
    pub client: String,
    pub identifier: String,
}

impl StoreKey {
    /// Global requests share one namespace whoever submitted them, so the
    /// client part of their key is always the global session's name.
    pub fn new(global: bool, client: &str, identifier: &str) -> StoreKey {
        let client = if global { GLOBAL_SESSION_NAME } else { client };
        StoreKey {
            global,
            client: client.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

pub trait DurableStore: Send + Sync {
    fn put(&self, key: &StoreKey, fields: FieldSet) -> Result<(), StoreError>;

    fn remove(&self, key: &StoreKey) -> Result<(), StoreError>;

    fn load_all(&self) -> Result<Vec<FieldSet>, StoreError>;

    /// Makes every accepted `put` and `remove` durable before returning.
    fn force_flush(&self) -> Result<(), StoreError>;

    /// Flushes only if something changed since the last flush. Returns
    /// whether a flush happened.
    fn flush_if_dirty(&self) -> Result<bool, StoreError>;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<StoreKey, FieldSet>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &StoreKey) -> Option<FieldSet> {
        lock(&self.entries).get(key).cloned()
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, key: &StoreKey, fields: FieldSet) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.clone(), fields);
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<FieldSet>, StoreError> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    fn force_flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn flush_if_dirty(&self) -> Result<bool, StoreError> {
        Ok(false)
    }
}

pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<StoreKey, FieldSet>>,
    dirty: AtomicBool,
    // Serializes writers of the backing file.
    flush_lock: Mutex<()>,
    log: Logger,
}

/// Splits the contents of a store file into its entries. Entries that fail
/// to parse are returned as errors in place so the caller can skip them.
pub fn parse_entries(text: &str) -> Vec<Result<FieldSet, FieldSetError>> {
    let mut entries = Vec::new();
    let mut current = FieldSet::new();
    let mut error: Option<FieldSetError> = None;
    let mut pending = false;

    for line in text.split('\n') {
        if error.is_some() {
            // Resynchronize on the next end marker.
            let trimmed = line.trim();
            if !trimmed.is_empty() && !trimmed.contains('=') {
                entries.extend(error.take().map(Err));
                current = FieldSet::new();
                pending = false;
            }
            continue;
        }
        match current.read_line(line) {
            Ok(Some(_marker)) => {
                entries.push(Ok(std::mem::take(&mut current)));
                pending = false;
            }
            Ok(None) => {
                pending = pending || !line.trim().is_empty();
            }
            Err(e) => error = Some(e),
        }
    }
    if let Some(e) = error {
        entries.push(Err(e));
    } else if pending {
        entries.push(Err(FieldSetError::MissingEndMarker));
    }
    entries
}

/// Builds a key from the fields a persisted request always carries.
pub fn key_of(fields: &FieldSet) -> Option<StoreKey> {
    let identifier = fields.get_nonempty("Identifier")?;
    let client = fields.get("ClientName").unwrap_or("");
    let global = fields.get_bool_or("Global", false).ok()?;
    Some(StoreKey::new(global, client, identifier))
}

impl FileStore {
    /// Opens the store at `path`, loading any entries already there. A
    /// missing file is an empty store.
    pub fn open(path: &Path, log: Option<&Logger>) -> Result<FileStore, StoreError> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("store" => path.display().to_string()));

        let mut entries = BTreeMap::new();
        match fs::read_to_string(path) {
            Ok(text) => {
                for entry in parse_entries(&text) {
                    match entry {
                        Ok(fields) => match key_of(&fields) {
                            Some(key) => {
                                entries.insert(key, fields);
                            }
                            None => {
                                warn!(log, "skipping store entry without identifier")
                            }
                        },
                        Err(e) => {
                            warn!(log, "skipping unreadable store entry"; "error" => %e)
                        }
                    }
                }
                info!(log, "loaded persistent requests"; "count" => entries.len());
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(log, "no persistent request file yet");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(FileStore {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            log,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self) -> Result<(), StoreError> {
        let _guard = lock(&self.flush_lock);
        // Clear first so a put racing with this write marks the store dirty
        // again.
        self.dirty.store(false, Ordering::SeqCst);

        let mut text = String::new();
        let count = {
            let entries = lock(&self.entries);
            for fields in entries.values() {
                text.push_str(&fields.serialize());
                text.push_str(END_MARKER);
                text.push('\n');
            }
            entries.len()
        };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let result = fs::write(&tmp, text.as_bytes())
            .and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            self.dirty.store(true, Ordering::SeqCst);
            warn!(self.log, "failed to write persistent requests"; "error" => %e);
            return Err(e.into());
        }
        debug!(self.log, "wrote persistent requests"; "count" => count);
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn put(&self, key: &StoreKey, fields: FieldSet) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.clone(), fields);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<(), StoreError> {
        if lock(&self.entries).remove(key).is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<FieldSet>, StoreError> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    fn force_flush(&self) -> Result<(), StoreError> {
        self.write_file()
    }

    fn flush_if_dirty(&self) -> Result<bool, StoreError> {
        if self.dirty.load(Ordering::SeqCst) {
            self.write_file().map(|_| true)
        } else {
            Ok(false)
        }
    }
}
