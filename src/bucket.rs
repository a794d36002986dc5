// Copyright 2020 Joyent, Inc.

//! Payload handles.
//!
//! A bucket is an opaque byte source with a size and a release operation.
//! Requests hold buckets for upload data that has not been inserted yet and
//! receive them from the engine as fetch results. Buckets backed by a file can
//! describe themselves as a field set so a persisted upload can find its data
//! again after a restart.

use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;

use crate::fieldset::FieldSet;

pub trait Bucket: Send + Sync + Debug {
    fn size(&self) -> u64;

    fn read_all(&self) -> io::Result<Bytes>;

    /// Releases the underlying storage. Safe to call more than once.
    fn free(&self);

    /// A field set from which [`BucketFactory::restore`] can rebuild this
    /// bucket, or `None` if the data does not outlive the process.
    fn persist_ref(&self) -> Option<FieldSet>;
}

pub type BucketRef = Arc<dyn Bucket>;

fn freed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "bucket has been freed")
}

#[derive(Debug)]
pub struct MemoryBucket {
    data: Mutex<Option<Bytes>>,
    size: u64,
}

impl MemoryBucket {
    pub fn new(data: Bytes) -> MemoryBucket {
        MemoryBucket {
            size: data.len() as u64,
            data: Mutex::new(Some(data)),
        }
    }
}

impl Bucket for MemoryBucket {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_all(&self) -> io::Result<Bytes> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.clone().ok_or_else(freed_error)
    }

    fn free(&self) {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn persist_ref(&self) -> Option<FieldSet> {
        None
    }
}

#[derive(Debug)]
pub struct FileBucket {
    path: PathBuf,
    size: u64,
    delete_on_free: bool,
    freed: AtomicBool,
}

impl FileBucket {
    /// Wraps an existing file. `delete_on_free` is false for files the client
    /// owns, such as the source of a disk upload.
    pub fn open(path: &Path, delete_on_free: bool) -> io::Result<FileBucket> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        Ok(FileBucket {
            path: path.to_path_buf(),
            size: meta.len(),
            delete_on_free,
            freed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Bucket for FileBucket {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_all(&self) -> io::Result<Bytes> {
        if self.freed.load(Ordering::SeqCst) {
            return Err(freed_error());
        }
        fs::read(&self.path).map(Bytes::from)
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.delete_on_free {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn persist_ref(&self) -> Option<FieldSet> {
        if self.freed.load(Ordering::SeqCst) {
            return None;
        }
        let mut fs = FieldSet::new();
        fs.put_single("Type", "file").ok()?;
        fs.put_single("Filename", self.path.display()).ok()?;
        fs.put_single("Size", self.size).ok()?;
        fs.put_single("DeleteOnFree", self.delete_on_free).ok()?;
        Some(fs)
    }
}

/// An empty bucket, for requests that carry no data of their own.
#[derive(Debug, Default)]
pub struct NullBucket;

impl Bucket for NullBucket {
    fn size(&self) -> u64 {
        0
    }

    fn read_all(&self) -> io::Result<Bytes> {
        Ok(Bytes::new())
    }

    fn free(&self) {}

    fn persist_ref(&self) -> Option<FieldSet> {
        let mut fs = FieldSet::new();
        fs.put_single("Type", "null").ok()?;
        Some(fs)
    }
}

/// Creates buckets for incoming payloads. Payloads that must survive a
/// restart are spilled to files under `temp_dir`.
#[derive(Clone, Debug)]
pub struct BucketFactory {
    temp_dir: PathBuf,
}

impl BucketFactory {
    pub fn new(temp_dir: PathBuf) -> BucketFactory {
        BucketFactory { temp_dir }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn memory(&self, data: Bytes) -> BucketRef {
        Arc::new(MemoryBucket::new(data))
    }

    /// Spills `data` to a new file. This blocks; async callers run it on the
    /// blocking pool.
    pub fn persistent(&self, data: &[u8]) -> io::Result<BucketRef> {
        fs::create_dir_all(&self.temp_dir)?;
        let suffix: u64 = rand::thread_rng().gen();
        let path = self.temp_dir.join(format!("fcp-bucket-{:016x}.tmp", suffix));
        fs::write(&path, data)?;
        Ok(Arc::new(FileBucket::open(&path, true)?))
    }

    /// Rebuilds a bucket from a [`Bucket::persist_ref`] field set.
    pub fn restore(&self, fs: &FieldSet) -> io::Result<BucketRef> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        match fs.get("Type") {
            Some("file") => {
                let path = fs
                    .get_nonempty("Filename")
                    .ok_or_else(|| invalid("file bucket without Filename"))?;
                let delete_on_free = fs
                    .get_bool_or("DeleteOnFree", false)
                    .map_err(|e| invalid(&e.to_string()))?;
                let bucket = FileBucket::open(Path::new(path), delete_on_free)?;
                if let Some(expected) = fs
                    .get_number::<u64>("Size")
                    .map_err(|e| invalid(&e.to_string()))?
                {
                    if expected != bucket.size() {
                        return Err(invalid("file bucket changed size"));
                    }
                }
                Ok(Arc::new(bucket))
            }
            Some("null") => Ok(Arc::new(NullBucket)),
            _ => Err(invalid("unknown bucket type")),
        }
    }
}
