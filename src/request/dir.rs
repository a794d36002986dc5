// Copyright 2020 Joyent, Inc.

//! The file tree of a directory upload.

use std::collections::BTreeMap;

use crate::errors::{MessageInvalid, ProtocolErrorCode};
use crate::request::UploadSource;

#[derive(Clone, Debug)]
pub struct DirFile {
    pub source: UploadSource,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub enum DirEntry {
    File(DirFile),
    Directory(DirTree),
}

/// A tree of named entries. A name is either a file or a directory, never
/// both; inserting a path that would make it both is a validation failure.
#[derive(Clone, Debug, Default)]
pub struct DirTree {
    entries: BTreeMap<String, DirEntry>,
}

fn conflict(path: &str, reason: &str) -> MessageInvalid {
    MessageInvalid::new(
        ProtocolErrorCode::InvalidField,
        format!("Cannot add {}: {}", path, reason),
    )
}

impl DirTree {
    pub fn new() -> DirTree {
        DirTree::default()
    }

    /// Adds a file at a `/`-separated path, creating intermediate
    /// directories.
    pub fn insert(&mut self, path: &str, file: DirFile) -> Result<(), MessageInvalid> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(conflict(path, "empty path component"));
        }

        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Err(conflict(path, "empty path")),
        };
        let mut level = self;
        for segment in parents {
            let entry = level
                .entries
                .entry((*segment).to_string())
                .or_insert_with(|| DirEntry::Directory(DirTree::new()));
            level = match entry {
                DirEntry::Directory(tree) => tree,
                DirEntry::File(_) => {
                    return Err(conflict(path, &format!("{} is a file", segment)))
                }
            };
        }

        match level.entries.get(*last) {
            Some(DirEntry::Directory(_)) => Err(conflict(path, "it is a directory")),
            Some(DirEntry::File(_)) => Err(conflict(path, "duplicate file name")),
            None => {
                level.entries.insert((*last).to_string(), DirEntry::File(file));
                Ok(())
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&DirFile> {
        let mut level = self;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            match level.entries.get(segment)? {
                DirEntry::File(file) if segments.peek().is_none() => return Some(file),
                DirEntry::Directory(tree) => level = tree,
                DirEntry::File(_) => return None,
            }
        }
        None
    }

    fn collect<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a DirFile)>) {
        for (name, entry) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            match entry {
                DirEntry::File(file) => out.push((path, file)),
                DirEntry::Directory(tree) => tree.collect(&path, out),
            }
        }
    }

    /// Every file with its full path, depth first in name order.
    pub fn files(&self) -> Vec<(String, &DirFile)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                DirEntry::File(_) => 1,
                DirEntry::Directory(tree) => tree.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
