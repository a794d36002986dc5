// Copyright 2020 Joyent, Inc.

//! Server configuration, loaded from an optional JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    FrameLimits, DEFAULT_MAX_LINES, DEFAULT_MAX_LINE_LENGTH, DEFAULT_MAX_PAYLOAD_LENGTH,
};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:9481";
pub const DEFAULT_PERSISTENT_REQUESTS_FILE: &str = "fcp-persistent.dat";
pub const DEFAULT_PERSISTENCE_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_MAX_FILES_IN_INSERT: usize = 65536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub persistent_requests_file: PathBuf,
    /// When false, FOREVER requests are refused and nothing is written to
    /// `persistent_requests_file`.
    pub persistence_enabled: bool,
    pub persistence_interval_ms: u64,
    pub temp_dir: PathBuf,
    pub max_line_length: usize,
    pub max_lines: usize,
    pub max_payload_length: u64,
    pub max_files_in_insert: usize,
    pub node_name: String,
    pub node_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            persistent_requests_file: PathBuf::from(DEFAULT_PERSISTENT_REQUESTS_FILE),
            persistence_enabled: true,
            persistence_interval_ms: DEFAULT_PERSISTENCE_INTERVAL_MS,
            temp_dir: std::env::temp_dir(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_lines: DEFAULT_MAX_LINES,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            max_files_in_insert: DEFAULT_MAX_FILES_IN_INSERT,
            node_name: "Fred".to_string(),
            node_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<ServerConfig, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_line_length: self.max_line_length,
            max_lines: self.max_lines,
            max_payload_length: self.max_payload_length,
        }
    }

    pub fn persistence_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_interval_ms)
    }
}
