// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Partner, virtual-file and server configuration
//!
//! Configuration is read-mostly: the supervisor holds an `Arc` snapshot and
//! swaps the whole value on reload, so in-flight CONNECT validations keep
//! the snapshot they started with.

use super::constant::{ACCESS_READ, ACCESS_WRITE, DEFAULT_RECORD_LENGTH};
use super::error::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// What a partner is allowed to do, from this server's point of view:
/// `Write` lets it push files here, `Read` lets it fetch them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Read,
    Write,
    Both,
}

impl AccessType {
    /// Checks the requested PI 22 value against this grant.
    pub(crate) fn permits(self, pi22: u64) -> bool {
        match pi22 as u8 {
            ACCESS_WRITE => matches!(self, AccessType::Write | AccessType::Both),
            ACCESS_READ => matches!(self, AccessType::Read | AccessType::Both),
            _ => false,
        }
    }
}

/// Direction of one transfer, or of a virtual file's grant, seen from the
/// responder: `Send` means the responder emits the bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
    Both,
}

impl Direction {
    pub fn allows(self, requested: Direction) -> bool {
        self == Direction::Both || self == requested
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub id: String,
    /// Shared secret checked against PI 5. Storage hardening (hashing,
    /// vaulting) belongs to the host application.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_access")]
    pub access_type: AccessType,
    /// Per-partner concurrent session cap; `None` means unbounded.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// `*`/`?` wildcard patterns over virtual file ids; empty means all.
    #[serde(default)]
    pub allowed_file_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFileConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub direction: Direction,
    /// Resolved by the storage adapter; supports `${file}`, `${partner}`,
    /// `${date}`, `${serverId}`, `${virtualFile}` and `${direction}`.
    #[serde(default)]
    pub physical_path_template: Option<String>,
    #[serde(default = "default_record_length")]
    pub record_length: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
    /// Pins client certificates; mutual auth is required when present.
    #[serde(default)]
    pub ca_pem: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Matched case-insensitively against PI 4; empty accepts any.
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_bind")]
    pub bind_address: String,
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_base_timeout")]
    pub base_timeout_secs: u64,
    /// Strict mode refuses unknown partners, files and parameters.
    #[serde(default = "default_true")]
    pub strict: bool,
    /// Checkpoint interval forced back to initiators; `Some(0)` disables
    /// sync points on every session, `None` accepts the initiator's offer.
    #[serde(default)]
    pub sync_interval_kb: Option<u16>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub partners: Vec<PartnerConfig>,
    #[serde(default)]
    pub files: Vec<VirtualFileConfig>,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<ServerConfig, Error> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn partner(&self, id: &str) -> Option<&PartnerConfig> {
        self.partners.iter().find(|p| p.id == id)
    }

    pub fn file(&self, id: &str) -> Option<&VirtualFileConfig> {
        self.files.iter().find(|f| f.id == id)
    }
}

fn default_true() -> bool {
    true
}

fn default_access() -> AccessType {
    AccessType::Both
}

fn default_record_length() -> u16 {
    DEFAULT_RECORD_LENGTH
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_base_timeout() -> u64 {
    30
}
