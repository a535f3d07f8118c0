//! Unified error types for vpcctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Topology store errors
    #[error("Failed to read state file '{path}': {source}")]
    StoreRead { path: PathBuf, source: io::Error },

    #[error("Failed to write state file '{path}': {source}")]
    StoreWrite { path: PathBuf, source: io::Error },

    #[error("Failed to parse state file '{path}': {source}")]
    StoreParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    // Policy errors
    #[error("Failed to read policy file '{path}': {source}")]
    PolicyRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse policy file '{path}': {source}")]
    PolicyParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    // Topology errors
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Invalid address block '{block}': {reason}")]
    InvalidBlock { block: String, reason: String },

    #[error("Address block {block} overlaps {other} ({owner})")]
    Overlap {
        block: String,
        other: String,
        owner: String,
    },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Identifier '{id}' for {wanted} is already used by {holder}")]
    IdentifierCollision {
        id: String,
        wanted: String,
        holder: String,
    },

    // Directive errors
    #[error("Directive {step} failed: {directive} - {message}")]
    DirectiveFailed {
        step: usize,
        directive: String,
        message: String,
    },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // System errors
    #[error("This command requires root privileges (run with sudo or use --dry-run)")]
    PrivilegeRequired,
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
