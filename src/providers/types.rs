//! Shared types for the Dropbox integration
//!
//! This module contains the error taxonomy, the normalized results handed to
//! collaborators (directory entries, token grants, upload metadata) and the
//! HTTP request/response aliases used by the transport seam.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outgoing request as seen by the transport (body already encoded)
pub type HttpRequest = http::Request<Vec<u8>>;

/// Response as returned by the transport (status + raw body)
pub type HttpResponse = http::Response<Vec<u8>>;

/// Per-call network bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Maximum time to establish the connection
    pub connect: Duration,
    /// Maximum time for the whole exchange
    pub total: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            total: Duration::from_secs(10),
        }
    }
}

/// Result of a successful authorization-code exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Empty when Dropbox did not issue one
    pub refresh_token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
}

/// One item of a folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path_display: String,
    pub path_lowercase: String,
    /// Always 0 for folders
    pub size_bytes: u64,
    /// Client modification time; absent for folders
    pub modified_time: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

/// Metadata returned by `files/upload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub client_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_modified: Option<DateTime<Utc>>,
}

/// Display name block of `users/get_current_account`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountName {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub surname: String,
}

/// Connected account, used for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: AccountName,
    #[serde(default)]
    pub country: Option<String>,
}

/// Dropbox integration error types
///
/// Every failure inside the client is converted into one of these buckets and
/// logged before it is returned; nothing escapes as a panic.
#[derive(Error, Debug)]
pub enum DropboxError {
    #[error("Dropbox app key and secret are not configured")]
    NotConfigured,

    #[error("Not connected to Dropbox")]
    NotConnected,

    #[error("Access token rejected: {0}")]
    AuthExpired(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Upload rejected (HTTP {status}): {message}")]
    UploadRejected { status: u16, message: String },

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("OAuth state check failed: {0}")]
    InvalidState(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DropboxError {
    /// Only an expired token can be fixed automatically (refresh + retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DropboxError::AuthExpired(_))
    }

    /// Stable bucket name so collaborators can pick a message without matching on text
    pub fn kind(&self) -> &'static str {
        match self {
            DropboxError::NotConfigured => "not_configured",
            DropboxError::NotConnected => "not_connected",
            DropboxError::AuthExpired(_) => "auth_expired",
            DropboxError::PermissionDenied(_) => "permission_denied",
            DropboxError::Transport(_) => "transport_error",
            DropboxError::Protocol(_) => "protocol_error",
            DropboxError::UploadRejected { .. } => "upload_rejected",
            DropboxError::Api { .. } => "api_error",
            DropboxError::InvalidState(_) => "invalid_state",
            DropboxError::AuthorizationDenied(_) => "authorization_denied",
            DropboxError::InvalidPath(_) => "invalid_path",
            DropboxError::Storage(_) => "storage_error",
        }
    }
}

impl From<crate::settings_store::StoreError> for DropboxError {
    fn from(err: crate::settings_store::StoreError) -> Self {
        DropboxError::Storage(err.to_string())
    }
}

/// Maximum characters of a remote error body kept in error messages
const MAX_API_ERROR_LEN: usize = 300;

/// Reduce a raw API error body to something safe to log and show.
///
/// Prefers Dropbox's `error_summary` field, strips control characters and
/// truncates long bodies.
pub fn sanitize_api_error(body: &str) -> String {
    let summary = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error_summary")
                .or_else(|| v.get("error_description"))
                .and_then(|s| s.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());

    let cleaned: String = summary
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.chars().count() > MAX_API_ERROR_LEN {
        let truncated: String = cleaned.chars().take(MAX_API_ERROR_LEN).collect();
        format!("{}...", truncated)
    } else {
        cleaned.to_string()
    }
}
