//! Dropbox API Client
//!
//! Authenticated calls against the Dropbox API v2: folder listing with cursor
//! pagination, temporary download links, binary upload and account info.
//! Tokens come from [`OAuth2Manager`]; a 401 triggers one refresh and one retry.

use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::oauth2::{OAuth2Manager, OAuthStates};
use super::transport::{HttpTransport, ReqwestTransport};
use super::types::{
    sanitize_api_error, AccountInfo, DirectoryEntry, DropboxError, FileMetadata, HttpRequest,
    HttpResponse, RequestTimeouts, TokenGrant,
};
use crate::config::ClientConfig;
use crate::token_store::TokenStore;

/// Re-issues allowed after a 401 (each preceded by a refresh)
const MAX_AUTH_RETRIES: u32 = 1;

/// Dropbox file metadata as returned by `files/list_folder`
#[derive(Debug, Deserialize)]
struct DropboxMetadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    path_lower: Option<String>,
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
    client_modified: Option<String>,
}

/// List folder response
#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<DropboxMetadata>,
    #[serde(default)]
    cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct TemporaryLinkResult {
    link: Option<String>,
}

/// Listing path: `""` is the root, anything else is `/`-prefixed without a trailing slash
pub fn normalize_list_path(path: &str) -> String {
    let path = path.trim().trim_end_matches('/');
    if path.is_empty() {
        String::new()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// File path: `/`-prefixed, otherwise untouched
pub fn normalize_file_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Serialize `value` for an HTTP header: non-ASCII becomes `\uXXXX`
fn header_safe_json(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() && c != '\x7f' {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

fn parse_modified(raw: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

/// Convert Dropbox metadata to a listing entry; deleted and unknown tags are skipped
fn to_directory_entry(meta: DropboxMetadata) -> Option<DirectoryEntry> {
    let path_display = meta
        .path_display
        .clone()
        .or_else(|| meta.path_lower.clone())
        .unwrap_or_else(|| meta.name.clone());
    let path_lowercase = meta
        .path_lower
        .clone()
        .unwrap_or_else(|| path_display.to_lowercase());

    match meta.tag.as_str() {
        "file" => Some(DirectoryEntry {
            name: meta.name,
            path_display,
            path_lowercase,
            size_bytes: meta.size,
            modified_time: parse_modified(meta.client_modified.as_deref()),
            is_folder: false,
        }),
        "folder" => Some(DirectoryEntry {
            name: meta.name,
            path_display,
            path_lowercase,
            size_bytes: 0,
            modified_time: None,
            is_folder: true,
        }),
        _ => None,
    }
}

/// A request that can be re-issued with a different bearer token
struct PreparedCall {
    endpoint: String,
    url: String,
    content_type: &'static str,
    api_arg: Option<String>,
    body: Vec<u8>,
}

impl PreparedCall {
    fn to_request(&self, token: &str) -> Result<HttpRequest, DropboxError> {
        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.url.as_str())
            .header(http::header::AUTHORIZATION, format!("Bearer {}", token))
            .header(http::header::CONTENT_TYPE, self.content_type);
        if let Some(arg) = &self.api_arg {
            builder = builder.header("Dropbox-API-Arg", arg.as_str());
        }
        builder
            .body(self.body.clone())
            .map_err(|e| DropboxError::Protocol(format!("Invalid request for {}: {}", self.endpoint, e)))
    }
}

/// Dropbox client bound to one token store
pub struct DropboxClient {
    oauth: OAuth2Manager,
    transport: Arc<dyn HttpTransport>,
    api_base: String,
    content_base: String,
    timeouts: RequestTimeouts,
    folder_limit: usize,
}

impl DropboxClient {
    pub fn new(tokens: TokenStore, transport: Arc<dyn HttpTransport>, config: &ClientConfig) -> Self {
        Self {
            oauth: OAuth2Manager::new(tokens, transport.clone(), config),
            transport,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            content_base: config.content_base.trim_end_matches('/').to_string(),
            timeouts: config.timeouts(),
            folder_limit: config.folder_limit,
        }
    }

    /// Client over the production reqwest transport
    pub fn with_reqwest(tokens: TokenStore, config: &ClientConfig) -> Result<Self, DropboxError> {
        let transport = ReqwestTransport::new(&config.timeouts(), &config.user_agent)?;
        Ok(Self::new(tokens, Arc::new(transport), config))
    }

    pub fn tokens(&self) -> &TokenStore {
        self.oauth.tokens()
    }

    pub fn oauth(&self) -> &OAuth2Manager {
        &self.oauth
    }

    pub fn folder_limit(&self) -> usize {
        self.folder_limit
    }

    // ---- OAuth2 passthroughs ----

    pub fn build_authorization_url(&self, redirect_uri: &str) -> String {
        self.oauth.build_authorization_url(redirect_uri)
    }

    pub fn authorization_redirect(
        &self,
        states: &OAuthStates,
        session: &str,
        redirect_uri: &str,
    ) -> Result<String, DropboxError> {
        self.oauth.authorization_redirect(states, session, redirect_uri)
    }

    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, DropboxError> {
        self.oauth.exchange_code_for_token(code, redirect_uri).await
    }

    pub async fn complete_authorization(
        &self,
        states: &OAuthStates,
        session: &str,
        callback_query: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, DropboxError> {
        self.oauth
            .complete_authorization(states, session, callback_query, redirect_uri)
            .await
    }

    pub async fn refresh_access_token(&self) -> Result<(), DropboxError> {
        self.oauth.refresh_access_token().await
    }

    // ---- Authenticated transport ----

    /// Send `call` with a valid token. A 401 refreshes and re-issues the call
    /// at most [`MAX_AUTH_RETRIES`] times; a 401 after that is final.
    async fn send_authenticated(&self, call: &PreparedCall) -> Result<HttpResponse, DropboxError> {
        let mut attempt = 0;
        loop {
            // A retry uses the token the refresh just stored, even if its
            // lifetime is already inside the freshness margin
            let token = if attempt == 0 {
                self.oauth.get_valid_access_token().await?
            } else {
                self.oauth.current_access_token()?
            };
            let request = call.to_request(token.expose_secret())?;

            let response = self.transport.send(request, &self.timeouts).await.map_err(|e| {
                warn!("Dropbox {} failed: {}", call.endpoint, e);
                e
            })?;

            if response.status() != http::StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let message = sanitize_api_error(&String::from_utf8_lossy(response.body()));
            if attempt >= MAX_AUTH_RETRIES {
                warn!("Dropbox {} still unauthorized after refresh: {}", call.endpoint, message);
                return Err(DropboxError::AuthExpired(message));
            }

            debug!("Dropbox {} returned 401, refreshing token", call.endpoint);
            self.oauth.refresh_after_rejection(token.expose_secret()).await?;
            attempt += 1;
        }
    }

    fn rpc_call(&self, endpoint: &str, payload: Option<&Value>) -> PreparedCall {
        let body = payload.map(Value::to_string).unwrap_or_else(|| "null".to_string());
        PreparedCall {
            endpoint: endpoint.to_string(),
            url: format!("{}/{}", self.api_base, endpoint),
            content_type: "application/json",
            api_arg: None,
            body: body.into_bytes(),
        }
    }

    /// Authenticated RPC call (JSON in, JSON out). `None` sends a JSON `null` body.
    pub async fn api_request(
        &self,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<Value, DropboxError> {
        let call = self.rpc_call(endpoint, payload);
        let response = self.send_authenticated(&call).await?;

        let status = response.status().as_u16();
        let body = response.into_body();
        match status {
            200 => {
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Value::Null);
                }
                serde_json::from_slice(&body).map_err(|e| {
                    warn!("Dropbox {} returned malformed JSON: {}", endpoint, e);
                    DropboxError::Protocol(format!("Malformed response from {}: {}", endpoint, e))
                })
            }
            403 => {
                let message = sanitize_api_error(&String::from_utf8_lossy(&body));
                warn!(
                    "Dropbox {} forbidden, the app may be missing a permission scope: {}",
                    endpoint, message
                );
                Err(DropboxError::PermissionDenied(message))
            }
            _ => {
                let message = sanitize_api_error(&String::from_utf8_lossy(&body));
                warn!("Dropbox {} failed with status {}: {}", endpoint, status, message);
                Err(DropboxError::Api { status, message })
            }
        }
    }

    async fn rpc_typed<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<T, DropboxError> {
        let value = self.api_request(endpoint, payload).await?;
        serde_json::from_value(value).map_err(|e| {
            warn!("Dropbox {} returned an unexpected shape: {}", endpoint, e);
            DropboxError::Protocol(format!("Unexpected response from {}: {}", endpoint, e))
        })
    }

    // ---- Listing ----

    /// Walk every page of `files/list_folder`. With `folder_cap`, paging stops
    /// once that many folders have been seen.
    async fn list_folder_all(
        &self,
        path: &str,
        folder_cap: Option<usize>,
    ) -> Result<Vec<DirectoryEntry>, DropboxError> {
        if !self.tokens().is_connected() {
            debug!("Dropbox not connected, skipping listing");
            return Err(DropboxError::NotConnected);
        }
        let path = normalize_list_path(path);

        let mut body = json!({
            "path": path,
            "recursive": false,
            "include_deleted": false,
            "include_has_explicit_shared_members": false,
            "include_mounted_folders": true,
            "include_non_downloadable_files": false
        });
        if let Some(cap) = folder_cap {
            body["limit"] = json!(cap.clamp(1, 2000));
        }

        let mut result: ListFolderResult = self.rpc_typed("files/list_folder", Some(&body)).await?;
        let mut entries = Vec::new();
        let mut pages = 1;

        loop {
            entries.extend(result.entries.into_iter().filter_map(to_directory_entry));

            if let Some(cap) = folder_cap {
                if entries.iter().filter(|e| e.is_folder).count() >= cap {
                    debug!("Folder cap {} reached after {} page(s)", cap, pages);
                    break;
                }
            }
            if !result.has_more {
                break;
            }
            if result.cursor.is_empty() {
                return Err(DropboxError::Protocol(
                    "list_folder has_more without a cursor".to_string(),
                ));
            }

            let continue_body = json!({ "cursor": result.cursor });
            result = self
                .rpc_typed("files/list_folder/continue", Some(&continue_body))
                .await?;
            pages += 1;
        }

        Ok(entries)
    }

    /// All files and folders directly under `path`, across every page
    pub async fn list_files(&self, path: &str) -> Result<Vec<DirectoryEntry>, DropboxError> {
        let entries = self.list_folder_all(path, None).await?;
        info!("Listed {} entries in '{}'", entries.len(), normalize_list_path(path));
        Ok(entries)
    }

    /// `path_display` of up to `limit` folders under `path`, in discovery order.
    /// Folders beyond the cap are not reported.
    pub async fn list_folders(&self, path: &str, limit: usize) -> Result<Vec<String>, DropboxError> {
        let limit = limit.max(1);
        let folders: Vec<String> = self
            .list_folder_all(path, Some(limit))
            .await?
            .into_iter()
            .filter(|e| e.is_folder)
            .take(limit)
            .map(|e| e.path_display)
            .collect();
        debug!("Found {} folder(s) under '{}'", folders.len(), normalize_list_path(path));
        Ok(folders)
    }

    // ---- Files ----

    /// Short-lived direct download URL (Dropbox keeps it valid for about four hours)
    pub async fn get_temporary_link(&self, path: &str) -> Result<String, DropboxError> {
        let path = normalize_file_path(path);
        if path.is_empty() {
            return Err(DropboxError::InvalidPath("empty file path".to_string()));
        }

        let body = json!({ "path": path });
        let result: TemporaryLinkResult = self
            .rpc_typed("files/get_temporary_link", Some(&body))
            .await?;

        result
            .link
            .filter(|l| !l.is_empty())
            .ok_or_else(|| DropboxError::Protocol("get_temporary_link returned no link".to_string()))
    }

    /// Upload `content` to `path`. Name clashes are auto-renamed by Dropbox, so
    /// the returned metadata carries the final path.
    pub async fn upload_file(&self, path: &str, content: Vec<u8>) -> Result<FileMetadata, DropboxError> {
        let path = normalize_file_path(path);
        if path.is_empty() || path.ends_with('/') {
            return Err(DropboxError::InvalidPath(format!("not a file path: '{}'", path)));
        }

        let size = content.len();
        let arg = json!({
            "path": path,
            "mode": "add",
            "autorename": true,
            "mute": false,
            "strict_conflict": false
        });
        let call = PreparedCall {
            endpoint: "files/upload".to_string(),
            url: format!("{}/files/upload", self.content_base),
            content_type: "application/octet-stream",
            api_arg: Some(header_safe_json(&arg)),
            body: content,
        };

        let response = self.send_authenticated(&call).await?;
        let status = response.status().as_u16();
        let body = response.into_body();

        if status == 403 {
            let message = sanitize_api_error(&String::from_utf8_lossy(&body));
            warn!("Dropbox upload forbidden, the app may be missing files.content.write: {}", message);
            return Err(DropboxError::PermissionDenied(message));
        }
        if status != 200 {
            let message = sanitize_api_error(&String::from_utf8_lossy(&body));
            warn!("Dropbox upload of {} failed with status {}: {}", path, status, message);
            return Err(DropboxError::UploadRejected { status, message });
        }

        let metadata: FileMetadata = serde_json::from_slice(&body).map_err(|e| {
            warn!("Dropbox upload returned unexpected metadata: {}", e);
            DropboxError::Protocol(format!("Unexpected upload response: {}", e))
        })?;

        info!("Uploaded {} bytes to {}", size, metadata.path_display.as_deref().unwrap_or(&path));
        Ok(metadata)
    }

    // ---- Account ----

    /// Connected account, for diagnostics
    pub async fn get_account_info(&self) -> Result<AccountInfo, DropboxError> {
        self.rpc_typed("users/get_current_account", None).await
    }

    /// Invalidate the current access token server-side
    pub async fn revoke_token(&self) -> Result<(), DropboxError> {
        self.api_request("auth/token/revoke", None).await?;
        info!("Dropbox access token revoked");
        Ok(())
    }

    /// Forget the session locally. With `revoke`, first ask Dropbox to
    /// invalidate the token; a failed revocation is logged and ignored.
    pub async fn disconnect(&self, revoke: bool) -> Result<(), DropboxError> {
        if revoke && !self.tokens().access_token().is_empty() {
            if let Err(e) = self.revoke_token().await {
                warn!("Token revocation failed, clearing local tokens anyway: {}", e);
            }
        }
        self.tokens().clear_tokens()
    }
}
