//! File delivery
//!
//! Stored download references look like `edd-dropbox:///Products/ebook.pdf`.
//! At download time such a reference is swapped for a temporary link; any other
//! reference (a locally hosted URL) passes through. Uploads go to the selected
//! folder and hand back the reference to store.

use tracing::{debug, info, warn};

use crate::providers::{normalize_file_path, DropboxClient, DropboxError};

/// Extensions accepted for digital products
const ALLOWED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "pdf", "doc", "docx", "txt", "rtf", "jpg", "jpeg", "png",
    "gif", "webp", "mp3", "wav", "ogg", "flac", "m4a", "mp4", "avi", "mov", "wmv", "flv", "webm",
    "epub", "mobi", "azw", "azw3", "xls", "xlsx", "csv", "ppt", "pptx", "css", "js", "json", "xml",
];

/// Executable or server-side extensions refused anywhere in a file name
const BLOCKED_EXTENSIONS: &[&str] = &[
    "php", "phtml", "asp", "aspx", "jsp", "cgi", "pl", "py", "exe", "com", "bat", "cmd", "scr",
    "vbs", "jar", "sh", "bash", "zsh", "fish", "htaccess", "htpasswd",
];

/// A Dropbox-resident file reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropboxFileRef {
    path: String,
}

impl DropboxFileRef {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize_file_path(path),
        }
    }

    /// `None` when `reference` does not carry `prefix` or names no path
    pub fn parse(reference: &str, prefix: &str) -> Option<Self> {
        let path = reference.trim().strip_prefix(prefix)?;
        if path.trim().is_empty() {
            return None;
        }
        Some(Self::new(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn to_reference(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.path)
    }
}

/// Turns stored references into something a browser can download
pub struct DownloadResolver<'a> {
    client: &'a DropboxClient,
    prefix: String,
}

impl<'a> DownloadResolver<'a> {
    pub fn new(client: &'a DropboxClient, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    /// Temporary link for a Dropbox reference. Any failure, and any reference
    /// that is not Dropbox-resident, yields `reference` unchanged.
    pub async fn resolve(&self, reference: &str) -> String {
        let Some(file) = DropboxFileRef::parse(reference, &self.prefix) else {
            return reference.to_string();
        };

        if !self.client.tokens().is_connected() {
            debug!("Dropbox not connected for download: {}", file.path());
            return reference.to_string();
        }

        match self.client.get_temporary_link(file.path()).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to get temporary link for {}: {}", file.path(), e);
                reference.to_string()
            }
        }
    }
}

/// Where an upload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    /// Final path, after any autorename
    pub path: String,
    /// Reference to store with the product
    pub reference: String,
}

/// Final path component of a client-supplied name
fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim()
}

/// Extension allowlist plus a scan of every dotted segment for executables
pub fn is_allowed_file_name(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    let mut segments = lower.split('.');
    let stem = segments.next().unwrap_or("");
    let extensions: Vec<&str> = segments.collect();

    let Some(last) = extensions.last() else {
        return false;
    };
    if stem.is_empty() && extensions.len() == 1 {
        // Dotfile such as ".htaccess"
        return false;
    }
    if !ALLOWED_EXTENSIONS.contains(last) {
        return false;
    }
    !extensions.iter().any(|ext| BLOCKED_EXTENSIONS.contains(ext))
}

/// Upload `content` as `file_name` into `folder`, or into the selected
/// folder when `folder` is empty.
pub async fn upload_to_folder(
    client: &DropboxClient,
    prefix: &str,
    folder: Option<&str>,
    file_name: &str,
    content: Vec<u8>,
) -> Result<StoredUpload, DropboxError> {
    let name = base_name(file_name);
    if name.is_empty() {
        return Err(DropboxError::InvalidPath("missing file name".to_string()));
    }
    if !is_allowed_file_name(name) {
        warn!("Refusing upload of disallowed file type: {}", name);
        return Err(DropboxError::InvalidPath(format!("file type not allowed: {}", name)));
    }

    let mut folder = match folder.map(str::trim).filter(|f| !f.is_empty()) {
        Some(f) => f.to_string(),
        None => client.tokens().selected_folder(),
    };
    if !folder.ends_with('/') {
        folder.push('/');
    }

    let requested = normalize_file_path(&format!("{}{}", folder, name));
    let metadata = client.upload_file(&requested, content).await?;

    let path = metadata
        .path_display
        .filter(|p| !p.is_empty())
        .unwrap_or(requested);
    let reference = DropboxFileRef::new(&path).to_reference(prefix);

    info!("Stored upload at {}", path);
    Ok(StoredUpload { path, reference })
}
