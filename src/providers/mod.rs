//! Dropbox Provider Module
//!
//! OAuth2 lifecycle and authenticated API access for the Dropbox integration.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               DropboxClient                 │
//! │  list, folders, temp links, upload, account │
//! └─────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │  OAuth2Manager  │─────▶│  HttpTransport  │
//! │ grants, refresh │      │ reqwest / mock  │
//! └─────────────────┘      └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   TokenStore    │
//! └─────────────────┘
//! ```

pub mod dropbox;
pub mod oauth2;
pub mod transport;
pub mod types;

pub use dropbox::{normalize_file_path, normalize_list_path, DropboxClient};
pub use oauth2::{CallbackParams, OAuth2Manager, OAuthStates};
pub use transport::{HttpTransport, ReqwestTransport};
pub use types::*;
