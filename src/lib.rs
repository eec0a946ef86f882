// EDD Dropbox Storage - Dropbox-backed file delivery for Easy Digital Downloads
// OAuth2 token lifecycle, authenticated Dropbox API v2 access and download-link resolution

pub mod config;
pub mod delivery;
pub mod providers;
pub mod settings_store;
pub mod token_store;

pub use config::ClientConfig;
pub use delivery::{upload_to_folder, DownloadResolver, DropboxFileRef, StoredUpload};
pub use providers::{
    CallbackParams, DirectoryEntry, DropboxClient, DropboxError, HttpTransport, OAuth2Manager,
    OAuthStates, ReqwestTransport, TokenGrant,
};
pub use settings_store::{
    Clock, EphemeralCache, JsonFileSettings, MemoryCache, MemorySettings, SettingsStore,
    StoreError, SystemClock, TransientCache,
};
pub use token_store::{Credentials, TokenStore};
