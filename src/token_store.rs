//! Token Store
//!
//! Single source of truth for whether the integration is connected. Holds the
//! app credentials, the OAuth2 token record and the default upload folder, all
//! persisted through an injected [`SettingsStore`]. A short-lived freshness
//! marker in the [`EphemeralCache`] avoids a refresh round-trip on every call.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::providers::DropboxError;
use crate::settings_store::{Clock, EphemeralCache, SettingsStore, SystemClock};

pub const KEY_APP_KEY: &str = "dropbox_app_key";
pub const KEY_APP_SECRET: &str = "dropbox_app_secret";
pub const KEY_ACCESS_TOKEN: &str = "dropbox_access_token";
pub const KEY_REFRESH_TOKEN: &str = "dropbox_refresh_token";
pub const KEY_TOKEN_EXPIRY: &str = "dropbox_token_expiry";
pub const KEY_FOLDER: &str = "dropbox_folder";

/// Cache key of the freshness marker
const KEY_TOKEN_FRESH: &str = "dropbox_access_token_fresh";

/// The marker lapses this long before the real expiry
pub const DEFAULT_FRESHNESS_MARGIN: Duration = Duration::from_secs(300);

/// App identity entered by the operator
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
}

impl Credentials {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.trim().to_string(),
            app_secret: app_secret.trim().to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.app_key.is_empty() && !self.app_secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &if self.app_secret.is_empty() { "" } else { "****" })
            .finish()
    }
}

/// Credentials + token record + folder selection over injected storage
#[derive(Clone)]
pub struct TokenStore {
    settings: Arc<dyn SettingsStore>,
    cache: Arc<dyn EphemeralCache>,
    clock: Arc<dyn Clock>,
    freshness_margin: Duration,
}

impl TokenStore {
    pub fn new(settings: Arc<dyn SettingsStore>, cache: Arc<dyn EphemeralCache>) -> Self {
        Self {
            settings,
            cache,
            clock: Arc::new(SystemClock),
            freshness_margin: DEFAULT_FRESHNESS_MARGIN,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_freshness_margin(mut self, margin: Duration) -> Self {
        self.freshness_margin = margin;
        self
    }

    /// Shared TTL cache (also used for OAuth CSRF state)
    pub fn cache(&self) -> Arc<dyn EphemeralCache> {
        self.cache.clone()
    }

    // ---- Credentials ----

    pub fn app_key(&self) -> String {
        self.settings.get_or(KEY_APP_KEY, "")
    }

    pub fn app_secret(&self) -> String {
        self.settings.get_or(KEY_APP_SECRET, "")
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            app_key: self.app_key(),
            app_secret: self.app_secret(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials().is_complete()
    }

    /// Persist new credentials. Tokens are scoped to the app identity that
    /// issued them, so any change to key or secret drops the session.
    /// Returns true when the stored tokens were cleared.
    pub fn update_credentials(&self, new: &Credentials) -> Result<bool, DropboxError> {
        let changed = self.credentials() != *new;
        // Clear first: a failed clear must not leave old tokens under new credentials
        if changed {
            info!("Dropbox app credentials changed, clearing stored tokens");
            self.clear_tokens()?;
        }

        self.settings.set_many(&[
            (KEY_APP_KEY, new.app_key.as_str()),
            (KEY_APP_SECRET, new.app_secret.as_str()),
        ])?;
        Ok(changed)
    }

    // ---- Token record ----

    /// Current token regardless of freshness (empty when disconnected)
    pub fn access_token(&self) -> String {
        self.settings.get_or(KEY_ACCESS_TOKEN, "")
    }

    pub fn refresh_token(&self) -> String {
        self.settings.get_or(KEY_REFRESH_TOKEN, "")
    }

    /// Absolute expiry recorded at the last save
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.settings
            .get(KEY_TOKEN_EXPIRY)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    pub fn is_connected(&self) -> bool {
        self.has_credentials() && !self.access_token().is_empty()
    }

    /// Connected is all the integration needs to serve files
    pub fn is_configured(&self) -> bool {
        self.is_connected()
    }

    /// True unless the freshness marker is still live.
    ///
    /// A lapsed marker is treated as expired even if the token may still be
    /// accepted server-side: an extra refresh is cheaper than a failed call.
    pub fn is_expired(&self) -> bool {
        if self.cache.get(KEY_TOKEN_FRESH).is_some() {
            return false;
        }
        if self.refresh_token().is_empty() {
            debug!("Access token freshness lapsed and no refresh token is stored");
        }
        true
    }

    /// Overwrite the token record. An empty `refresh_token` keeps the stored one.
    pub fn save_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
    ) -> Result<(), DropboxError> {
        let expires_in = i64::try_from(expires_in_secs).unwrap_or(i64::MAX);
        let expiry = self
            .clock
            .now()
            .timestamp()
            .saturating_add(expires_in)
            .to_string();

        let mut entries = vec![
            (KEY_ACCESS_TOKEN, access_token),
            (KEY_TOKEN_EXPIRY, expiry.as_str()),
        ];
        if !refresh_token.is_empty() {
            entries.push((KEY_REFRESH_TOKEN, refresh_token));
        }
        self.settings.set_many(&entries)?;

        let fresh_for = Duration::from_secs(expires_in_secs).saturating_sub(self.freshness_margin);
        if fresh_for.is_zero() {
            // Lifetime shorter than the margin: next use refreshes
            self.cache.delete(KEY_TOKEN_FRESH)?;
        } else {
            self.cache.set(KEY_TOKEN_FRESH, "1", fresh_for)?;
        }

        debug!("Saved Dropbox tokens (fresh for {}s)", fresh_for.as_secs());
        Ok(())
    }

    /// Forget the token record locally. No call is made to Dropbox.
    pub fn clear_tokens(&self) -> Result<(), DropboxError> {
        self.cache.delete(KEY_TOKEN_FRESH)?;
        self.settings
            .delete_many(&[KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_TOKEN_EXPIRY])?;
        info!("Dropbox tokens cleared");
        Ok(())
    }

    // ---- Folder selection ----

    pub fn selected_folder(&self) -> String {
        self.settings.get_or(KEY_FOLDER, "")
    }

    pub fn set_selected_folder(&self, folder: &str) -> Result<(), DropboxError> {
        self.settings.set(KEY_FOLDER, folder.trim())?;
        Ok(())
    }
}
