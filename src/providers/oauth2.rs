//! OAuth2 Authentication Module
//!
//! Authorization-code and refresh grants against the Dropbox token endpoint,
//! plus the CSRF state that guards the consent redirect. Tokens are persisted
//! through [`TokenStore`]; this module never holds them itself.
//!
//! ```text
//! Unauthorized ──authorization_redirect──▶ AwaitingCallback
//!      ▲                                        │ complete_authorization
//!      │ clear_tokens                           ▼
//! Disconnected ◀──────────────────────────── Connected ⇄ Expired
//!                                               refresh_access_token
//! ```

use oauth2::CsrfToken;
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::transport::HttpTransport;
use super::types::{sanitize_api_error, DropboxError, HttpRequest, RequestTimeouts, TokenGrant};
use crate::config::ClientConfig;
use crate::settings_store::EphemeralCache;
use crate::token_store::TokenStore;

/// Token endpoint response (only the fields we use)
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// One-shot CSRF nonces for the consent redirect, keyed by user session
pub struct OAuthStates {
    cache: Arc<dyn EphemeralCache>,
    ttl: Duration,
}

impl OAuthStates {
    pub fn new(cache: Arc<dyn EphemeralCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(session: &str) -> String {
        format!("dropbox_oauth_state_{}", session)
    }

    /// Create and remember a fresh nonce for `session`
    pub fn issue(&self, session: &str) -> Result<String, DropboxError> {
        let state = CsrfToken::new_random().secret().clone();
        self.cache.set(&Self::key(session), &state, self.ttl)?;
        Ok(state)
    }

    /// Check `presented` against the stored nonce. The stored nonce is deleted
    /// first, so it can be used at most once whatever the outcome.
    pub fn consume(&self, session: &str, presented: &str) -> Result<(), DropboxError> {
        let key = Self::key(session);
        let stored = self.cache.get(&key);
        self.cache.delete(&key)?;

        match stored {
            _ if presented.is_empty() => Err(DropboxError::InvalidState("missing state".into())),
            None => Err(DropboxError::InvalidState("no pending authorization".into())),
            Some(stored) if stored != presented => {
                Err(DropboxError::InvalidState("state mismatch".into()))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Query parameters Dropbox sends back to the redirect URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a query string. A full URL or request target is accepted too;
    /// everything up to the first `?` is ignored.
    pub fn parse(input: &str) -> Self {
        let query = match input.find('?') {
            Some(idx) => &input[idx + 1..],
            None => input,
        };
        // Drop a trailing " HTTP/1.1" or fragment
        let query = query.split([' ', '#']).next().unwrap_or("");

        let mut params = CallbackParams::default();
        for param in query.split('&').filter(|p| !p.is_empty()) {
            let mut kv = param.splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let raw = kv.next().unwrap_or("").replace('+', " ");
            let value = urlencoding::decode(&raw)
                .map(|v| v.into_owned())
                .unwrap_or(raw);

            match key {
                "code" => params.code = Some(value),
                "state" => params.state = Some(value),
                "error" => params.error = Some(value),
                "error_description" => params.error_description = Some(value),
                _ => {}
            }
        }
        params
    }
}

/// OAuth2 Manager for the Dropbox app
pub struct OAuth2Manager {
    tokens: TokenStore,
    transport: Arc<dyn HttpTransport>,
    auth_url: String,
    token_url: String,
    timeouts: RequestTimeouts,
    default_expires_in: u64,
    /// Serializes refreshes within this process
    refresh_lock: Mutex<()>,
}

impl OAuth2Manager {
    pub fn new(tokens: TokenStore, transport: Arc<dyn HttpTransport>, config: &ClientConfig) -> Self {
        Self {
            tokens,
            transport,
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            timeouts: config.timeouts(),
            default_expires_in: config.default_expires_in_secs,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Consent URL for `redirect_uri`. `token_access_type=offline` makes
    /// Dropbox issue a refresh token. The caller appends the CSRF state.
    pub fn build_authorization_url(&self, redirect_uri: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.tokens.app_key())
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("token_access_type", "offline")
            .finish();
        format!("{}?{}", self.auth_url, query)
    }

    /// Authorization URL with a freshly issued state for `session`
    pub fn authorization_redirect(
        &self,
        states: &OAuthStates,
        session: &str,
        redirect_uri: &str,
    ) -> Result<String, DropboxError> {
        if !self.tokens.has_credentials() {
            return Err(DropboxError::NotConfigured);
        }
        let state = states.issue(session)?;
        let url = format!(
            "{}&state={}",
            self.build_authorization_url(redirect_uri),
            urlencoding::encode(&state)
        );
        info!("OAuth2 authorization URL generated for Dropbox");
        Ok(url)
    }

    fn token_request(&self, form: &[(&str, &str)]) -> Result<HttpRequest, DropboxError> {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in form {
            serializer.append_pair(key, value);
        }
        http::Request::builder()
            .method(http::Method::POST)
            .uri(self.token_url.as_str())
            .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(http::header::ACCEPT, "application/json")
            .body(serializer.finish().into_bytes())
            .map_err(|e| DropboxError::Protocol(format!("Invalid token request: {}", e)))
    }

    /// POST to the token endpoint; returns the parsed body of a 200 response
    async fn post_token_form(
        &self,
        form: &[(&str, &str)],
        what: &str,
    ) -> Result<TokenResponse, DropboxError> {
        let request = self.token_request(form)?;
        let response = self.transport.send(request, &self.timeouts).await.map_err(|e| {
            warn!("Token {} error: {}", what, e);
            e
        })?;

        let status = response.status().as_u16();
        let body = String::from_utf8_lossy(response.body()).into_owned();
        if status != 200 {
            warn!("Token {} failed with status: {}", what, status);
            return Err(DropboxError::Api {
                status,
                message: sanitize_api_error(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!("Token {} returned malformed JSON: {}", what, e);
            DropboxError::Protocol(format!("Malformed token response: {}", e))
        })
    }

    /// Exchange an authorization code. Nothing is saved here; the caller
    /// persists the grant (see [`Self::complete_authorization`]).
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, DropboxError> {
        let credentials = self.tokens.credentials();
        if !credentials.is_complete() {
            return Err(DropboxError::NotConfigured);
        }

        let body = self
            .post_token_form(
                &[
                    ("code", code),
                    ("grant_type", "authorization_code"),
                    ("redirect_uri", redirect_uri),
                    ("client_id", credentials.app_key.as_str()),
                    ("client_secret", credentials.app_secret.as_str()),
                ],
                "exchange",
            )
            .await?;

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DropboxError::Protocol("Token response has no access_token".into()))?;

        info!("OAuth2 tokens obtained for Dropbox");
        Ok(TokenGrant {
            access_token,
            refresh_token: body.refresh_token.unwrap_or_default(),
            expires_in: body.expires_in.unwrap_or(self.default_expires_in),
        })
    }

    /// Finish the redirect round-trip: verify state, surface a denial,
    /// exchange the code and save the tokens.
    pub async fn complete_authorization(
        &self,
        states: &OAuthStates,
        session: &str,
        callback_query: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, DropboxError> {
        let params = CallbackParams::parse(callback_query);

        states.consume(session, params.state.as_deref().unwrap_or(""))?;

        if let Some(error) = params.error {
            let detail = match params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            };
            warn!("Dropbox authorization returned an error: {}", detail);
            return Err(DropboxError::AuthorizationDenied(detail));
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DropboxError::Protocol("Callback has no authorization code".into()))?;

        let grant = self.exchange_code_for_token(&code, redirect_uri).await?;
        self.tokens
            .save_tokens(&grant.access_token, &grant.refresh_token, grant.expires_in)?;
        Ok(grant)
    }

    async fn refresh_locked(&self) -> Result<(), DropboxError> {
        let refresh_token = self.tokens.refresh_token();
        if refresh_token.is_empty() {
            debug!("No refresh token stored, cannot refresh");
            return Err(DropboxError::NotConnected);
        }
        let credentials = self.tokens.credentials();

        let body = self
            .post_token_form(
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", credentials.app_key.as_str()),
                    ("client_secret", credentials.app_secret.as_str()),
                ],
                "refresh",
            )
            .await
            .map_err(|e| match e {
                // Grant rejected: the session cannot be renewed
                DropboxError::Api { .. } => DropboxError::NotConnected,
                other => other,
            })?;

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DropboxError::Protocol("Refresh response has no access_token".into()))?;

        // Dropbox does not reissue the refresh token; empty keeps the stored one
        self.tokens.save_tokens(
            &access_token,
            "",
            body.expires_in.unwrap_or(self.default_expires_in),
        )?;

        info!("OAuth2 tokens refreshed for Dropbox");
        Ok(())
    }

    /// Run the refresh grant with the stored refresh token
    pub async fn refresh_access_token(&self) -> Result<(), DropboxError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh after the API rejected `rejected_token`, unless another task
    /// already replaced it while we waited for the lock.
    pub(crate) async fn refresh_after_rejection(&self, rejected_token: &str) -> Result<(), DropboxError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.tokens.access_token();
        if !current.is_empty() && current != rejected_token {
            debug!("Token already refreshed by a concurrent call");
            return Ok(());
        }
        self.refresh_locked().await
    }

    /// Stored token without a freshness check, for re-issuing a call right
    /// after a refresh
    pub(crate) fn current_access_token(&self) -> Result<SecretString, DropboxError> {
        let token = self.tokens.access_token();
        if token.is_empty() {
            return Err(DropboxError::NotConnected);
        }
        Ok(SecretString::from(token))
    }

    /// Get valid access token (refreshing if needed)
    pub async fn get_valid_access_token(&self) -> Result<SecretString, DropboxError> {
        if self.tokens.access_token().is_empty() {
            return Err(DropboxError::NotConnected);
        }

        if self.tokens.is_expired() {
            let _guard = self.refresh_lock.lock().await;
            // Re-check: a concurrent caller may have refreshed while we waited
            if self.tokens.is_expired() {
                self.refresh_locked().await?;
            }
        }

        let token = self.tokens.access_token();
        if token.is_empty() {
            return Err(DropboxError::NotConnected);
        }
        Ok(SecretString::from(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::transport::testing::MockTransport;
    use crate::settings_store::{ManualClock, MemoryCache, MemorySettings};
    use crate::token_store::Credentials;
    use secrecy::ExposeSecret;
    use serde_json::json;

    struct Harness {
        manager: OAuth2Manager,
        states: OAuthStates,
        mock: Arc<MockTransport>,
        clock: Arc<ManualClock>,
    }

    fn harness(with_credentials: bool) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let cache: Arc<dyn EphemeralCache> = Arc::new(MemoryCache::with_clock(clock.clone()));
        let tokens = TokenStore::new(Arc::new(MemorySettings::new()), cache.clone())
            .with_clock(clock.clone());
        if with_credentials {
            tokens.update_credentials(&Credentials::new("app-key", "app-secret")).unwrap();
        }
        let mock = Arc::new(MockTransport::new());
        let manager = OAuth2Manager::new(tokens, mock.clone(), &ClientConfig::default());
        let states = OAuthStates::new(cache, Duration::from_secs(600));
        Harness { manager, states, mock, clock }
    }

    #[test]
    fn test_authorization_url_parameters() {
        let h = harness(true);
        let url = h.manager.build_authorization_url("https://site.test/cb");
        assert_eq!(
            url,
            "https://www.dropbox.com/oauth2/authorize?client_id=app-key&redirect_uri=https%3A%2F%2Fsite.test%2Fcb&response_type=code&token_access_type=offline"
        );
    }

    #[test]
    fn test_authorization_redirect_requires_credentials() {
        let h = harness(false);
        assert!(matches!(
            h.manager.authorization_redirect(&h.states, "1", "https://site.test/cb"),
            Err(DropboxError::NotConfigured)
        ));
    }

    #[test]
    fn test_authorization_redirect_appends_state() {
        let h = harness(true);
        let url = h.manager.authorization_redirect(&h.states, "1", "https://site.test/cb").unwrap();
        let state = CallbackParams::parse(&url).state.unwrap();
        assert!(!state.is_empty());
        assert!(h.states.consume("1", &state).is_ok());
    }

    #[test]
    fn test_state_is_single_use() {
        let h = harness(true);
        let state = h.states.issue("7").unwrap();
        assert!(h.states.consume("7", &state).is_ok());
        assert!(matches!(h.states.consume("7", &state), Err(DropboxError::InvalidState(_))));
    }

    #[test]
    fn test_state_mismatch_still_consumes() {
        let h = harness(true);
        let state = h.states.issue("7").unwrap();
        assert!(h.states.consume("7", "forged").is_err());
        assert!(h.states.consume("7", &state).is_err());
    }

    #[test]
    fn test_state_expires_after_ttl() {
        let h = harness(true);
        let state = h.states.issue("7").unwrap();
        h.clock.advance(Duration::from_secs(601));
        assert!(matches!(h.states.consume("7", &state), Err(DropboxError::InvalidState(_))));
    }

    #[test]
    fn test_state_is_per_session() {
        let h = harness(true);
        let state = h.states.issue("alice").unwrap();
        assert!(h.states.consume("bob", &state).is_err());
        assert!(h.states.consume("alice", &state).is_ok());
    }

    #[test]
    fn test_callback_params_parse() {
        let params = CallbackParams::parse("GET /cb?code=abc%2F123&state=xyz HTTP/1.1");
        assert_eq!(params.code.as_deref(), Some("abc/123"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(params.error.is_none());

        let denied = CallbackParams::parse("error=access_denied&error_description=The+user+declined");
        assert_eq!(denied.error.as_deref(), Some("access_denied"));
        assert_eq!(denied.error_description.as_deref(), Some("The user declined"));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let h = harness(true);
        h.mock.push_json(200, json!({"access_token": "A", "refresh_token": "R", "expires_in": 3600}));

        let grant = h.manager.exchange_code_for_token("the-code", "https://site.test/cb").await.unwrap();
        assert_eq!(
            grant,
            TokenGrant { access_token: "A".into(), refresh_token: "R".into(), expires_in: 3600 }
        );

        let requests = h.mock.requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "https://api.dropboxapi.com/oauth2/token");
        assert_eq!(req.form_value("grant_type").as_deref(), Some("authorization_code"));
        assert_eq!(req.form_value("code").as_deref(), Some("the-code"));
        assert_eq!(req.form_value("redirect_uri").as_deref(), Some("https://site.test/cb"));
        assert_eq!(req.form_value("client_id").as_deref(), Some("app-key"));
        assert_eq!(req.form_value("client_secret").as_deref(), Some("app-secret"));

        // Exchange alone does not persist anything
        assert!(h.manager.tokens().access_token().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_code_defaults() {
        let h = harness(true);
        h.mock.push_json(200, json!({"access_token": "A"}));

        let grant = h.manager.exchange_code_for_token("c", "https://site.test/cb").await.unwrap();
        assert_eq!(grant.refresh_token, "");
        assert_eq!(grant.expires_in, 14400);
    }

    #[tokio::test]
    async fn test_exchange_code_failure_saves_nothing() {
        let h = harness(true);
        h.mock.push_json(400, json!({"error": "invalid_grant", "error_description": "code doesn't exist"}));

        let err = h.manager.exchange_code_for_token("bad", "https://site.test/cb").await.unwrap_err();
        assert!(matches!(err, DropboxError::Api { status: 400, .. }));
        assert!(h.manager.tokens().access_token().is_empty());
        assert!(!h.manager.tokens().is_connected());
    }

    #[tokio::test]
    async fn test_exchange_code_without_access_token_fails() {
        let h = harness(true);
        h.mock.push_json(200, json!({"token_type": "bearer"}));
        assert!(matches!(
            h.manager.exchange_code_for_token("c", "https://site.test/cb").await,
            Err(DropboxError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_authorization_saves_tokens() {
        let h = harness(true);
        let state = h.states.issue("1").unwrap();
        h.mock.push_json(200, json!({"access_token": "A", "refresh_token": "R", "expires_in": 14400}));

        let query = format!("code=the-code&state={}", state);
        h.manager
            .complete_authorization(&h.states, "1", &query, "https://site.test/cb")
            .await
            .unwrap();

        let tokens = h.manager.tokens();
        assert!(tokens.is_connected());
        assert_eq!(tokens.access_token(), "A");
        assert_eq!(tokens.refresh_token(), "R");
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn test_complete_authorization_rejects_bad_state_without_network() {
        let h = harness(true);
        h.states.issue("1").unwrap();

        let err = h
            .manager
            .complete_authorization(&h.states, "1", "code=c&state=forged", "https://site.test/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, DropboxError::InvalidState(_)));
        assert!(h.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_complete_authorization_surfaces_denial() {
        let h = harness(true);
        let state = h.states.issue("1").unwrap();
        let query = format!("error=access_denied&state={}", state);

        let err = h
            .manager
            .complete_authorization(&h.states, "1", &query, "https://site.test/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, DropboxError::AuthorizationDenied(ref d) if d == "access_denied"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token() {
        let h = harness(true);
        h.manager.tokens().save_tokens("old", "R", 14400).unwrap();
        h.mock.push_json(200, json!({"access_token": "new", "expires_in": 14400}));

        h.manager.refresh_access_token().await.unwrap();

        assert_eq!(h.manager.tokens().access_token(), "new");
        assert_eq!(h.manager.tokens().refresh_token(), "R");
        let req = &h.mock.requests()[0];
        assert_eq!(req.form_value("grant_type").as_deref(), Some("refresh_token"));
        assert_eq!(req.form_value("refresh_token").as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_not_connected() {
        let h = harness(true);
        h.manager.tokens().save_tokens("old", "", 14400).unwrap();
        assert!(matches!(
            h.manager.refresh_access_token().await,
            Err(DropboxError::NotConnected)
        ));
        assert!(h.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rejected_keeps_old_token() {
        let h = harness(true);
        h.manager.tokens().save_tokens("old", "R", 14400).unwrap();
        h.mock.push_json(400, json!({"error": "invalid_grant"}));

        assert!(matches!(
            h.manager.refresh_access_token().await,
            Err(DropboxError::NotConnected)
        ));
        assert_eq!(h.manager.tokens().access_token(), "old");
    }

    #[tokio::test]
    async fn test_valid_token_without_connection() {
        let h = harness(true);
        assert!(matches!(
            h.manager.get_valid_access_token().await,
            Err(DropboxError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_valid_token_fresh_skips_refresh() {
        let h = harness(true);
        h.manager.tokens().save_tokens("tok", "R", 14400).unwrap();

        let token = h.manager.get_valid_access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "tok");
        assert!(h.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_valid_token_refreshes_when_stale() {
        let h = harness(true);
        h.manager.tokens().save_tokens("tok", "R", 14400).unwrap();
        h.clock.advance(Duration::from_secs(14400 - 300));
        h.mock.push_json(200, json!({"access_token": "tok2", "expires_in": 14400}));

        let token = h.manager.get_valid_access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "tok2");
        assert_eq!(h.mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_valid_token_propagates_refresh_failure() {
        let h = harness(true);
        h.manager.tokens().save_tokens("tok", "R", 14400).unwrap();
        h.clock.advance(Duration::from_secs(14400));
        h.mock.push_error(DropboxError::Transport("connection reset".into()));

        assert!(matches!(
            h.manager.get_valid_access_token().await,
            Err(DropboxError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_after_rejection_skips_when_token_changed() {
        let h = harness(true);
        h.manager.tokens().save_tokens("already-new", "R", 14400).unwrap();

        h.manager.refresh_after_rejection("stale").await.unwrap();
        assert!(h.mock.requests().is_empty());
    }
}
