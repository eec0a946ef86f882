//! HTTP transport seam
//!
//! Every Dropbox call goes through [`HttpTransport::send`], so the protocol
//! logic can be exercised against scripted responses. [`ReqwestTransport`]
//! is the production implementation.

use async_trait::async_trait;
use tracing::debug;

use super::types::{DropboxError, HttpRequest, HttpResponse, RequestTimeouts};

/// Narrow HTTP client interface: one request in, status + body out.
///
/// Non-2xx statuses are returned as responses, not errors; only failures to
/// complete the exchange (DNS, TLS, timeout, reset) are `Err`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: HttpRequest,
        timeouts: &RequestTimeouts,
    ) -> Result<HttpResponse, DropboxError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// The connect bound is fixed per client; the total bound is applied per request.
    pub fn new(timeouts: &RequestTimeouts, user_agent: &str) -> Result<Self, DropboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.total)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DropboxError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: HttpRequest,
        timeouts: &RequestTimeouts,
    ) -> Result<HttpResponse, DropboxError> {
        let (parts, body) = request.into_parts();
        let url = parts.uri.to_string();

        debug!("HTTP {} {}", parts.method, url);

        let response = self
            .client
            .request(parts.method, &url)
            .headers(parts.headers)
            .timeout(timeouts.total)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DropboxError::Transport(format!("Request timed out: {}", url))
                } else {
                    DropboxError::Transport(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DropboxError::Transport(format!("Failed to read response body: {}", e)))?;

        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(bytes.to_vec())
            .map_err(|e| DropboxError::Protocol(format!("Invalid response: {}", e)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for protocol tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A request as the mock saw it
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: String,
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RecordedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
        }

        pub fn form(&self) -> Vec<(String, String)> {
            url::form_urlencoded::parse(&self.body)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        }

        pub fn form_value(&self, key: &str) -> Option<String> {
            self.form().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
        }
    }

    /// Replays queued responses in order and records every request
    #[derive(Default)]
    pub struct MockTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, DropboxError>>>,
        recorded: Mutex<Vec<RecordedRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) -> &Self {
            self.push_raw(status, body.to_string().as_bytes())
        }

        pub fn push_raw(&self, status: u16, body: &[u8]) -> &Self {
            let response = http::Response::builder()
                .status(status)
                .body(body.to_vec())
                .unwrap();
            self.responses.lock().unwrap().push_back(Ok(response));
            self
        }

        pub fn push_error(&self, error: DropboxError) -> &Self {
            self.responses.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.recorded.lock().unwrap().clone()
        }

        pub fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.url.ends_with(suffix))
                .collect()
        }

        pub fn remaining(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(
            &self,
            request: HttpRequest,
            _timeouts: &RequestTimeouts,
        ) -> Result<HttpResponse, DropboxError> {
            let (parts, body) = request.into_parts();
            self.recorded.lock().unwrap().push(RecordedRequest {
                method: parts.method.to_string(),
                url: parts.uri.to_string(),
                headers: parts
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect(),
                body,
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DropboxError::Transport("no scripted response".into())))
        }
    }
}
