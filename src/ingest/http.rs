// src/ingest/http.rs
//! Outbound HTTP that only ever connects to guard-validated addresses.
//!
//! Redirects are followed by hand so each hop goes back through the
//! [`SsrfGuard`]. The client for a hop pins the validated host name to the
//! validated addresses, so the connection cannot be steered by a second DNS
//! answer while TLS still verifies the certificate for the original name.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::{redirect, Client, StatusCode};
use snafu::ResultExt;
use url::Url;

use crate::ingest::error::{
    BadRedirectSnafu, BlockedSnafu, BodyTooLargeSnafu, FetchError, HttpSnafu, StatusSnafu,
    TooManyRedirectsSnafu,
};
use crate::ingest::guard::{PinnedTarget, SsrfGuard};

pub const DEFAULT_USER_AGENT: &str = concat!("argos-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL of the response that was finally read, after redirects.
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Clone)]
pub struct GuardedHttp {
    guard: Arc<SsrfGuard>,
    timeout: Duration,
    max_redirects: usize,
    max_body_bytes: usize,
    user_agent: String,
}

impl GuardedHttp {
    pub fn new(
        guard: Arc<SsrfGuard>,
        timeout: Duration,
        max_redirects: usize,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            guard,
            timeout,
            max_redirects,
            max_body_bytes,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn guard(&self) -> &SsrfGuard {
        &self.guard
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url`, bounded by the configured overall timeout.
    pub async fn get(&self, url: &str, accept: &str) -> Result<FetchedPage, FetchError> {
        match tokio::time::timeout(self.timeout, self.get_inner(url, accept)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn get_inner(&self, url: &str, accept: &str) -> Result<FetchedPage, FetchError> {
        let mut target = self.guard.validate(url).await.context(BlockedSnafu)?;
        let mut hops = 0usize;

        loop {
            let client = self.client_for(&target)?;
            let resp = client
                .get(target.url().clone())
                .header(USER_AGENT, &self.user_agent)
                .header(ACCEPT, accept)
                .send()
                .await
                .map_err(|e| self.map_reqwest(e))?;

            let status = resp.status();
            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                hops += 1;
                if hops > self.max_redirects {
                    return TooManyRedirectsSnafu {
                        max: self.max_redirects,
                    }
                    .fail();
                }
                let next = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| target.url().join(loc).ok())
                    .ok_or_else(|| {
                        BadRedirectSnafu {
                            url: target.url().to_string(),
                        }
                        .build()
                    })?;
                tracing::debug!(target: "ingest", from = %target.url(), to = %next, "following redirect");
                target = self
                    .guard
                    .validate(next.as_str())
                    .await
                    .context(BlockedSnafu)?;
                continue;
            }

            if !status.is_success() {
                return StatusSnafu {
                    status: status.as_u16(),
                    url: target.url().to_string(),
                }
                .fail();
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let final_url = target.url().clone();
            let body = self.read_capped(resp).await?;
            return Ok(FetchedPage {
                final_url,
                status: status.as_u16(),
                content_type,
                body,
            });
        }
    }

    fn client_for(&self, target: &PinnedTarget) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .no_proxy()
            .timeout(self.timeout);
        if let Some(domain) = target.domain() {
            builder = builder.resolve_to_addrs(domain, target.addrs());
        }
        builder.build().context(HttpSnafu)
    }

    async fn read_capped(&self, mut resp: reqwest::Response) -> Result<String, FetchError> {
        if let Some(len) = resp.content_length() {
            if len as usize > self.max_body_bytes {
                return BodyTooLargeSnafu {
                    limit: self.max_body_bytes,
                }
                .fail();
            }
        }
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.map_reqwest(e))? {
            if buf.len() + chunk.len() > self.max_body_bytes {
                return BodyTooLargeSnafu {
                    limit: self.max_body_bytes,
                }
                .fail();
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn map_reqwest(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else {
            FetchError::Http { source: e }
        }
    }
}
