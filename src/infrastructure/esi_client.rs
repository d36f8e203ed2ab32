//! Resilient ESI client
//!
//! Every call goes through the shared admission controller and waits out the
//! shared cooldown clock before hitting the network. The remote back-off
//! protocol is handled here so callers only see decoded data or a final
//! error:
//!
//! | status     | handling                                                  |
//! |------------|-----------------------------------------------------------|
//! | 500, 503   | fixed overload cooldown, retry                            |
//! | 420        | cooldown from `X-Esi-Error-Limit-Reset`, retry            |
//! | 504        | cooldown from the JSON `timeout` field, retry             |
//! | other !200 | decode `{"error": ...}` and fail without retry            |
//! | 200        | decode payload, read `X-Pages`                            |
//!
//! Network failures and undecodable bodies are retried as well. When the
//! attempt budget runs out the last underlying error is returned.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::EsiConfig;
use super::cooldown::CooldownClock;
use super::esi_error::FetchError;
use super::priority_semaphore::{PrioritySemaphore, Ticket};
use super::sso::SsoTokenCache;

pub const ERROR_LIMIT_RESET_HEADER: &str = "X-Esi-Error-Limit-Reset";
pub const PAGES_HEADER: &str = "X-Pages";

/// One logical remote call
#[derive(Debug, Clone)]
pub struct EsiRequest {
    pub method: Method,
    pub path: String,
    pub authenticated: bool,
    /// Admission priority, larger is more urgent
    pub priority: i64,
    pub attempts: u32,
}

impl EsiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            authenticated: false,
            priority: 0,
            attempts: 1,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub const fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

/// Decoded payload plus the pagination count, when the remote sent a sane one
#[derive(Debug, Clone, PartialEq)]
pub struct EsiResponse<T> {
    pub data: T,
    pub pages: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct TimeoutBody {
    #[serde(default)]
    error: String,
    timeout: i64,
}

/// Cooldown and pagination bounds taken from [`EsiConfig`]
#[derive(Debug, Clone)]
struct Limits {
    queue_timeout: Duration,
    overload_cooldown: Duration,
    fallback_cooldown: Duration,
    max_cooldown_secs: u64,
    max_pages: u32,
}

#[derive(Clone)]
pub struct EsiClient {
    http: Client,
    base_url: String,
    semaphore: Arc<PrioritySemaphore>,
    cooldown: Arc<CooldownClock>,
    sso: Option<Arc<SsoTokenCache>>,
    limits: Limits,
}

impl EsiClient {
    /// Client with its own admission controller and cooldown clock
    pub fn new(config: &EsiConfig) -> Result<Self> {
        Self::with_shared_state(
            config,
            Arc::new(PrioritySemaphore::new(config.max_concurrent_requests)),
            Arc::new(CooldownClock::new()),
        )
    }

    /// Client sharing admission and cooldown with other clients
    pub fn with_shared_state(
        config: &EsiConfig,
        semaphore: Arc<PrioritySemaphore>,
        cooldown: Arc<CooldownClock>,
    ) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            semaphore,
            cooldown,
            sso: None,
            limits: Limits {
                queue_timeout: config.queue_timeout(),
                overload_cooldown: config.overload_cooldown(),
                fallback_cooldown: config.fallback_cooldown(),
                max_cooldown_secs: config.max_cooldown_secs,
                max_pages: config.max_pages,
            },
        })
    }

    #[must_use]
    pub fn with_sso(mut self, sso: Arc<SsoTokenCache>) -> Self {
        self.sso = Some(sso);
        self
    }

    pub fn semaphore(&self) -> &Arc<PrioritySemaphore> {
        &self.semaphore
    }

    pub fn cooldown(&self) -> &Arc<CooldownClock> {
        &self.cooldown
    }

    /// Run `request`, retrying transient failures within its attempt budget
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        request: &EsiRequest,
        cancel: &CancellationToken,
    ) -> Result<EsiResponse<T>, FetchError> {
        if !request.path.starts_with('/') {
            return Err(FetchError::InvalidRequest(format!(
                "path {:?} must start with '/'",
                request.path
            )));
        }
        let mut last_error = None;

        for attempt in 1..=request.attempts {
            match self.attempt(request, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    warn!(
                        "🔄 {} {} failed (attempt {}/{}): {}",
                        request.method, request.path, attempt, request.attempts, e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(FetchError::NoAttemptsLeft))
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        request: &EsiRequest,
        cancel: &CancellationToken,
    ) -> Result<EsiResponse<T>, FetchError> {
        let ticket = match timeout(
            self.limits.queue_timeout,
            self.semaphore.acquire_cancellable(request.priority, cancel),
        )
        .await
        {
            Ok(Ok(ticket)) => ticket,
            Ok(Err(_)) => return Err(FetchError::Cancelled),
            Err(_) => return Err(FetchError::QueueTimeout { stage: "admission" }),
        };
        let slot = AdmissionSlot::new(&self.semaphore, ticket);

        match timeout(self.limits.queue_timeout, self.cooldown.wait(cancel)).await {
            Ok(true) => {}
            Ok(false) => return Err(FetchError::Cancelled),
            Err(_) => return Err(FetchError::QueueTimeout { stage: "cooldown" }),
        }

        let mut builder = self
            .http
            .request(request.method.clone(), format!("{}{}", self.base_url, request.path))
            .header(CONTENT_TYPE, "application/json");
        if request.authenticated {
            let sso = self
                .sso
                .as_ref()
                .ok_or_else(|| FetchError::Auth("no SSO credentials configured".to_string()))?;
            builder = builder.bearer_auth(sso.bearer(&self.http, cancel).await?);
        }

        debug!("🌐 {} {}", request.method, request.path);
        let sent = tokio::select! {
            sent = builder.send() => sent,
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        // decoding does not need an admission slot
        drop(slot);
        let response = sent.map_err(FetchError::Network)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = tokio::select! {
            body = response.bytes() => body.map_err(FetchError::Network)?,
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        self.classify(status, &headers, &body)
    }

    fn classify<T: DeserializeOwned>(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<EsiResponse<T>, FetchError> {
        match status.as_u16() {
            200 => {
                let data = serde_json::from_slice(body)
                    .map_err(|e| FetchError::Decode(format!("response body: {e}")))?;
                Ok(EsiResponse {
                    data,
                    pages: self.pages(headers),
                })
            }
            code @ (500 | 503) => {
                warn!("🧯 ESI answered {}, cooling down {:?}", code, self.limits.overload_cooldown);
                self.cooldown.declare(self.limits.overload_cooldown);
                Err(FetchError::ServerOverloaded { status: code })
            }
            420 => {
                let hint = headers
                    .get(ERROR_LIMIT_RESET_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok());
                let reset = self.cooldown_from_hint(hint, ERROR_LIMIT_RESET_HEADER);
                warn!("🚦 ESI error limit reached, cooling down {:?}", reset);
                self.cooldown.declare(reset);
                Err(FetchError::ErrorLimited { reset })
            }
            504 => {
                let parsed = serde_json::from_slice::<TimeoutBody>(body).ok();
                let hint = parsed.as_ref().map(|b| b.timeout);
                let wait = self.cooldown_from_hint(hint, "timeout body");
                warn!(
                    "⏱️ ESI upstream timeout ({}), cooling down {:?}",
                    parsed.as_ref().map_or("", |b| b.error.as_str()),
                    wait
                );
                self.cooldown.declare(wait);
                Err(FetchError::UpstreamTimeout { wait })
            }
            code => match serde_json::from_slice::<ErrorBody>(body) {
                Ok(error) => Err(FetchError::Remote {
                    code,
                    message: error.error,
                }),
                Err(e) => Err(FetchError::Decode(format!("error body of status {code}: {e}"))),
            },
        }
    }

    // Clamp a remote cooldown hint in seconds; absurd or missing hints use the fallback
    fn cooldown_from_hint(&self, hint: Option<i64>, source: &str) -> Duration {
        match hint {
            Some(secs) if (0..=self.limits.max_cooldown_secs as i64).contains(&secs) => {
                Duration::from_secs(secs as u64)
            }
            Some(secs) => {
                warn!("⚠️  {} out of range: {}s", source, secs);
                self.limits.fallback_cooldown
            }
            None => {
                warn!("⚠️  Can't decode {}", source);
                self.limits.fallback_cooldown
            }
        }
    }

    fn pages(&self, headers: &HeaderMap) -> Option<u32> {
        let raw = headers.get(PAGES_HEADER)?;
        match raw.to_str().ok().and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(pages) if (0..=i64::from(self.limits.max_pages)).contains(&pages) => Some(pages as u32),
            Some(pages) => {
                warn!("⚠️  {} out of range: {}", PAGES_HEADER, pages);
                None
            }
            None => {
                warn!("⚠️  Can't decode {}: {:?}", PAGES_HEADER, raw);
                None
            }
        }
    }
}

/// Admission slot held for the duration of one network call
struct AdmissionSlot<'a> {
    semaphore: &'a PrioritySemaphore,
    ticket: Option<Ticket>,
}

impl<'a> AdmissionSlot<'a> {
    const fn new(semaphore: &'a PrioritySemaphore, ticket: Ticket) -> Self {
        Self {
            semaphore,
            ticket: Some(ticket),
        }
    }
}

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.semaphore.release(ticket);
        }
    }
}
