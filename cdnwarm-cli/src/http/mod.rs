//! HTTP client used to warm and load-test the CDN.

pub mod retry;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{HttpMethod, HttpSettings};
use crate::error::{AppError, Result};
use retry::{RetryAction, RetryError, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};

/// Result of one logical request, including any retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    /// Final HTTP status, absent when no response was received.
    pub status: Option<u16>,
    pub bytes: u64,
    /// Time to response headers for the last attempt.
    pub ttfb_ms: f64,
    /// Wall time of the last attempt including the body.
    pub total_ms: f64,
    pub cache_status: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl FetchResult {
    fn failed(url: &str, error: String, attempts: u32, elapsed: Duration) -> Self {
        Self {
            url: url.to_string(),
            status: None,
            bytes: 0,
            ttfb_ms: 0.0,
            total_ms: millis(elapsed),
            cache_status: None,
            attempts,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..400).contains(&s))
    }
}

/// Why a single attempt did not succeed.
#[derive(Debug)]
enum AttemptError {
    /// A response arrived but its status is an error.
    Status(FetchResult),
    Transport { message: String, elapsed: Duration },
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(r) => write!(f, "HTTP {}", r.status.unwrap_or_default()),
            Self::Transport { message, .. } => f.write_str(message),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Read the cache verdict from the usual CDN headers.
pub fn cache_status(headers: &HeaderMap) -> Option<String> {
    for name in ["cf-cache-status", "x-cache", "x-cache-status"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(value.trim().to_string());
        }
    }
    let age = headers
        .get("age")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())?;
    Some(if age > 0 { "HIT".to_string() } else { "MISS".to_string() })
}

/// A configured `reqwest::Client` plus retry policy.
#[derive(Debug, Clone)]
pub struct WarmClient {
    client: reqwest::Client,
    method: HttpMethod,
    policy: RetryPolicy,
}

impl WarmClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AppError::config(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::config(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .pool_max_idle_per_host(64);
        if settings.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(settings.timeout_secs));
        }
        if settings.connect_timeout_secs > 0 {
            builder = builder.connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
        }
        let client = builder
            .build()
            .map_err(|e| AppError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            method: settings.method,
            policy: RetryPolicy::from_settings(settings),
        })
    }

    /// Same client, different retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Request `url`, retrying transient failures. Never returns an error:
    /// failures are described in the returned [`FetchResult`].
    pub async fn fetch(&self, url: &str, token: &CancellationToken) -> FetchResult {
        let started = Instant::now();
        let result = retry_with_backoff(&self.policy, token, |_| self.attempt(url)).await;

        match result {
            Ok((mut fetched, attempts)) => {
                fetched.attempts = attempts;
                fetched
            }
            Err(RetryError::Cancelled) => {
                FetchResult::failed(url, "cancelled".to_string(), 0, started.elapsed())
            }
            Err(RetryError::Failed { attempts, error }) => match error {
                AttemptError::Status(mut fetched) => {
                    fetched.error = Some(format!("HTTP {}", fetched.status.unwrap_or_default()));
                    fetched.attempts = attempts;
                    fetched
                }
                AttemptError::Transport { message, elapsed } => {
                    FetchResult::failed(url, message, attempts, elapsed)
                }
            },
        }
    }

    async fn attempt(&self, url: &str) -> RetryAction<FetchResult, AttemptError> {
        let started = Instant::now();
        let response = match self.client.request(self.method.as_reqwest(), url).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = AttemptError::Transport {
                    message: e.to_string(),
                    elapsed: started.elapsed(),
                };
                return if is_retryable_reqwest_error(&e) {
                    RetryAction::Retry(error)
                } else {
                    RetryAction::Fail(error)
                };
            }
        };

        let ttfb = started.elapsed();
        let status = response.status();
        let cache = cache_status(response.headers());

        // Drain the body in chunks so large objects are not buffered.
        let mut response = response;
        let mut bytes = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => bytes += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    return RetryAction::Retry(AttemptError::Transport {
                        message: format!("reading body: {e}"),
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        let fetched = FetchResult {
            url: url.to_string(),
            status: Some(status.as_u16()),
            bytes,
            ttfb_ms: millis(ttfb),
            total_ms: millis(started.elapsed()),
            cache_status: cache,
            attempts: 1,
            error: None,
        };

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            RetryAction::Retry(AttemptError::Status(fetched))
        } else if status.is_client_error() {
            RetryAction::Fail(AttemptError::Status(fetched))
        } else {
            RetryAction::Success(fetched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn test_cache_status_precedence() {
        assert_eq!(
            cache_status(&headers(&[("cf-cache-status", "HIT"), ("x-cache", "MISS")])).as_deref(),
            Some("HIT")
        );
        assert_eq!(
            cache_status(&headers(&[("x-cache", "Miss from cloudfront")])).as_deref(),
            Some("Miss from cloudfront")
        );
        assert_eq!(cache_status(&headers(&[("age", "12")])).as_deref(), Some("HIT"));
        assert_eq!(cache_status(&headers(&[("age", "0")])).as_deref(), Some("MISS"));
        assert_eq!(cache_status(&headers(&[])), None);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut settings = HttpSettings::default();
        settings.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(WarmClient::new(&settings), Err(AppError::Config(_))));
    }

    #[test]
    fn test_success_range() {
        let mut r = FetchResult::failed("u", "x".into(), 1, Duration::ZERO);
        assert!(!r.is_success());
        r.error = None;
        r.status = Some(304);
        assert!(r.is_success());
        r.status = Some(404);
        assert!(!r.is_success());
    }
}
