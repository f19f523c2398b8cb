use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::reply::Reply;
use crate::transport::{Transport, get_param};

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

/// Blocking reqwest transport with a cookie jar, request spacing and
/// HTTP-level retry for transient read failures. Writes are sent once; the
/// session's `RetryPolicy` decides whether they are repeated.
pub struct HttpTransport {
    client: Client,
    api_url: Url,
    config: HttpTransportConfig,
    next_slot: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Post,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            api_url,
            config,
            next_slot: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn with_format(params: &[(String, String)]) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        pairs.extend(params.iter().cloned());
        pairs
    }

    fn retry_budget(&self, is_write: bool) -> usize {
        if is_write { 0 } else { self.config.max_retries }
    }

    fn send_with_retry<F>(&self, is_write: bool, build: F) -> ApiResult<Reply>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_retries = self.retry_budget(is_write);
        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = build()
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            warn!(%status, attempt, "retrying MediaWiki request");
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        return Err(ApiError::Http(status.as_u16()));
                    }
                    return decode_reply(response);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        warn!(error = %error, attempt, "retrying MediaWiki request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(ApiError::Transport(error.to_string()));
                }
            }
        }

        Err(ApiError::Transport(
            "MediaWiki API request exhausted retry budget".to_string(),
        ))
    }

    fn request(&self, method: Method, params: &[(String, String)]) -> ApiResult<Reply> {
        let pairs = Self::with_format(params);
        let is_write = is_write_request(method, params);
        debug!(
            action = get_param(params, "action").unwrap_or(""),
            write = is_write,
            "MediaWiki request"
        );
        self.send_with_retry(is_write, || match method {
            Method::Get => self.client.get(self.api_url.clone()).query(&pairs),
            Method::Post => self.client.post(self.api_url.clone()).form(&pairs),
        })
    }

    /// Reserve the next request slot and sleep until it opens. The lock is
    /// released before sleeping so concurrent callers queue behind each other.
    fn apply_rate_limit(&self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        let wait = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(slot + delay);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait);
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl Transport for HttpTransport {
    fn get(&self, params: &[(String, String)]) -> ApiResult<Reply> {
        self.request(Method::Get, params)
    }

    fn post(&self, params: &[(String, String)]) -> ApiResult<Reply> {
        self.request(Method::Post, params)
    }

    fn multipart_post(
        &self,
        params: &[(String, String)],
        filename: &str,
        bytes: Vec<u8>,
    ) -> ApiResult<Reply> {
        let pairs = Self::with_format(params);
        debug!(filename, bytes = bytes.len(), "MediaWiki multipart request");
        self.send_with_retry(true, || {
            let mut form = Form::new();
            for (key, value) in &pairs {
                form = form.text(key.clone(), value.clone());
            }
            let part = Part::bytes(bytes.clone()).file_name(filename.to_string());
            form = form.part("chunk", part);
            self.client.post(self.api_url.clone()).multipart(form)
        })
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// POSTed queries are reads; every other POST changes server state.
fn is_write_request(method: Method, params: &[(String, String)]) -> bool {
    matches!(method, Method::Post) && get_param(params, "action") != Some("query")
}

fn decode_reply(response: Response) -> ApiResult<Reply> {
    let payload: Value = response
        .json()
        .map_err(|error| ApiError::Decode(error.to_string()))?;
    Ok(Reply::new(payload))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: &str) -> HttpTransportConfig {
        HttpTransportConfig {
            api_url: api_url.to_string(),
            user_agent: "wikibatch-test".to_string(),
            timeout_ms: 1_000,
            rate_limit_read_ms: 0,
            rate_limit_write_ms: 0,
            max_retries: 0,
            retry_delay_ms: 0,
        }
    }

    #[test]
    fn rejects_invalid_api_url() {
        let error = HttpTransport::new(config("not a url")).err().expect("must fail");
        assert!(error.to_string().contains("invalid WIKI_API_URL"));
    }

    #[test]
    fn format_params_are_prepended_and_empty_values_kept() {
        let pairs = HttpTransport::with_format(&[
            ("action".to_string(), "query".to_string()),
            ("titles".to_string(), String::new()),
        ]);
        assert_eq!(pairs[0], ("format".to_string(), "json".to_string()));
        assert_eq!(pairs[1], ("formatversion".to_string(), "2".to_string()));
        assert_eq!(pairs[3], ("titles".to_string(), String::new()));
        assert_eq!(pairs.len(), 4);
    }

    #[test]
    fn retryable_statuses_match_transient_failures() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn writes_are_sent_once_and_reads_retried() {
        let transport = HttpTransport::new(HttpTransportConfig {
            max_retries: 2,
            ..config("https://wiki.example.org/w/api.php")
        })
        .expect("transport");
        assert_eq!(transport.retry_budget(false), 2);
        assert_eq!(transport.retry_budget(true), 0);

        let edit = [("action".to_string(), "edit".to_string())];
        let query = [("action".to_string(), "query".to_string())];
        assert!(is_write_request(Method::Post, &edit));
        assert!(!is_write_request(Method::Post, &query));
        assert!(!is_write_request(Method::Get, &query));
    }

    #[test]
    fn failed_write_reaches_the_server_once() {
        let transport = HttpTransport::new(HttpTransportConfig {
            max_retries: 2,
            timeout_ms: 200,
            ..config("http://127.0.0.1:9/w/api.php")
        })
        .expect("transport");
        let edit = [("action".to_string(), "edit".to_string())];
        assert!(transport.post(&edit).is_err());
        assert_eq!(transport.request_count(), 1);

        let query = [("action".to_string(), "query".to_string())];
        assert!(transport.get(&query).is_err());
        assert_eq!(transport.request_count(), 4);
    }

    #[test]
    fn rate_limit_counts_requests() {
        let transport = HttpTransport::new(config("https://wiki.example.org/w/api.php"))
            .expect("transport");
        transport.apply_rate_limit(false);
        transport.apply_rate_limit(true);
        assert_eq!(transport.request_count(), 2);
    }
}
