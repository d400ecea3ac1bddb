//! Request pipeline shared by every endpoint.
//!
//! A request goes through the cache, the throttler, then the HTTP call with
//! the next rotated key. Transport failures are retried, an IP-bound key
//! rejection triggers one key refresh, and fresh payloads are cached for as
//! long as the server allows.

use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::{Client, Method, header::HeaderMap};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Duration;

use crate::rest::{
    cache::CacheStore,
    error::{ApiErrorBody, ErrorKind, GATEWAY_TIMEOUT, RequestError},
    keys::KeyManager,
    throttler::Throttler,
};

/// Decoded payload of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub data: T,
    pub status: u16,
    /// `true` only for HTTP 200
    pub ok: bool,
    pub path: String,
    /// Freshness granted by the server, or the time left for a cached payload
    pub max_age: Duration,
}

/// What the cache holds for a path.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub body: Value,
    pub status: u16,
}

/// Per-call knobs of [`RequestExecutor::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Skip the cache lookup, the result is still cached
    pub force: bool,
    /// `Some(false)` disables caching for this call
    pub cache: Option<bool>,
    /// Skip the throttler
    pub ignore_rate_limit: bool,
    /// Overrides the executor retry limit
    pub retry_limit: Option<u32>,
    /// Overrides the executor request timeout
    pub timeout: Option<Duration>,
    pub method: Method,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            force: false,
            cache: None,
            ignore_rate_limit: false,
            retry_limit: None,
            timeout: None,
            method: Method::GET,
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn forced() -> Self {
        RequestOptions {
            force: true,
            ..Default::default()
        }
    }
}

/// Raw answer of one HTTP attempt.
struct RawResponse {
    status: u16,
    max_age: Duration,
    body: String,
}

/// Executes requests against the REST API.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::rest::{KeyManager, RequestExecutor, RequestOptions, BatchThrottler};
/// use std::{sync::Arc, time::Duration};
///
/// # async fn example() {
/// let keys = Arc::new(KeyManager::new("https://api.clashofclans.com/v1", vec!["key".to_string()]));
/// let executor = RequestExecutor::new("https://api.clashofclans.com/v1", keys)
///     .with_throttler(Arc::new(BatchThrottler::new(10, Duration::from_secs(1))))
///     .with_cache(Duration::from_secs(300));
///
/// let clan: serde_json::Value = executor
///     .request("/clans/%232PP", &RequestOptions::default())
///     .await
///     .unwrap()
///     .data;
/// # }
/// ```
pub struct RequestExecutor {
    /// REST API base url, without trailing slash
    base_url: String,
    /// HTTP client
    client: Client,
    /// Key ring used to authorize requests
    keys: Arc<KeyManager>,
    /// Optional pacing, no throttling when absent
    throttler: Option<Arc<dyn Throttler>>,
    /// Optional response cache, no caching when absent
    cache: Option<CacheStore<CachedResponse>>,
    /// Default number of retries after a transport failure
    retry_limit: u32,
    /// Default per-request timeout, none when absent
    timeout: Option<Duration>,
}

impl RequestExecutor {
    /// Create a new [RequestExecutor] without throttling, caching or retries.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base url of the REST API.
    /// * `keys` - Key ring shared with whoever provisions keys.
    pub fn new(base_url: &str, keys: Arc<KeyManager>) -> Self {
        RequestExecutor {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: Client::new(),
            keys,
            throttler: None,
            cache: None,
            retry_limit: 0,
            timeout: None,
        }
    }

    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Enables response caching, expired entries are swept every `sweep_interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_cache(mut self, sweep_interval: Duration) -> Self {
        let mut cache = CacheStore::new();
        cache.start_sweep_task(sweep_interval);
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the default per-request timeout, a zero duration means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Drops every cached payload.
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }

    /// Requests `path` and decodes the payload into `T`.
    ///
    /// # Arguments
    ///
    /// * `path` - Path relative to the base url, tags already encoded, query included.
    /// * `options` - Per-call options, see [`RequestOptions`].
    ///
    /// # Errors
    ///
    /// Every non-200 outcome is a [`RequestError`] carrying the status, the
    /// path and the server freshness hint.
    pub async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Response<T>, RequestError> {
        let method = options.method.clone();
        let cache = self
            .cache
            .as_ref()
            .filter(|_| method == Method::GET && options.cache != Some(false));

        if let Some(cache) = cache.filter(|_| !options.force) {
            if let Some(entry) = cache.get(path).await {
                debug!("cache hit for {}", path);
                let max_age = entry.remaining().unwrap_or(Duration::ZERO);
                return decode(entry.value.body, entry.value.status, &method, path, max_age);
            }
        }

        if !options.ignore_rate_limit {
            if let Some(throttler) = &self.throttler {
                throttler.wait().await;
            }
        }

        let retry_limit = options.retry_limit.unwrap_or(self.retry_limit);
        let timeout = options.timeout.or(self.timeout);
        let mut retries = 0;
        let mut refreshed = false;

        loop {
            let error = match self.send(path, &method, options.body.as_ref(), timeout).await {
                Ok(raw) => match classify(raw, &method, path) {
                    Ok((body, max_age)) => {
                        let response = decode::<T>(body.clone(), 200, &method, path, max_age)?;
                        if let Some(cache) = cache.filter(|_| !max_age.is_zero()) {
                            let value = CachedResponse { body, status: 200 };
                            cache.set(path, value, max_age).await;
                        }
                        return Ok(response);
                    }
                    Err(error) => error,
                },
                Err(error) => error,
            };

            if error.kind.is_transport() && retries < retry_limit {
                retries += 1;
                warn!(
                    "{} {} failed ({}), retry {}/{}",
                    method, path, error.kind, retries, retry_limit
                );
                continue;
            }

            if error.kind == ErrorKind::AuthInvalid && !refreshed && self.keys.can_provision() {
                refreshed = true;
                if self.refresh_keys().await {
                    // The replay is allowed even when the retry budget is spent
                    retries += 1;
                    continue;
                }
            }

            return Err(error);
        }
    }

    /// Refreshes the key ring, returns whether a key is available afterwards.
    async fn refresh_keys(&self) -> bool {
        info!("API key rejected, refreshing keys");
        match self.keys.refresh().await {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("could not refresh keys: {}", e);
                !self.keys.is_empty()
            }
        }
    }

    /// One HTTP attempt with the next rotated key.
    async fn send(
        &self,
        path: &str,
        method: &Method,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<RawResponse, RequestError> {
        let Some(key) = self.keys.current() else {
            return Err(
                RequestError::new(ErrorKind::AuthInvalid, 403, method.as_str(), path)
                    .with_message("no API keys available"),
            );
        };

        let url = format!("{}{}", self.base_url, path);
        debug!("request {} {}", method, url);

        let mut request = self.client.request(method.clone(), &url).bearer_auth(key);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, method, path))?;
        let status = response.status().as_u16();
        let max_age = max_age(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&e, method, path))?;

        debug!("response from {} {} -> {}", method, url, status);
        Ok(RawResponse {
            status,
            max_age,
            body,
        })
    }
}

/// Turns a raw answer into its JSON body, or the matching [`RequestError`].
fn classify(
    raw: RawResponse,
    method: &Method,
    path: &str,
) -> Result<(Value, Duration), RequestError> {
    if raw.status == 200 {
        return serde_json::from_str(&raw.body)
            .map(|body| (body, raw.max_age))
            .map_err(|e| {
                RequestError::new(ErrorKind::Deserialize, 200, method.as_str(), path)
                    .with_message(e.to_string())
                    .with_max_age(raw.max_age)
            });
    }

    let body = ApiErrorBody::parse(&raw.body);
    let kind = match (raw.status, &body) {
        (403, Some(body)) if body.is_invalid_ip() => ErrorKind::AuthInvalid,
        (403, None) => ErrorKind::PrivateResource,
        (404, _) => ErrorKind::NotFound,
        _ => ErrorKind::Http,
    };

    let mut error = RequestError::new(kind, raw.status, method.as_str(), path)
        .with_max_age(raw.max_age);
    if let Some(body) = body {
        if let Some(message) = body.message {
            error = error.with_message(message);
        }
        error = error.with_reason(body.reason);
    }
    Err(error)
}

fn decode<T: DeserializeOwned>(
    body: Value,
    status: u16,
    method: &Method,
    path: &str,
    max_age: Duration,
) -> Result<Response<T>, RequestError> {
    let data = serde_json::from_value(body).map_err(|e| {
        RequestError::new(ErrorKind::Deserialize, status, method.as_str(), path)
            .with_message(e.to_string())
            .with_max_age(max_age)
    })?;

    Ok(Response {
        data,
        status,
        ok: status == 200,
        path: path.to_owned(),
        max_age,
    })
}

fn transport_error(error: &reqwest::Error, method: &Method, path: &str) -> RequestError {
    let kind = if error.is_timeout() {
        ErrorKind::NetworkTimeout
    } else {
        ErrorKind::TransportFailure
    };
    RequestError::new(kind, GATEWAY_TIMEOUT, method.as_str(), path).with_message(error.to_string())
}

/// Reads `max-age` from the `cache-control` header, zero when absent.
fn max_age(headers: &HeaderMap) -> Duration {
    headers
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .split([',', ' '])
                .find_map(|directive| directive.trim().strip_prefix("max-age="))
                .and_then(|seconds| seconds.parse::<u64>().ok())
        })
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}
