//! Request pipeline
//!
//! This module handles every fetch-kind task, including:
//! - Building HTTP clients (one per resolved proxy)
//! - Running the proxy/user-agent/headers/auth resolvers in parallel
//! - Merging headers by precedence into a per-attempt request config
//! - The optional pre-request hook
//! - Timeout and cancellation enforcement per attempt
//! - Bounded retry of failed attempts

use crate::crawler::resolver::{Auth, ResolveRequest, Resolved, Resolvers};
use crate::crawler::retry::{guarded, RetryPolicy};
use crate::crawler::task::{merge_headers, set_header, Headers, RequestTask, REFERER};
use crate::HarvestError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Fully resolved shape of one request attempt
///
/// Built fresh for every attempt and handed to the pre-request hook, which may
/// rewrite any field before the network call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    pub headers: Headers,
    pub proxy: Option<String>,
    pub auth: Option<Auth>,
    pub timeout: Duration,
}

/// Hook invoked with the mutable request config right before each attempt
pub type PreRequestHook = Arc<dyn Fn(&mut RequestConfig) + Send + Sync>;

/// A completed fetch
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Final URL after redirects
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,

    /// Wall-clock time of the successful attempt
    pub elapsed: Duration,

    /// The config the successful attempt was sent with
    pub request: RequestConfig,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Builds an HTTP client with crawler defaults
///
/// Timeouts are enforced per attempt by the pipelines, not by the client.
pub fn build_http_client(user_agent: Option<&str>, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true);

    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent);
    }

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    builder.build()
}

/// Shares one client per proxy across all attempts
///
/// reqwest binds proxies to clients, so a resolver handing out a new proxy
/// gets its client built once and reused afterwards.
pub struct ClientPool {
    user_agent: Option<String>,
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl ClientPool {
    pub fn new(user_agent: Option<String>) -> Result<Self, HarvestError> {
        let direct = build_http_client(user_agent.as_deref(), None)?;
        Ok(Self {
            user_agent,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_for(&self, proxy: Option<&str>) -> Result<Client, HarvestError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut proxied = self
            .proxied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = proxied.get(proxy) {
            return Ok(client.clone());
        }

        tracing::debug!("Building client for proxy {}", proxy);
        let client = build_http_client(self.user_agent.as_deref(), Some(proxy))?;
        proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

/// Converts a header map into reqwest headers
pub(crate) fn to_header_map(headers: &Headers) -> Result<HeaderMap, HarvestError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| HarvestError::InvalidHeader {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| HarvestError::InvalidHeader {
            name: name.clone(),
            message: e.to_string(),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Executes request tasks
pub struct RequestPipeline {
    clients: Arc<ClientPool>,
    resolvers: Resolvers,
    default_headers: Headers,
    timeout: Duration,
    retry: RetryPolicy,
    pre_request: Option<PreRequestHook>,
    token: CancellationToken,
}

impl RequestPipeline {
    pub fn new(
        clients: Arc<ClientPool>,
        resolvers: Resolvers,
        default_headers: Headers,
        timeout: Duration,
        retry: RetryPolicy,
        pre_request: Option<PreRequestHook>,
        token: CancellationToken,
    ) -> Self {
        Self {
            clients,
            resolvers,
            default_headers,
            timeout,
            retry,
            pre_request,
            token,
        }
    }

    /// Fetches `task`, retrying failed attempts
    ///
    /// # Returns
    ///
    /// * `Ok(FetchedResponse)` - A response was received and read
    /// * `Err(HarvestError::Exhausted)` - Every attempt failed
    /// * `Err(HarvestError::Cancelled)` - The run was cancelled
    pub async fn execute(&self, task: &RequestTask) -> Result<FetchedResponse, HarvestError> {
        self.retry
            .run(&self.token, &task.url, |attempt| self.attempt(task, attempt))
            .await
    }

    async fn attempt(&self, task: &RequestTask, attempt: u32) -> Result<FetchedResponse, HarvestError> {
        let resolve_request = ResolveRequest {
            url: task.url.clone(),
            method: task.method.clone(),
            body: task.body.clone(),
        };

        let resolved = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                return Err(HarvestError::Cancelled { url: task.url.clone() });
            }
            resolved = self.resolvers.resolve_all(&resolve_request) => resolved?,
        };

        let mut config = self.build_config(task, resolved);
        if let Some(hook) = &self.pre_request {
            hook(&mut config);
        }

        tracing::debug!(
            "Attempt {} {} {} (proxy: {})",
            attempt,
            config.method,
            config.url,
            config.proxy.as_deref().unwrap_or("none")
        );

        let client = self.clients.client_for(config.proxy.as_deref())?;
        let timeout = config.timeout;
        let url = config.url.clone();
        guarded(&self.token, timeout, &url, send(client, config)).await
    }

    /// Merges headers by precedence and applies resolved values
    ///
    /// Precedence, lowest first: default Referer header, static default
    /// headers, caller headers, resolver headers, resolved user agent.
    fn build_config(&self, task: &RequestTask, resolved: Resolved) -> RequestConfig {
        let mut headers = Headers::new();
        if let Some(referer) = &task.referer {
            set_header(&mut headers, REFERER, referer.clone());
        }
        merge_headers(&mut headers, &self.default_headers);
        merge_headers(&mut headers, &task.headers);
        if let Some(resolved_headers) = &resolved.headers {
            merge_headers(&mut headers, resolved_headers);
        }
        if let Some(user_agent) = resolved.user_agent {
            set_header(&mut headers, USER_AGENT.as_str(), user_agent);
        }

        RequestConfig {
            method: task.method.clone(),
            url: task.url.clone(),
            body: task.body.clone(),
            headers,
            proxy: resolved.proxy,
            auth: resolved.auth,
            timeout: self.timeout,
        }
    }
}

/// Sends one request and reads the full body
async fn send(client: Client, config: RequestConfig) -> Result<FetchedResponse, HarvestError> {
    let mut request = client
        .request(config.method.clone(), &config.url)
        .headers(to_header_map(&config.headers)?);
    if let Some(body) = &config.body {
        request = request.body(body.clone());
    }
    if let Some(auth) = &config.auth {
        request = request.basic_auth(&auth.username, auth.password.as_ref());
    }

    let started = Instant::now();
    let response = request.send().await.map_err(|source| HarvestError::Http {
        url: config.url.clone(),
        source,
    })?;

    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(HarvestError::Status {
            url: config.url.clone(),
            status: status.as_u16(),
        });
    }

    let url = response.url().to_string();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|source| HarvestError::Http {
        url: config.url.clone(),
        source,
    })?;

    Ok(FetchedResponse {
        url,
        status,
        headers,
        body: body.to_vec(),
        elapsed: started.elapsed(),
        request: config,
    })
}
