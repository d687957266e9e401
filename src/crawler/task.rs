//! Units of scheduled work
//!
//! A [`Task`] is either a fetch-and-extract request or a download-to-file
//! transfer. Tasks carry no dedupe key; pushing the same URL twice yields two
//! independent executions.

use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Header map keyed by header name
///
/// Names are matched case-insensitively by the helpers below, so merging never
/// leaves two spellings of the same header behind.
pub type Headers = BTreeMap<String, String>;

/// Reference header defaulted on followed requests
pub const REFERER: &str = "Referer";

/// Sets `name` to `value`, replacing any existing entry regardless of case
pub fn set_header(headers: &mut Headers, name: &str, value: impl Into<String>) {
    remove_header(headers, name);
    headers.insert(name.to_string(), value.into());
}

/// Removes every entry named `name` (case-insensitive)
pub fn remove_header(headers: &mut Headers, name: &str) {
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
}

/// Looks up a header value (case-insensitive)
pub fn get_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Layers `overlay` on top of `base`; overlay entries win
pub fn merge_headers(base: &mut Headers, overlay: &Headers) {
    for (name, value) in overlay {
        set_header(base, name, value.clone());
    }
}

/// One unit of scheduled work
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Fetch a URL and hand the response to the extraction callback
    Request(RequestTask),

    /// Stream a remote resource into a local file
    Download(DownloadTask),
}

impl Task {
    pub fn url(&self) -> &str {
        match self {
            Task::Request(request) => &request.url,
            Task::Download(download) => &download.url,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Request(request) => write!(f, "{} {}", request.method, request.url),
            Task::Download(download) => {
                write!(f, "download {} -> {}", download.url, download.filepath.display())
            }
        }
    }
}

impl From<RequestTask> for Task {
    fn from(request: RequestTask) -> Self {
        Task::Request(request)
    }
}

impl From<DownloadTask> for Task {
    fn from(download: DownloadTask) -> Self {
        Task::Download(download)
    }
}

/// Shape of a request to fetch
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTask {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,

    /// Caller-supplied headers
    pub headers: Headers,

    /// Default Reference header, overridden by any other header source
    pub referer: Option<String>,
}

impl RequestTask {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Headers::new(),
            referer: None,
        }
    }

    /// A bodiless GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }
}

impl From<&str> for RequestTask {
    fn from(url: &str) -> Self {
        RequestTask::get(url)
    }
}

impl From<String> for RequestTask {
    fn from(url: String) -> Self {
        RequestTask::get(url)
    }
}

impl From<&String> for RequestTask {
    fn from(url: &String) -> Self {
        RequestTask::get(url.as_str())
    }
}

impl From<url::Url> for RequestTask {
    fn from(url: url::Url) -> Self {
        RequestTask::get(String::from(url))
    }
}

/// Per-download transport options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOptions {
    pub headers: Headers,
    pub proxy: Option<String>,
}

impl DownloadOptions {
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// A remote resource to stream into `filepath`
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub url: String,
    pub filepath: PathBuf,
    pub options: DownloadOptions,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, filepath: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            filepath: filepath.into(),
            options: DownloadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }
}
