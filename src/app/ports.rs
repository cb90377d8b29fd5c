use crate::error::FetchError;
use async_trait::async_trait;
use std::path::Path;

/// A GET request against an upstream source.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub accept: Option<String>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn accept(mut self, mime: &str) -> Self {
        self.accept = Some(mime.to_string());
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct HttpGetResult {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl HttpGetResult {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Complete { bytes: u64 },
    /// Upstream has no file for this selector; a normal outcome
    NotFound,
}

// Ingest-side ports
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    /// Fetch a whole response body. Non-2xx statuses are `FetchError::Status`.
    async fn get(&self, request: &HttpRequest) -> Result<HttpGetResult, FetchError>;

    /// Stream a response body to `dest`. Bytes land in `dest` with a `.part`
    /// suffix while in flight and are renamed once complete.
    async fn download(&self, url: &str, dest: &Path) -> Result<DownloadStatus, FetchError>;
}
