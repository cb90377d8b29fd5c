use crate::app::ports::{DownloadStatus, HttpClientPort, HttpGetResult, HttpRequest};
use crate::config::HttpConfig;
use crate::error::{FetchError, PipelineError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn transport(url: &str, source: reqwest::Error) -> FetchError {
    FetchError::Transport {
        url: url.to_string(),
        source,
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn get(&self, request: &HttpRequest) -> std::result::Result<HttpGetResult, FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept.as_str());
        }
        let resp = builder.send().await.map_err(|e| transport(&request.url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| transport(&request.url, e))?
            .to_vec();
        debug!(url = %request.url, bytes = bytes.len(), "GET complete");
        Ok(HttpGetResult {
            status: status.as_u16(),
            bytes,
            content_type,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<DownloadStatus, FetchError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(DownloadStatus::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await.map_err(|e| transport(url, e))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;

        debug!(url, bytes = written, dest = %dest.display(), "download complete");
        Ok(DownloadStatus::Complete { bytes: written })
    }
}
