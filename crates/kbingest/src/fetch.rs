//! Fetching item source bytes.
//!
//! `http(s)://` sources are downloaded, `file://` URLs and bare paths are read
//! from the local filesystem (used for staged uploads).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::FetchError;
use crate::sanitize;

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_USER_AGENT: &str = concat!("kbingest/", env!("CARGO_PKG_VERSION"));

/// Bytes of one source plus what we know about them.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    /// Last path segment of the source, used for validation and key naming.
    pub filename: String,
    pub content_type: Option<String>,
}

impl FetchedFile {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source_url: &str) -> Result<FetchedFile, FetchError>;
}

/// Dispatches on the source scheme.
pub struct DefaultFetcher {
    client: Client,
}

impl DefaultFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str) -> Result<FetchedFile, FetchError> {
        log::debug!("Downloading {}", sanitize::redact_url(url));
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: sanitize::redact_url(url),
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedFile {
            bytes,
            filename: filename_from_url(url),
            content_type,
        })
    }

    async fn read_local(&self, path: &Path) -> Result<FetchedFile, FetchError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| FetchError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
        let filename = sanitize::redact_path(path);
        let content_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string());
        Ok(FetchedFile {
            bytes,
            filename,
            content_type,
        })
    }
}

#[async_trait]
impl SourceFetcher for DefaultFetcher {
    async fn fetch(&self, source_url: &str) -> Result<FetchedFile, FetchError> {
        if source_url.starts_with("http://") || source_url.starts_with("https://") {
            self.download(source_url).await
        } else if let Some(path) = source_url.strip_prefix("file://") {
            self.read_local(&PathBuf::from(path)).await
        } else if source_url.starts_with('/') {
            self.read_local(Path::new(source_url)).await
        } else {
            let scheme = source_url
                .split_once("://")
                .map(|(s, _)| s)
                .unwrap_or(source_url);
            Err(FetchError::UnsupportedScheme(scheme.to_string()))
        }
    }
}

/// Last non-empty path segment of a URL, without query string.
pub fn filename_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
        .unwrap_or(without_query);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}
