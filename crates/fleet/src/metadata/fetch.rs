//! Fetching metadata indexes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::ProvisionError;
use crate::storage::{Storage, StorageError};

/// Default timeout for index requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retrieves raw index documents.
#[async_trait]
pub trait IndexFetcher: Send + Sync {
    /// Fetch the document at `url`; `Ok(None)` when there is none.
    async fn fetch(&self, url: &Url) -> Result<Option<Vec<u8>>, ProvisionError>;
}

/// Fetches over HTTP(S), and from `file://` URLs on the local disk.
#[derive(Clone)]
pub struct HttpIndexFetcher {
    client: Client,
}

impl HttpIndexFetcher {
    /// Create a fetcher with the default request timeout.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new() -> Result<Self, ProvisionError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a fetcher with a custom request timeout.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ProvisionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn fetch_http(&self, url: &Url) -> Result<Option<Vec<u8>>, ProvisionError> {
        debug!(url = %url, "GET request");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(Some(response.bytes().await?.to_vec()));
        }

        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                ProvisionError::AuthorizationFailed(format!("{url}: {status} {text}")),
            ),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => Err(
                ProvisionError::BackendUnavailable(format!("{url}: {status} {text}")),
            ),
            _ => Err(ProvisionError::Metadata {
                url: url.to_string(),
                message: format!("{status} {text}"),
            }),
        }
    }
}

#[async_trait]
impl IndexFetcher for HttpIndexFetcher {
    async fn fetch(&self, url: &Url) -> Result<Option<Vec<u8>>, ProvisionError> {
        match url.scheme() {
            "http" | "https" => self.fetch_http(url).await,
            "file" => {
                let path = url.to_file_path().map_err(|()| {
                    ProvisionError::Config(format!("{url} is not a local path"))
                })?;
                match tokio::fs::read(&path).await {
                    Ok(data) => Ok(Some(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(ProvisionError::Metadata {
                        url: url.to_string(),
                        message: e.to_string(),
                    }),
                }
            }
            scheme => Err(ProvisionError::Config(format!(
                "unsupported metadata URL scheme {scheme:?} in {url}"
            ))),
        }
    }
}

/// Serves URLs under an environment storage's base URL from that storage
/// and hands everything else to another fetcher.
#[derive(Clone)]
pub struct StorageIndexFetcher {
    storage: Arc<dyn Storage>,
    fallback: Arc<dyn IndexFetcher>,
}

impl StorageIndexFetcher {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, fallback: Arc<dyn IndexFetcher>) -> Self {
        Self { storage, fallback }
    }
}

#[async_trait]
impl IndexFetcher for StorageIndexFetcher {
    async fn fetch(&self, url: &Url) -> Result<Option<Vec<u8>>, ProvisionError> {
        let base = self.storage.url("");
        let Some(name) = url.as_str().strip_prefix(&base) else {
            return self.fallback.fetch(url).await;
        };
        match self.storage.get(name).await {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serves documents from a fixed map; unknown URLs have no document.
#[derive(Debug, Clone, Default)]
pub struct StaticIndexFetcher {
    documents: HashMap<String, Vec<u8>>,
}

impl StaticIndexFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document.
    #[must_use]
    pub fn with_document(mut self, url: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.documents.insert(url.into(), data.into());
        self
    }
}

#[async_trait]
impl IndexFetcher for StaticIndexFetcher {
    async fn fetch(&self, url: &Url) -> Result<Option<Vec<u8>>, ProvisionError> {
        Ok(self.documents.get(url.as_str()).cloned())
    }
}
