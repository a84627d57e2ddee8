//! Image and agent tools metadata.
//!
//! Metadata is published as JSON indexes under one or more base URLs.
//! An environment consults its own control bucket before the public
//! default, and the first source that offers a match for the requested
//! target wins. Results from different sources are never merged, which
//! lets an environment override the public catalog.

mod fetch;
mod index;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

pub use fetch::{HttpIndexFetcher, IndexFetcher, StaticIndexFetcher, StorageIndexFetcher};
pub use index::{ImageSpec, LookupParams, MetadataIndex, MetadataRecord, ToolsSpec};

use crate::config::EnvironConfig;
use crate::error::ProvisionError;

/// Public image metadata location.
pub const DEFAULT_IMAGE_BASE_URL: &str = "https://cloud-images.ubuntu.com/releases";

/// Image index path relative to a source's base URL.
pub const IMAGE_INDEX_PATH: &str = "streams/v1/images.json";

/// Tools index path relative to a source's base URL.
pub const TOOLS_INDEX_PATH: &str = "streams/v1/tools.json";

/// Priority of the environment's control bucket source.
pub const CONTROL_BUCKET_PRIORITY: u32 = 10;

/// Priority of the public default source.
pub const PUBLIC_PRIORITY: u32 = 100;

/// A ranked location serving metadata indexes. Lower priority values are
/// consulted first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataSource {
    pub description: String,
    pub base_url: Url,
    pub priority: u32,
}

impl MetadataSource {
    /// Create a source, normalising the base URL to end in `/`.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] if `base_url` is not a valid
    /// absolute URL.
    pub fn new(
        description: impl Into<String>,
        base_url: &str,
        priority: u32,
    ) -> Result<Self, ProvisionError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ProvisionError::Config(format!("bad metadata URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProvisionError::Config(format!(
                "metadata URL {base_url} cannot be a base"
            )));
        }
        Ok(Self {
            description: description.into(),
            base_url,
            priority,
        })
    }

    /// Absolute URL of `path` under this source.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] if `path` cannot be joined.
    pub fn url(&self, path: &str) -> Result<Url, ProvisionError> {
        self.base_url
            .join(path)
            .map_err(|e| ProvisionError::Config(format!("bad metadata path {path:?}: {e}")))
    }
}

/// Image metadata sources for an environment, in lookup order.
///
/// The control bucket comes first. A control bucket URL that does not
/// parse is dropped without error.
#[must_use]
pub fn image_sources(env: &EnvironConfig) -> Vec<MetadataSource> {
    let mut sources = Vec::with_capacity(2);
    match MetadataSource::new(
        "environment control bucket",
        &env.control_bucket_url,
        CONTROL_BUCKET_PRIORITY,
    ) {
        Ok(source) => sources.push(source),
        Err(e) => debug!(error = %e, "Skipping control bucket image source"),
    }

    let public = env
        .image_metadata_url
        .as_deref()
        .unwrap_or(DEFAULT_IMAGE_BASE_URL);
    match MetadataSource::new("public image metadata", public, PUBLIC_PRIORITY) {
        Ok(source) => sources.push(source),
        Err(e) => warn!(error = %e, "Skipping public image source"),
    }

    sources.sort_by_key(|s| s.priority);
    sources
}

/// Tools metadata sources for an environment: the control bucket's
/// `tools/` directory.
#[must_use]
pub fn tools_sources(env: &EnvironConfig) -> Vec<MetadataSource> {
    let mut base = env.control_bucket_url.trim().to_string();
    if !base.is_empty() && !base.ends_with('/') {
        base.push('/');
    }
    base.push_str("tools");
    match MetadataSource::new("environment tools", &base, CONTROL_BUCKET_PRIORITY) {
        Ok(source) => vec![source],
        Err(e) => {
            debug!(error = %e, "Skipping control bucket tools source");
            Vec::new()
        }
    }
}

/// Resolves and validates metadata against the configured sources.
#[derive(Clone)]
pub struct MetadataResolver {
    fetcher: Arc<dyn IndexFetcher>,
}

impl MetadataResolver {
    #[must_use]
    pub fn new(fetcher: Arc<dyn IndexFetcher>) -> Self {
        Self { fetcher }
    }

    /// Images matching `params` from the first source that has any,
    /// sorted by id without duplicates.
    ///
    /// # Errors
    /// Returns [`ProvisionError::NoMatchingImages`] when no source matches,
    /// or a transport error from the fetcher.
    pub async fn find_images(&self, params: &LookupParams) -> Result<Vec<ImageSpec>, ProvisionError> {
        let images: Vec<ImageSpec> = self.find(params, IMAGE_INDEX_PATH).await?;
        if images.is_empty() {
            return Err(ProvisionError::NoMatchingImages {
                series: params.series.clone(),
                arch: params.arch.clone().unwrap_or_else(|| "any".to_string()),
                region: params.region.clone(),
            });
        }
        Ok(images)
    }

    /// Ids of the images matching `params`, sorted without duplicates.
    ///
    /// # Errors
    /// Same as [`Self::find_images`].
    pub async fn validate_images(&self, params: &LookupParams) -> Result<Vec<String>, ProvisionError> {
        Ok(self
            .find_images(params)
            .await?
            .into_iter()
            .map(|image| image.id)
            .collect())
    }

    /// Tools matching `params` from the first source that has any.
    ///
    /// # Errors
    /// Returns [`ProvisionError::NoMatchingTools`] when no source matches.
    pub async fn find_tools(&self, params: &LookupParams) -> Result<Vec<ToolsSpec>, ProvisionError> {
        let tools: Vec<ToolsSpec> = self.find(params, TOOLS_INDEX_PATH).await?;
        if tools.is_empty() {
            return Err(ProvisionError::NoMatchingTools {
                series: params.series.clone(),
                arch: params.arch.clone().unwrap_or_else(|| "any".to_string()),
            });
        }
        Ok(tools)
    }

    /// Versions of the tools matching `params`, sorted without duplicates.
    ///
    /// # Errors
    /// Same as [`Self::find_tools`].
    pub async fn validate_tools(&self, params: &LookupParams) -> Result<Vec<String>, ProvisionError> {
        let mut versions: Vec<String> = self
            .find_tools(params)
            .await?
            .into_iter()
            .map(|tools| tools.version)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn find<R: MetadataRecord>(
        &self,
        params: &LookupParams,
        index_path: &str,
    ) -> Result<Vec<R>, ProvisionError> {
        let mut sources = params.sources.clone();
        sources.sort_by_key(|s| s.priority);

        for source in &sources {
            let url = source.url(index_path)?;
            let Some(data) = self.fetcher.fetch(&url).await? else {
                debug!(source = %source.description, url = %url, "No index at source");
                continue;
            };

            let index: MetadataIndex<R> = match serde_json::from_slice(&data) {
                Ok(index) => index,
                Err(e) => {
                    warn!(source = %source.description, url = %url, error = %e, "Ignoring malformed index");
                    continue;
                }
            };

            let matches = index.matching(params);
            if !matches.is_empty() {
                info!(
                    source = %source.description,
                    matches = matches.len(),
                    series = %params.series,
                    "Found metadata"
                );
                return Ok(matches);
            }
            debug!(source = %source.description, "No matching metadata at source");
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(bucket: &str) -> EnvironConfig {
        let mut env = EnvironConfig::new("sample", "test");
        env.control_bucket_url = bucket.to_string();
        env
    }

    #[test]
    fn test_image_sources_order() {
        let sources = image_sources(&env("https://s3.example.com/test-bucket"));
        assert_eq!(sources.len(), 2);
        assert!(sources[0].base_url.as_str().contains("test-bucket"));
        assert_eq!(
            sources[1].base_url.as_str(),
            format!("{DEFAULT_IMAGE_BASE_URL}/")
        );
        assert!(sources[0].priority < sources[1].priority);
    }

    #[test]
    fn test_source_serialises_url_as_string() {
        let source = MetadataSource::new("public", "https://images.example.com/releases", 5).unwrap();
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["base_url"], "https://images.example.com/releases/");
        assert_eq!(json["priority"], 5);
    }

    #[test]
    fn test_unparseable_control_bucket_is_dropped() {
        for bucket in ["", "not a url", "/relative/path"] {
            let sources = image_sources(&env(bucket));
            assert_eq!(sources.len(), 1, "{bucket:?}");
            assert_eq!(sources[0].priority, PUBLIC_PRIORITY);
        }
    }

    #[test]
    fn test_image_metadata_override() {
        let mut config = env("https://s3.example.com/test-bucket/");
        config.image_metadata_url = Some("https://mirror.example.com/images".into());
        let sources = image_sources(&config);
        assert_eq!(
            sources[1].base_url.as_str(),
            "https://mirror.example.com/images/"
        );
    }

    #[test]
    fn test_tools_sources() {
        let sources = tools_sources(&env("https://s3.example.com/test-bucket"));
        assert_eq!(sources.len(), 1);
        assert!(sources[0]
            .url("")
            .unwrap()
            .as_str()
            .contains("test-bucket/tools"));

        assert!(tools_sources(&env("")).is_empty());
    }

    #[test]
    fn test_source_url_join() {
        let source = MetadataSource::new("s", "https://example.com/a/b", 1).unwrap();
        assert_eq!(
            source.url(IMAGE_INDEX_PATH).unwrap().as_str(),
            "https://example.com/a/b/streams/v1/images.json"
        );
        assert!(MetadataSource::new("s", "mailto:x@example.com", 1).is_err());
    }
}
