//! Metadata index records and matching.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::MetadataSource;

/// Target a metadata lookup must match.
#[derive(Debug, Clone)]
pub struct LookupParams {
    pub series: String,
    /// Architecture; any when unset.
    pub arch: Option<String>,
    pub region: String,
    /// Backend API endpoint; records naming a different endpoint are
    /// skipped. Empty matches every endpoint.
    pub endpoint: String,
    pub sources: Vec<MetadataSource>,
}

/// A record in a metadata index.
pub trait MetadataRecord: DeserializeOwned + Clone + Send {
    /// Identity used for ordering and de-duplication.
    fn key(&self) -> String;
    fn series(&self) -> &str;
    fn arch(&self) -> &str;
    /// Region the record is valid in; `None` for region-independent data.
    fn region(&self) -> Option<&str> {
        None
    }
    /// Endpoint the record is valid for, if restricted.
    fn endpoint(&self) -> Option<&str> {
        None
    }

    /// Whether the record satisfies `params`.
    fn matches(&self, params: &LookupParams) -> bool {
        let same_endpoint = |e: &str| {
            params.endpoint.is_empty()
                || e.trim_end_matches('/') == params.endpoint.trim_end_matches('/')
        };
        self.series() == params.series
            && params.arch.as_deref().is_none_or(|a| a == self.arch())
            && self.region().is_none_or(|r| r == params.region)
            && self.endpoint().is_none_or(same_endpoint)
    }
}

/// A published index of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataIndex<R> {
    #[serde(default)]
    pub format: String,
    #[serde(default = "Vec::new")]
    pub items: Vec<R>,
}

impl<R: MetadataRecord> MetadataIndex<R> {
    /// Records matching `params`, sorted by key without duplicates.
    #[must_use]
    pub fn matching(&self, params: &LookupParams) -> Vec<R> {
        let mut matches: Vec<R> = self
            .items
            .iter()
            .filter(|r| r.matches(params))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.key());
        matches.dedup_by_key(|r| r.key());
        matches
    }
}

/// A bootable machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub id: String,
    pub series: String,
    pub arch: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl MetadataRecord for ImageSpec {
    fn key(&self) -> String {
        self.id.clone()
    }

    fn series(&self) -> &str {
        &self.series
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn region(&self) -> Option<&str> {
        Some(&self.region)
    }

    fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

/// A downloadable agent tools tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsSpec {
    pub version: String,
    pub series: String,
    pub arch: String,
    /// Download location.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ToolsSpec {
    /// Version as numeric components for ordering ("1.10.2" > "1.9.7").
    #[must_use]
    pub fn version_number(&self) -> Vec<u64> {
        self.version
            .split(['.', '-'])
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    }
}

impl MetadataRecord for ToolsSpec {
    fn key(&self) -> String {
        format!("{}-{}-{}", self.version, self.series, self.arch)
    }

    fn series(&self) -> &str {
        &self.series
    }

    fn arch(&self) -> &str {
        &self.arch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(series: &str, arch: Option<&str>) -> LookupParams {
        LookupParams {
            series: series.to_string(),
            arch: arch.map(str::to_string),
            region: "test".to_string(),
            endpoint: "https://ec2.endpoint.com".to_string(),
            sources: Vec::new(),
        }
    }

    fn image(id: &str, series: &str, arch: &str, region: &str) -> ImageSpec {
        ImageSpec {
            id: id.to_string(),
            series: series.to_string(),
            arch: arch.to_string(),
            region: region.to_string(),
            endpoint: None,
        }
    }

    #[test]
    fn test_mixed_index_yields_matching_subset() {
        let index = MetadataIndex {
            format: "products:1.0".into(),
            items: vec![
                image("ami-00000099", "raring", "amd64", "test"),
                image("ami-00000034", "precise", "i386", "test"),
                image("ami-00000033", "precise", "amd64", "test"),
                image("ami-00000033", "precise", "amd64", "test"),
                image("ami-00000050", "precise", "amd64", "other"),
            ],
        };
        let ids: Vec<String> = index
            .matching(&params("precise", None))
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["ami-00000033", "ami-00000034"]);

        let ids: Vec<String> = index
            .matching(&params("precise", Some("amd64")))
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["ami-00000033"]);
    }

    #[test]
    fn test_endpoint_restriction() {
        let mut img = image("ami-1", "precise", "amd64", "test");
        img.endpoint = Some("https://ec2.endpoint.com/".into());
        assert!(img.matches(&params("precise", None)));

        img.endpoint = Some("https://elsewhere.example.com".into());
        assert!(!img.matches(&params("precise", None)));

        let mut any_endpoint = params("precise", None);
        any_endpoint.endpoint.clear();
        assert!(img.matches(&any_endpoint));
    }

    #[test]
    fn test_tools_ignore_region() {
        let tools = ToolsSpec {
            version: "1.16.0".into(),
            series: "precise".into(),
            arch: "amd64".into(),
            url: "https://example.com/fleetd-1.16.0-precise-amd64.tgz".into(),
            size: None,
            sha256: None,
        };
        let mut p = params("precise", Some("amd64"));
        p.region = "anywhere".into();
        assert!(tools.matches(&p));
    }

    #[test]
    fn test_tools_version_ordering() {
        let v = |s: &str| ToolsSpec {
            version: s.into(),
            series: String::new(),
            arch: String::new(),
            url: String::new(),
            size: None,
            sha256: None,
        };
        assert!(v("1.10.2").version_number() > v("1.9.7").version_number());
        assert!(v("2.0.0").version_number() > v("1.99.0").version_number());
    }

    #[test]
    fn test_index_decodes_json() {
        let json = r#"{"format":"products:1.0","items":[
            {"id":"ami-1","series":"precise","arch":"amd64","region":"test"}
        ]}"#;
        let index: MetadataIndex<ImageSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(index.items.len(), 1);
        assert_eq!(index.items[0].endpoint, None);
    }
}
