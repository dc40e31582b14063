//! Request URL parsing.
//!
//! A request URL has the shape `http(s)://<origin-host>/<path>[?<version>]`:
//! - the path, with `index.html` appended to directory paths, is the [`ResourceKey`]
//! - the raw query string is the [`VersionTag`]
//! - the content path mirrors the key under the cache root

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{CacheError, CacheResult};

/// Document served for directory paths.
pub const INDEX_DOCUMENT: &str = "index.html";

/// Normalized absolute path identifying one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Wrap an already normalized path such as `/kcs2/version.json`.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blob location for this key under `root`.
    pub fn content_path(&self, root: &Path) -> PathBuf {
        self.0
            .split('/')
            .filter(|segment| !matches!(*segment, "" | "." | ".."))
            .fold(root.to_path_buf(), |path, segment| path.join(segment))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque freshness token taken from the query string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty and `"?"` tags satisfy any stored version (legacy clients send both).
    pub fn is_wildcard(&self) -> bool {
        self.0.is_empty() || self.0 == "?"
    }

    /// Whether a stored version satisfies this request.
    pub fn accepts(&self, stored: &str) -> bool {
        self.is_wildcard() || self.0 == stored
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed request URL.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Origin URL the asset is fetched from.
    pub url: Url,
    pub key: ResourceKey,
    pub version: VersionTag,
}

impl ResourceRequest {
    /// Parse a raw request URL.
    ///
    /// ```
    /// use revcache_core::ResourceRequest;
    ///
    /// let req = ResourceRequest::parse("http://1.2.3.4/kcs2/img.png?abc123").unwrap();
    /// assert_eq!(req.key.as_str(), "/kcs2/img.png");
    /// assert_eq!(req.version.as_str(), "abc123");
    ///
    /// let dir = ResourceRequest::parse("http://1.2.3.4/kcs2/").unwrap();
    /// assert_eq!(dir.key.as_str(), "/kcs2/index.html");
    /// ```
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let invalid = |reason: &str| CacheError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
        url.set_fragment(None);

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("only http and https origins are supported"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing origin host"));
        }

        let path = url.path();
        if path
            .split('/')
            .any(|segment| segment == "." || segment == ".." || segment.contains('\0'))
        {
            return Err(invalid("path escapes the cache root"));
        }

        let key = if path.ends_with('/') {
            format!("{}{}", path, INDEX_DOCUMENT)
        } else {
            path.to_string()
        };

        let version = VersionTag::new(url.query().unwrap_or_default());

        Ok(Self {
            url,
            key: ResourceKey(key),
            version,
        })
    }

    /// Origin URL, fragment stripped.
    pub fn origin_url(&self) -> &str {
        self.url.as_str()
    }
}
