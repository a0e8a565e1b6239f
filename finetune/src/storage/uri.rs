use std::fmt;

/// Object-storage schemes the S3-compatible client serves.
pub const SUPPORTED_SCHEMES: &[&str] = &["s3", "gs"];

/// A parsed `scheme://bucket/key` object location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageUri {
    scheme: String,
    bucket: String,
    key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed storage URI '{uri}': {reason}")]
pub struct InvalidUri {
    pub uri: String,
    pub reason: &'static str,
}

impl StorageUri {
    pub fn new(scheme: &str, bucket: &str, key: &str) -> Result<Self, InvalidUri> {
        Self::parse(&format!("{}://{}/{}", scheme, bucket, key))
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidUri> {
        let invalid = |reason| InvalidUri {
            uri: raw.to_string(),
            reason,
        };
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(invalid("unsupported scheme"));
        }
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object key"))?;
        if bucket.is_empty() {
            return Err(invalid("empty bucket"));
        }
        if key.is_empty() || key.ends_with('/') {
            return Err(invalid("empty object key"));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Location of a file stored next to this one, e.g. the metadata sidecar.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: format!("{}{}", self.key, suffix),
        }
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}
