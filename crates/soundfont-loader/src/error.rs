//! Error types for the soundfont loader

use std::fmt;
use std::time::Duration;

/// Failure of a single source attempt. Recovered by moving to the next mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    Timeout { url: String, after: Duration },
    Status { url: String, status: u16 },
    Transport { url: String, message: String },
    Malformed { url: String, message: String },
}

impl SourceError {
    pub fn url(&self) -> &str {
        match self {
            SourceError::Timeout { url, .. }
            | SourceError::Status { url, .. }
            | SourceError::Transport { url, .. }
            | SourceError::Malformed { url, .. } => url,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, SourceError::Malformed { .. })
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Timeout { url, after } => {
                write!(f, "Timed out after {:?} fetching {}", after, url)
            }
            SourceError::Status { url, status } => {
                write!(f, "Source {} returned status {}", url, status)
            }
            SourceError::Transport { url, message } => {
                write!(f, "Transport error fetching {}: {}", url, message)
            }
            SourceError::Malformed { url, message } => {
                write!(f, "Malformed payload from {}: {}", url, message)
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// Terminal error surfaced by `DownloadCoordinator::acquire`.
///
/// Cloneable so a single in-flight fetch can hand the same failure to every
/// caller that joined it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    InvalidDescriptor(String),
    AllSourcesExhausted {
        key: String,
        failures: Vec<SourceError>,
    },
    RetriesExhausted {
        key: String,
        attempts: u32,
        last: Box<LoadError>,
    },
    Decode {
        key: String,
        message: String,
    },
    Internal(String),
}

impl LoadError {
    pub fn key(&self) -> Option<&str> {
        match self {
            LoadError::AllSourcesExhausted { key, .. }
            | LoadError::RetriesExhausted { key, .. }
            | LoadError::Decode { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::InvalidDescriptor(msg) => write!(f, "Invalid descriptor: {}", msg),
            LoadError::AllSourcesExhausted { key, failures } => write!(
                f,
                "All sources exhausted for {} ({} attempted)",
                key,
                failures.len()
            ),
            LoadError::RetriesExhausted {
                key,
                attempts,
                last,
            } => write!(
                f,
                "Retries exhausted for {} after {} attempts: {}",
                key, attempts, last
            ),
            LoadError::Decode { key, message } => {
                write!(f, "Decode error for {}: {}", key, message)
            }
            LoadError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Storage failure in one cache tier. Logged and ignored by the tiered cache.
#[derive(Debug)]
pub enum TierError {
    Io(Box<std::io::Error>),
    Unavailable(String),
    TooLarge { size: u64, limit: u64 },
    Index(String),
}

impl fmt::Display for TierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierError::Io(err) => write!(f, "IO error: {}", err),
            TierError::Unavailable(msg) => write!(f, "Tier unavailable: {}", msg),
            TierError::TooLarge { size, limit } => {
                write!(f, "Entry of {} bytes exceeds tier limit of {}", size, limit)
            }
            TierError::Index(msg) => write!(f, "Index error: {}", msg),
        }
    }
}

impl std::error::Error for TierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TierError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        TierError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for TierError {
    fn from(err: serde_json::Error) -> Self {
        TierError::Index(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::Status {
            url: "https://mirror.example/piano.json".to_string(),
            status: 503,
        };
        assert_eq!(
            format!("{}", err),
            "Source https://mirror.example/piano.json returned status 503"
        );
        assert_eq!(err.url(), "https://mirror.example/piano.json");
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_retries_exhausted_display_includes_last_error() {
        let err = LoadError::RetriesExhausted {
            key: "violin".to_string(),
            attempts: 3,
            last: Box::new(LoadError::AllSourcesExhausted {
                key: "violin".to_string(),
                failures: vec![],
            }),
        };
        let text = format!("{}", err);
        assert!(text.contains("after 3 attempts"));
        assert!(text.contains("All sources exhausted for violin"));
        assert_eq!(err.key(), Some("violin"));
    }

    #[test]
    fn test_tier_error_too_large_display() {
        let err = TierError::TooLarge {
            size: 10,
            limit: 5,
        };
        assert_eq!(
            format!("{}", err),
            "Entry of 10 bytes exceeds tier limit of 5"
        );
    }

    #[test]
    fn test_error_is_debug() {
        let err = LoadError::InvalidDescriptor("no sources".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("InvalidDescriptor"));
    }
}
