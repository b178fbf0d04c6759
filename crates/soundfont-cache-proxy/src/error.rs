//! Error types for the soundfont cache proxy

use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    Io(Box<std::io::Error>),
    Http(reqwest::Error),
    /// Upstream answered with a non-success status
    Upstream { url: String, status: u16 },
    /// A write did not fit in the budget, even after eviction
    QuotaExceeded { size: u64, available: u64 },
    Serialization(serde_json::Error),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Http(err) => write!(f, "HTTP error: {}", err),
            ProxyError::Upstream { url, status } => {
                write!(f, "Upstream returned status {} for {}", status, url)
            }
            ProxyError::QuotaExceeded { size, available } => write!(
                f,
                "Quota exceeded: {} bytes requested, {} bytes available",
                size, available
            ),
            ProxyError::Serialization(err) => write!(f, "Serialization error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(err) => Some(err.as_ref()),
            ProxyError::Http(err) => Some(err),
            ProxyError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Http(err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
