//! Error taxonomy shared by the sync engine and its collaborators.

use std::path::PathBuf;

/// Failure reported by an external collaborator (chain node, price oracle, asset cache).
///
/// A collaborator that has *no such entity* returns `Ok(None)` instead; this type is
/// reserved for transient conditions where the cached value must be kept.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Classify a free-form upstream error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            SourceError::Timeout
        } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            SourceError::RateLimited
        } else {
            SourceError::Transport(message)
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            SourceError::RateLimited
        } else if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

/// Errors surfaced to the read layer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    #[error("no such {kind}: {key}")]
    NotFound { kind: &'static str, key: String },
}

impl SyncError {
    pub fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Self {
        SyncError::NotFound { kind, key: key.to_string() }
    }
}

/// Snapshot load/save failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot at {path} is not valid: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_messages() {
        assert!(matches!(SourceError::from_message("request timed out"), SourceError::Timeout));
        assert!(matches!(SourceError::from_message("HTTP 429 Too Many Requests"), SourceError::RateLimited));
        assert!(matches!(SourceError::from_message("connection reset"), SourceError::Transport(_)));
    }

    #[test]
    fn test_not_found_display() {
        let e = SyncError::not_found("listing", "ethereum/1/0");
        assert_eq!(e.to_string(), "no such listing: ethereum/1/0");
    }
}
