use crate::fetch::ByteRange;

/// Failure reported by a [`crate::RangeFetcher`] before it is tied to a cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        FetchError(message.into())
    }
}

/// Errors surfaced by the range cache and sources.
///
/// `Clone` because one in-flight fetch result is handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("range request failed for {url} (bytes={range}): {message}")]
    Fetch {
        url: String,
        range: ByteRange,
        message: String,
    },
    #[error("invalid source {url}: {message}")]
    Format { url: String, message: String },
}

impl SourceError {
    pub fn fetch(url: &str, range: ByteRange, err: FetchError) -> Self {
        SourceError::Fetch {
            url: url.to_string(),
            range,
            message: err.0,
        }
    }

    pub fn format(url: &str, message: impl std::fmt::Display) -> Self {
        SourceError::Format {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}
