use thiserror::Error;

/// An error that happens while producing or changing a cached value.
///
/// Errors are cloneable, so a single fetch failure can be handed to every caller that joined
/// the fetch and be stored on the entry for later readers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// There is no cached value for the key and no fetcher to produce one.
    #[error("not found")]
    NotFound,
    /// The fetcher or the server call failed.
    ///
    /// The attached string contains the collaborator's error message.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// A mutation payload was rejected before anything was written to the cache.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The fetch was cancelled before it completed.
    ///
    /// Cancelled results are never written to the cache or delivered to observers.
    #[error("fetch cancelled")]
    Cancelled,
    /// An unexpected error in the cache itself, like a fetch task that panicked.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Logs an unexpected error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Creates a [`Fetch`](Self::Fetch) error from anything printable.
    pub fn fetch(details: impl std::fmt::Display) -> Self {
        Self::Fetch(details.to_string())
    }

    /// Whether a failed fetch should be attempted again.
    ///
    /// Only transport failures are retried. A missing value, a rejected payload or a
    /// cancellation will not change on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::InternalError)
    }

    /// A short, stable name for this error, used as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::NotFound => "notfound",
            CacheError::Fetch(_) => "fetch",
            CacheError::Validation(_) => "validation",
            CacheError::Cancelled => "cancelled",
            CacheError::InternalError => "internalerror",
        }
    }
}

/// The result of fetching or mutating a cached value.
pub type CacheResult<T> = Result<T, CacheError>;
