//! Unified crate-level error types.
//!
//! This module provides a single [`FetchError`] used across the crate and a
//! convenient [`FetchResult`] alias.
//!
//! Note: the error type is `Clone`. Outcomes are fanned out to several
//! concurrent callers through shared futures, so every variant carries
//! cheaply clonable payloads (strings, status codes) instead of concrete
//! HTTP client or IO error types.

use lazy_zip_format::FormatError;

/// Result type used by this crate.
pub type FetchResult<T> = Result<T, FetchError>;

/// Unified error type for the `lazy-zip` crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The server answered a byte-range request without `206 Partial
    /// Content`.
    ///
    /// Internal signal: it drives the in-memory fallback transition and is
    /// never surfaced to a caller.
    #[error("server does not support range requests")]
    RangeNotSupported,

    /// Operation was cancelled by the caller.
    ///
    /// A distinct outcome, not a failure; callers race against it.
    #[error("operation cancelled")]
    Cancelled,

    /// HTTP request failed with a non-success status.
    #[error("HTTP error: {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Transport-level failure (connect, DNS, mid-body disconnect).
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// The response violated the expected protocol shape, e.g. a `206`
    /// without a parseable `Content-Range` header.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Archive metadata or entry data could not be decoded.
    ///
    /// Fatal for the request that hit it, harmless for other entries.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The document URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The lane terminated while a caller was still waiting on it.
    #[error("lane closed")]
    LaneClosed,
}
