//! Stateless HTTP range/full downloads.
//!
//! Two operations, both cooperatively cancellable:
//! - [`RangeDownloader::download_range`]: a byte-range GET whose response
//!   must be `206 Partial Content`; anything else fails with
//!   [`FetchError::RangeNotSupported`] and the transport is dropped.
//! - [`RangeDownloader::download_all`]: a plain GET for the whole resource.
//!
//! The token is checked before each request; cancellation mid-transfer is
//! best-effort via the raced future dropping the connection.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{FetchError, FetchResult};

/// A byte-range request, in HTTP `Range` header terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// The last `n` bytes of the resource (`bytes=-n`).
    Tail(u64),
    /// An absolute inclusive span (`bytes=start-end`).
    Span { start: u64, end: u64 },
}

impl RangeSpec {
    fn header_value(&self) -> String {
        match self {
            RangeSpec::Tail(n) => format!("bytes=-{n}"),
            RangeSpec::Span { start, end } => format!("bytes={start}-{end}"),
        }
    }
}

/// HTTP downloader shared by every lane of a pool.
///
/// Stateless apart from the client's connection pool; per-call behavior is
/// fully determined by the arguments.
#[derive(Debug, Clone)]
pub struct RangeDownloader {
    client: Client,
    request_timeout: Duration,
}

impl RangeDownloader {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            request_timeout,
        }
    }

    /// Fetch one byte range. Returns the body and the absolute offset the
    /// server reported in `Content-Range` (a server may serve a different
    /// window than requested for a tail range).
    pub async fn download_range(
        &self,
        url: &Url,
        spec: RangeSpec,
        token: &CancellationToken,
    ) -> FetchResult<(Bytes, u64)> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        debug!(url = %url, range = %spec.header_value(), "range request");

        let request = self
            .client
            .get(url.clone())
            .header(RANGE, spec.header_value());
        let response = self.race_transfer(url, token, request.send()).await??;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            // Dropping the response aborts the transport.
            return Err(FetchError::RangeNotSupported);
        }

        let start = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_start)
            .ok_or_else(|| {
                FetchError::Protocol(format!("missing or unparseable Content-Range for {url}"))
            })?;

        let body = self.race_transfer(url, token, response.bytes()).await??;
        Ok((body, start))
    }

    /// Fetch the entire resource into memory.
    pub async fn download_all(&self, url: &Url, token: &CancellationToken) -> FetchResult<Bytes> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        debug!(url = %url, "full download");

        let response = self
            .race_transfer(url, token, self.client.get(url.clone()).send())
            .await??;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(self.race_transfer(url, token, response.bytes()).await??)
    }

    /// Race one transfer phase against cancellation and the per-phase
    /// timeout.
    async fn race_transfer<T, F>(
        &self,
        url: &Url,
        token: &CancellationToken,
        fut: F,
    ) -> FetchResult<Result<T, FetchError>>
    where
        F: std::future::Future<Output = Result<T, reqwest::Error>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            res = timeout(self.request_timeout, fut) => match res {
                Ok(inner) => Ok(inner.map_err(|e| map_transport_error(url, e))),
                Err(_) => Err(FetchError::Timeout(url.to_string())),
            },
        }
    }
}

fn map_transport_error(url: &Url, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Parse the starting offset out of a `Content-Range` header.
/// Expected format: `bytes {start}-{end}/{total}`.
fn parse_content_range_start(header_val: &str) -> Option<u64> {
    let rest = header_val.trim().strip_prefix("bytes ")?;
    let (start, _) = rest.split_once('-')?;
    start.trim().parse::<u64>().ok()
}
