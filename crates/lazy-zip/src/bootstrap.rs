//! Archive bootstrap: locate the trailer and central directory with the
//! fewest bytes transferred.
//!
//! Per lane, at most one bootstrap runs; concurrent callers share the
//! in-flight outcome and a failed run clears the cell so the next call
//! retries from scratch. The protocol:
//!
//! 1. trailer from cache, or a single tail range request covering the
//!    worst-case end-of-central-directory record (with a full comment);
//! 2. central directory from cache, sliced out of the tail chunk when
//!    colocated, or fetched with its own exact range request;
//! 3. a rejected range request at either step permanently switches the
//!    document to in-memory fallback: one full download, retained for the
//!    lane's lifetime, with every entry's bytes pre-populated into the
//!    fragment cache best-effort.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use lazy_zip_format::{ByteRange, ZipIndex};
use tracing::{debug, warn};

use crate::downloader::RangeSpec;
use crate::error::{FetchError, FetchResult};
use crate::lane::{LaneEvent, LaneInner};
use crate::resolver::SharedOutcome;

/// Reserved fragment name for the validated end-of-central-directory
/// region.
pub(crate) const SENTINEL_EOCD: &str = ":eocd";

/// Reserved fragment name for the central directory.
pub(crate) const SENTINEL_CD: &str = ":cd";

/// Worst-case trailer size: a 22-byte end-of-central-directory record plus
/// a 65535-byte comment.
pub(crate) const MAX_TRAILER_LEN: u64 = 22 + 65_535;

/// Bootstrap product: the parsed archive layout and the entry list, both
/// immutable once set.
pub(crate) struct ZipDocument {
    pub(crate) index: ZipIndex,
    pub(crate) entry_names: Vec<String>,
}

/// Where the trailer bytes came from; decides how the central directory can
/// be located without another request.
enum TrailerSource {
    /// Validated EOCD region from the fragment cache.
    Cached(Bytes),
    /// Tail chunk from a range request, starting at absolute offset
    /// `start`.
    Tail { chunk: Bytes, start: u64 },
    /// Full in-memory body (fallback mode).
    Body(Bytes),
}

impl LaneInner {
    /// Whether this document fetches from the retained in-memory body
    /// instead of issuing range requests. Monotonic per lane.
    pub(crate) fn in_fallback(&self) -> bool {
        self.settings.force_in_memory || self.fallback.load(Ordering::Acquire)
    }

    /// Bootstrap once, sharing the in-flight outcome across callers.
    pub(crate) async fn document(self: &Arc<Self>) -> FetchResult<Arc<ZipDocument>> {
        let outcome = {
            let mut cell = self.bootstrap_cell.lock().await;
            match cell.as_ref() {
                Some(outcome) => outcome.clone(),
                None => {
                    let inner = Arc::clone(self);
                    let outcome = SharedOutcome::spawn(async move { inner.run_bootstrap().await });
                    *cell = Some(outcome.clone());
                    outcome
                }
            }
        };
        outcome.wait().await
    }

    async fn run_bootstrap(self: Arc<Self>) -> FetchResult<Arc<ZipDocument>> {
        let res = self.bootstrap_steps().await;
        if res.is_err() {
            // retry from scratch on the next call
            *self.bootstrap_cell.lock().await = None;
        }
        res
    }

    async fn bootstrap_steps(self: &Arc<Self>) -> FetchResult<Arc<ZipDocument>> {
        let token = &self.lane_token;

        let mut eocd_hit = true;
        let trailer_src = if let Some(bytes) = self.cache.get(SENTINEL_EOCD).await {
            TrailerSource::Cached(bytes)
        } else {
            eocd_hit = false;
            if self.in_fallback() {
                TrailerSource::Body(self.acquire_full_body().await?)
            } else {
                let spec = RangeSpec::Tail(MAX_TRAILER_LEN);
                match self.downloader.download_range(&self.url, spec, token).await {
                    Ok((chunk, start)) => TrailerSource::Tail { chunk, start },
                    Err(FetchError::RangeNotSupported) => {
                        TrailerSource::Body(self.acquire_full_body().await?)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let trailer: &[u8] = match &trailer_src {
            TrailerSource::Cached(bytes) => bytes,
            TrailerSource::Tail { chunk, .. } => chunk,
            TrailerSource::Body(body) => {
                &body[body.len().saturating_sub(MAX_TRAILER_LEN as usize)..]
            }
        };
        let mut index = ZipIndex::from_trailer(trailer)?;

        if !eocd_hit {
            // store only the validated record, not the whole probe chunk
            let region = index.eocd_range();
            let lo = region.offset as usize;
            let hi = lo + region.size as usize;
            self.cache.put(SENTINEL_EOCD, &trailer[lo..hi]).await;
        }

        let cd = index.cd_range();
        let mut cd_hit = true;
        let cd_bytes = if cd.size == 0 {
            Bytes::new()
        } else if let Some(bytes) = self.cache.get(SENTINEL_CD).await {
            bytes
        } else {
            cd_hit = false;
            match colocated_cd_slice(&trailer_src, cd)? {
                Some(bytes) => bytes,
                None => {
                    let spec = RangeSpec::Span {
                        start: cd.offset,
                        end: cd.offset + cd.size - 1,
                    };
                    match self.downloader.download_range(&self.url, spec, token).await {
                        Ok((bytes, _)) => bytes,
                        Err(FetchError::RangeNotSupported) => {
                            let body = self.acquire_full_body().await?;
                            slice_exact(&body, cd)?
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };
        if !cd_hit {
            self.cache.put(SENTINEL_CD, &cd_bytes).await;
        }

        let entry_names = index.parse_central_directory(&cd_bytes)?;
        debug!(
            lane = self.id,
            url = %self.url,
            entries = entry_names.len(),
            fallback = self.in_fallback(),
            "bootstrap complete"
        );

        let doc = Arc::new(ZipDocument { index, entry_names });
        if self.in_fallback() {
            self.spawn_prepopulate(Arc::clone(&doc));
        }
        Ok(doc)
    }

    /// Acquire (once) the full in-memory body, entering fallback mode.
    ///
    /// The transition is signalled upstream exactly once; a failed download
    /// clears the cell so a later call retries, but the fallback flag never
    /// reverts.
    pub(crate) async fn acquire_full_body(self: &Arc<Self>) -> FetchResult<Bytes> {
        self.enter_fallback();
        let outcome = {
            let mut cell = self.memory_cell.lock().await;
            match cell.as_ref() {
                Some(outcome) => outcome.clone(),
                None => {
                    let inner = Arc::clone(self);
                    let outcome = SharedOutcome::spawn(async move {
                        let res = inner
                            .downloader
                            .download_all(&inner.url, &inner.lane_token)
                            .await;
                        if res.is_err() {
                            *inner.memory_cell.lock().await = None;
                        }
                        res
                    });
                    *cell = Some(outcome.clone());
                    outcome
                }
            }
        };
        outcome.wait().await
    }

    fn enter_fallback(&self) {
        if !self.fallback.swap(true, Ordering::AcqRel) {
            debug!(lane = self.id, url = %self.url, "entering in-memory fallback");
            let _ = self.events.send(LaneEvent::EnteredFallback { lane: self.id });
        }
    }

    /// Best-effort: seed the fragment cache with every entry's raw bytes
    /// sliced from the in-memory body, so later sessions work without
    /// range support.
    fn spawn_prepopulate(self: &Arc<Self>, doc: Arc<ZipDocument>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let body = match inner.acquire_full_body().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(lane = inner.id, "cache pre-population skipped: {e}");
                    return;
                }
            };
            for name in &doc.entry_names {
                let sliced = doc
                    .index
                    .entry_range(name)
                    .map_err(FetchError::from)
                    .and_then(|range| slice_span(&body, range));
                match sliced {
                    Ok(bytes) => inner.cache.put(name, &bytes).await,
                    Err(e) => warn!(lane = inner.id, name, "entry not pre-populated: {e}"),
                }
            }
            debug!(lane = inner.id, "fragment cache pre-populated from in-memory body");
        });
    }
}

fn colocated_cd_slice(src: &TrailerSource, cd: ByteRange) -> FetchResult<Option<Bytes>> {
    match src {
        TrailerSource::Cached(_) => Ok(None),
        TrailerSource::Tail { chunk, start } => {
            if cd.offset < *start {
                return Ok(None);
            }
            let lo = (cd.offset - start) as usize;
            let hi = lo + cd.size as usize;
            if hi > chunk.len() {
                return Err(layout_error());
            }
            Ok(Some(chunk.slice(lo..hi)))
        }
        TrailerSource::Body(body) => slice_exact(body, cd).map(Some),
    }
}

/// Slice an exact-length span (`offset .. offset + size`).
pub(crate) fn slice_exact(body: &Bytes, range: ByteRange) -> FetchResult<Bytes> {
    let lo = range.offset as usize;
    let hi = lo.checked_add(range.size as usize).filter(|&hi| hi <= body.len());
    match hi {
        Some(hi) => Ok(body.slice(lo..hi)),
        None => Err(layout_error()),
    }
}

/// Slice an entry span, whose `size` is inclusive
/// (`offset ..= offset + size`).
pub(crate) fn slice_span(body: &Bytes, range: ByteRange) -> FetchResult<Bytes> {
    let lo = range.offset as usize;
    let hi = lo
        .checked_add(range.size as usize)
        .and_then(|hi| hi.checked_add(1))
        .filter(|&hi| hi <= body.len());
    match hi {
        Some(hi) => Ok(body.slice(lo..hi)),
        None => Err(layout_error()),
    }
}

fn layout_error() -> FetchError {
    FetchError::Protocol("archive layout points outside the downloaded body".to_string())
}
