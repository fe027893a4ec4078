//! Lane worker: one isolated fetch/decode unit bound to a document.
//!
//! The coordinator talks to a lane exclusively over its request channel;
//! replies travel back through completion sources and fallback transitions
//! are pushed on a separate event channel. Within the lane, concurrent
//! `GetData` calls for the same entry share one underlying operation
//! through the pending table, and each pending entry carries its own
//! cancellation token for `AbortData`.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::bootstrap::{ZipDocument, slice_span};
use crate::cache::FragmentCache;
use crate::downloader::{RangeDownloader, RangeSpec};
use crate::error::{FetchError, FetchResult};
use crate::resolver::{CompletionSource, SharedOutcome};
use crate::settings::Settings;

/// Requests a lane accepts from the coordinator.
pub(crate) enum LaneRequest {
    Init {
        reply: CompletionSource<InitReply>,
    },
    GetData {
        name: String,
        reply: CompletionSource<Bytes>,
    },
    AbortData {
        name: String,
    },
}

/// Bootstrap summary returned for `Init`.
#[derive(Debug, Clone)]
pub(crate) struct InitReply {
    pub(crate) entry_names: Vec<String>,
    pub(crate) fallback: bool,
}

/// Events a lane pushes upstream outside the request/reply flow.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LaneEvent {
    /// The lane privately switched its document to in-memory fallback.
    EnteredFallback { lane: usize },
}

/// Lane state shared between the message loop and its per-request tasks.
pub(crate) struct LaneInner {
    pub(crate) id: usize,
    pub(crate) url: Url,
    pub(crate) settings: Settings,
    pub(crate) cache: FragmentCache,
    pub(crate) downloader: RangeDownloader,
    pub(crate) events: mpsc::UnboundedSender<LaneEvent>,

    /// Cancelled when the lane terminates; bootstrap and the fallback
    /// download run under it.
    pub(crate) lane_token: CancellationToken,

    /// Monotonic fallback flag; see [`LaneInner::in_fallback`].
    pub(crate) fallback: AtomicBool,

    /// Shared in-flight (or settled) bootstrap.
    pub(crate) bootstrap_cell: AsyncMutex<Option<SharedOutcome<Arc<ZipDocument>>>>,

    /// Shared in-flight (or retained) full in-memory body.
    pub(crate) memory_cell: AsyncMutex<Option<SharedOutcome<Bytes>>>,

    /// Entry name -> in-flight fetch; removed on settle so retries start
    /// fresh.
    pending: Mutex<HashMap<String, (CancellationToken, SharedOutcome<Bytes>)>>,
}

impl LaneInner {
    fn new(
        id: usize,
        url: Url,
        settings: Settings,
        cache: FragmentCache,
        events: mpsc::UnboundedSender<LaneEvent>,
        lane_token: CancellationToken,
    ) -> Self {
        let downloader = RangeDownloader::new(settings.request_timeout);
        Self {
            id,
            url,
            settings,
            cache,
            downloader,
            events,
            lane_token,
            fallback: AtomicBool::new(false),
            bootstrap_cell: AsyncMutex::new(None),
            memory_cell: AsyncMutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn init(self: &Arc<Self>) -> FetchResult<InitReply> {
        let doc = self.document().await?;
        Ok(InitReply {
            entry_names: doc.entry_names.clone(),
            fallback: self.in_fallback(),
        })
    }

    /// Deduplicated entry fetch: a second request for a pending name
    /// observes the first one's outcome.
    pub(crate) fn get_data(self: &Arc<Self>, name: &str) -> SharedOutcome<Bytes> {
        let mut pending = self.pending.lock().expect("lane pending table poisoned");
        if let Some((_, outcome)) = pending.get(name) {
            trace!(lane = self.id, name, "joining in-flight entry fetch");
            return outcome.clone();
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(self);
        let fetch_name = name.to_string();
        let fetch_token = token.clone();
        let outcome = SharedOutcome::spawn(async move {
            let res = inner.fetch_entry(&fetch_name, &fetch_token).await;
            inner
                .pending
                .lock()
                .expect("lane pending table poisoned")
                .remove(&fetch_name);
            res
        });

        pending.insert(name.to_string(), (token, outcome.clone()));
        outcome
    }

    /// Cancel a matching in-flight fetch; no-op otherwise.
    pub(crate) fn abort_data(&self, name: &str) {
        let pending = self.pending.lock().expect("lane pending table poisoned");
        if let Some((token, _)) = pending.get(name) {
            trace!(lane = self.id, name, "aborting in-flight entry fetch");
            token.cancel();
        }
    }

    fn cancel_all(&self) {
        self.lane_token.cancel();
        let pending = self.pending.lock().expect("lane pending table poisoned");
        for (token, _) in pending.values() {
            token.cancel();
        }
    }

    /// Steady-state retrieval pipeline for one entry.
    async fn fetch_entry(self: &Arc<Self>, name: &str, token: &CancellationToken) -> FetchResult<Bytes> {
        let doc = self.document().await?;
        ensure_live(token)?;

        if let Some(raw) = self.cache.get(name).await {
            ensure_live(token)?;
            let decoded = doc.index.decode_entry(name, &raw)?;
            ensure_live(token)?;
            return Ok(Bytes::from(decoded));
        }

        let range = doc.index.entry_range(name)?;
        let raw = if self.in_fallback() {
            let body = self.acquire_full_body().await?;
            slice_span(&body, range)?
        } else {
            let spec = RangeSpec::Span {
                start: range.offset,
                end: range.offset + range.size,
            };
            match self.downloader.download_range(&self.url, spec, token).await {
                Ok((bytes, _)) => bytes,
                Err(FetchError::RangeNotSupported) => {
                    let body = self.acquire_full_body().await?;
                    slice_span(&body, range)?
                }
                Err(e) => return Err(e),
            }
        };
        ensure_live(token)?;

        self.cache.put(name, &raw).await;
        let decoded = doc.index.decode_entry(name, &raw)?;
        ensure_live(token)?;
        Ok(Bytes::from(decoded))
    }
}

fn ensure_live(token: &CancellationToken) -> FetchResult<()> {
    if token.is_cancelled() {
        Err(FetchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Lane task body: open the fragment store, then serve requests until the
/// channel closes or the shutdown token fires.
pub(crate) async fn run_lane(
    id: usize,
    url: Url,
    settings: Settings,
    events: mpsc::UnboundedSender<LaneEvent>,
    mut requests: mpsc::UnboundedReceiver<LaneRequest>,
    shutdown: CancellationToken,
) {
    let cache = FragmentCache::open(
        &url,
        settings.cache_path.as_deref(),
        settings.force_keep_cache,
    )
    .await;
    let inner = Arc::new(LaneInner::new(
        id,
        url,
        settings,
        cache,
        events,
        shutdown.child_token(),
    ));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = requests.recv() => match msg {
                Some(LaneRequest::Init { reply }) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        reply.settle(inner.init().await);
                    });
                }
                Some(LaneRequest::GetData { name, reply }) => {
                    let outcome = inner.get_data(&name);
                    tokio::spawn(async move {
                        reply.settle(outcome.wait().await);
                    });
                }
                Some(LaneRequest::AbortData { name }) => inner.abort_data(&name),
                None => break,
            },
        }
    }

    inner.cancel_all();
    trace!(lane = inner.id, "lane terminated");
}
