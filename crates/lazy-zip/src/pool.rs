//! Client-facing lane pool.
//!
//! Two-phase start: lane 0 probes the server (and is the only lane that can
//! discover fallback during start-up); coworker lanes are fanned out
//! afterwards and bootstrap from the shared fragment store. A listener task
//! watches lane events and, when any lane enters in-memory fallback,
//! atomically collapses the pool to that single lane.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, warn};
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::handle::LaneHandle;
use crate::lane::LaneEvent;
use crate::resolver::SharedOutcome;
use crate::settings::Settings;

/// Lazy reader over one remote ZIP archive.
///
/// Callers share it by reference; dropping it terminates every lane.
pub struct LazyZip {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for LazyZip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyZip")
            .field("entry_names", &self.inner.entry_names)
            .finish_non_exhaustive()
    }
}

struct PoolInner {
    entry_names: Vec<String>,
    lanes: Mutex<Vec<LaneHandle>>,
    prefetch: AsyncMutex<Option<SharedOutcome<()>>>,
}

impl LazyZip {
    /// Connect to a remote archive: normalize the URL, bootstrap the
    /// primary lane, then fan out coworkers unless the primary already
    /// landed in fallback mode.
    pub async fn connect(url: &str, settings: Settings) -> FetchResult<Self> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let primary = LaneHandle::spawn(0, url.clone(), settings.clone(), events_tx.clone());
        let init = primary.init().await?;

        let mut lanes = vec![primary];
        if !init.fallback {
            // coworkers always retain their cache; the shared store was
            // already swept by the primary
            let coworker_settings = settings.clone().force_keep_cache(true);
            for id in 1..settings.lane_multiply.max(1) {
                let lane = LaneHandle::spawn(
                    id,
                    url.clone(),
                    coworker_settings.clone(),
                    events_tx.clone(),
                );
                let warm = lane.clone();
                tokio::spawn(async move {
                    if let Err(e) = warm.init().await {
                        warn!(lane = warm.id(), "coworker bootstrap failed: {e}");
                    }
                });
                lanes.push(lane);
            }
        }

        let inner = Arc::new(PoolInner {
            entry_names: init.entry_names,
            lanes: Mutex::new(lanes),
            prefetch: AsyncMutex::new(None),
        });

        let pool: Weak<PoolInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(LaneEvent::EnteredFallback { lane }) = events_rx.recv().await {
                let Some(pool) = pool.upgrade() else { break };
                pool.collapse_to(lane);
            }
        });

        Ok(Self { inner })
    }

    /// Entry names in central-directory order.
    pub fn entry_names(&self) -> &[String] {
        &self.inner.entry_names
    }

    /// Fetch and decode one entry.
    ///
    /// If any lane already has the entry in flight that outcome is shared;
    /// otherwise the least-loaded lane takes the request.
    pub async fn get_buffer(&self, name: &str) -> FetchResult<Bytes> {
        self.inner.get_buffer(name).await
    }

    /// Broadcast an abort for `name` to every lane.
    pub fn abort(&self, name: &str) {
        for lane in self.inner.snapshot() {
            lane.abort(name);
        }
    }

    /// Warm every entry sequentially. Concurrent callers share one
    /// in-flight prefetch; a failed prefetch clears the slot so a later
    /// call retries.
    pub async fn prefetch_all(&self) -> FetchResult<()> {
        let outcome = {
            let mut cell = self.inner.prefetch.lock().await;
            match cell.as_ref() {
                Some(outcome) => outcome.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let outcome = SharedOutcome::spawn(async move {
                        let res = inner.prefetch_all_inner().await;
                        if res.is_err() {
                            *inner.prefetch.lock().await = None;
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
}

impl PoolInner {
    fn snapshot(&self) -> Vec<LaneHandle> {
        self.lanes.lock().expect("lane list poisoned").clone()
    }

    async fn get_buffer(&self, name: &str) -> FetchResult<Bytes> {
        let lanes = self.snapshot();

        // first lane (insertion order) with the entry in flight wins
        for lane in &lanes {
            if let Some(outcome) = lane.existing(name) {
                return outcome.wait().await;
            }
        }

        // least-pending lane; ties break to the first found
        let lane = lanes
            .iter()
            .min_by_key(|lane| lane.pending_count())
            .ok_or(FetchError::LaneClosed)?;
        lane.get_buffer(name).wait().await
    }

    async fn prefetch_all_inner(&self) -> FetchResult<()> {
        for name in &self.entry_names {
            self.get_buffer(name).await?;
        }
        Ok(())
    }

    /// Replace the pool with the single lane that entered fallback,
    /// terminating the rest.
    fn collapse_to(&self, lane_id: usize) {
        let mut lanes = self.lanes.lock().expect("lane list poisoned");
        if lanes.len() <= 1 {
            return;
        }
        let Some(keep) = lanes.iter().find(|lane| lane.id() == lane_id).cloned() else {
            return;
        };
        debug!(lane = lane_id, "collapsing pool to its fallback lane");
        for lane in lanes.iter() {
            if lane.id() != lane_id {
                lane.terminate();
            }
        }
        *lanes = vec![keep];
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(lanes) = self.lanes.lock() {
            for lane in lanes.iter() {
                lane.terminate();
            }
        }
    }
}
