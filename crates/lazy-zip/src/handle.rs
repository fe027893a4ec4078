//! Coordinator-side lane handle.
//!
//! A clonable facade over one lane's request channel. It mirrors the
//! lane's in-flight entries in its own table so the pool can answer "does
//! any lane already have this entry in flight" without a round trip, and
//! it owns the shutdown token used to terminate the lane.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchResult;
use crate::lane::{self, InitReply, LaneEvent, LaneRequest};
use crate::resolver::{SharedOutcome, completion};
use crate::settings::Settings;

#[derive(Clone)]
pub(crate) struct LaneHandle {
    id: usize,
    requests: mpsc::UnboundedSender<LaneRequest>,
    shutdown: CancellationToken,
    pending: Arc<Mutex<HashMap<String, SharedOutcome<Bytes>>>>,
}

impl LaneHandle {
    /// Spawn a lane task and return its handle.
    pub(crate) fn spawn(
        id: usize,
        url: Url,
        settings: Settings,
        events: mpsc::UnboundedSender<LaneEvent>,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(lane::run_lane(
            id,
            url,
            settings,
            events,
            rx,
            shutdown.clone(),
        ));
        Self {
            id,
            requests,
            shutdown,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Await the lane's bootstrap summary.
    ///
    /// A send on a closed channel drops the reply source, which surfaces to
    /// the waiter as `LaneClosed`.
    pub(crate) async fn init(&self) -> FetchResult<InitReply> {
        let (reply, outcome) = completion();
        let _ = self.requests.send(LaneRequest::Init { reply });
        outcome.wait().await
    }

    /// Request one entry, deduplicating against this handle's in-flight
    /// table. The slot frees itself when the outcome settles.
    pub(crate) fn get_buffer(&self, name: &str) -> SharedOutcome<Bytes> {
        let mut pending = self.pending.lock().expect("handle pending table poisoned");
        if let Some(outcome) = pending.get(name) {
            return outcome.clone();
        }

        let (reply, outcome) = completion();
        let _ = self.requests.send(LaneRequest::GetData {
            name: name.to_string(),
            reply,
        });
        pending.insert(name.to_string(), outcome.clone());

        let table = Arc::clone(&self.pending);
        let slot = name.to_string();
        let settled = outcome.clone();
        tokio::spawn(async move {
            let _ = settled.wait().await;
            table
                .lock()
                .expect("handle pending table poisoned")
                .remove(&slot);
        });

        outcome
    }

    /// The in-flight outcome for `name`, if this lane has one.
    pub(crate) fn existing(&self, name: &str) -> Option<SharedOutcome<Bytes>> {
        self.pending
            .lock()
            .expect("handle pending table poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("handle pending table poisoned")
            .len()
    }

    /// Fire-and-forget abort; lanes without a matching pending request
    /// ignore it.
    pub(crate) fn abort(&self, name: &str) {
        let _ = self.requests.send(LaneRequest::AbortData {
            name: name.to_string(),
        });
    }

    /// Stop the lane task and cancel everything it has in flight.
    pub(crate) fn terminate(&self) {
        self.shutdown.cancel();
    }
}
