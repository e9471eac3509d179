//! Fan-out of pipeline events to live subscribers and the persistence sink.
//!
//! Each subscriber owns a bounded queue. `publish` never waits: a full
//! queue loses its oldest pending event, and the event itself is shared
//! across queues behind one `Arc`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::logging::{self, obj, v_str, Domain, Level};
use crate::model::{Alert, Deviation, FusedPosition, IdentityObservation, PositionObservation, VesselId};
use crate::storage::{FindingRow, PositionRow, SinkHandle, SinkRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VesselUpdate {
    Fused(FusedPosition),
    Raw {
        observation: PositionObservation,
        identity: Option<IdentityObservation>,
    },
}

impl VesselUpdate {
    pub fn vessel_id(&self) -> VesselId {
        match self {
            VesselUpdate::Fused(f) => f.vessel_id,
            VesselUpdate::Raw { observation, .. } => observation.vessel_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    pub vessels: usize,
    pub feed_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    #[serde(rename = "vessel:update")]
    VesselUpdated(VesselUpdate),
    #[serde(rename = "alert:new")]
    AlertRaised(Alert),
    #[serde(rename = "deviation:new")]
    DeviationFound(Deviation),
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::VesselUpdated(_) => "vessel:update",
            PipelineEvent::AlertRaised(_) => "alert:new",
            PipelineEvent::DeviationFound(_) => "deviation:new",
            PipelineEvent::Heartbeat(_) => "heartbeat",
        }
    }

    fn sink_record(&self) -> Option<SinkRecord> {
        match self {
            PipelineEvent::VesselUpdated(u) => Some(SinkRecord::Position(PositionRow::from(u))),
            PipelineEvent::AlertRaised(a) => Some(SinkRecord::Finding(FindingRow::from(a))),
            PipelineEvent::DeviationFound(d) => Some(SinkRecord::Finding(FindingRow::from(d))),
            PipelineEvent::Heartbeat(_) => None,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct QueueState {
    buf: VecDeque<Arc<PipelineEvent>>,
    closed: bool,
}

#[derive(Debug)]
struct SubscriberQueue {
    id: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
    detached: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: Arc<PipelineEvent>) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.buf.len() >= self.capacity {
                state.buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.buf.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

/// Receiving end for one subscriber. Dropping it unregisters the subscriber
/// on the next publish.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.queue.id
    }

    /// Next event, or `None` once the publisher closed and the queue is empty.
    pub async fn recv(&self) -> Option<Arc<PipelineEvent>> {
        loop {
            {
                let mut state = lock(&self.queue.state);
                if let Some(event) = state.buf.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<PipelineEvent>> {
        lock(&self.queue.state).buf.pop_front()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue.state).buf.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Relaxed);
    }
}

pub struct Publisher {
    capacity: usize,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    sink: Option<SinkHandle>,
    published: AtomicU64,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(capacity: usize, sink: Option<SinkHandle>) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            sink,
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, id: &str) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: id.to_string(),
            capacity: self.capacity,
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                closed: self.closed.load(Ordering::Acquire),
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });
        lock(&self.subscribers).push(Arc::clone(&queue));
        logging::log(
            Level::Info,
            Domain::Publish,
            "subscriber_added",
            obj(&[("subscriber", v_str(id))]),
        );
        Subscription { queue }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|q| !q.detached.load(Ordering::Relaxed))
            .count()
    }

    pub fn publish(&self, event: PipelineEvent) {
        if let Some(sink) = &self.sink {
            if let Some(record) = event.sink_record() {
                sink.offer(record);
            }
        }

        let event = Arc::new(event);
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|q| {
            if q.detached.load(Ordering::Relaxed) {
                logging::log(
                    Level::Info,
                    Domain::Publish,
                    "subscriber_removed",
                    obj(&[("subscriber", v_str(&q.id))]),
                );
                return false;
            }
            q.push(Arc::clone(&event));
            true
        });
    }

    /// Identity merges only go to persistence; subscribers see identities
    /// through raw vessel updates.
    pub fn persist_identity(&self, identity: &IdentityObservation) {
        if let Some(sink) = &self.sink {
            sink.offer(SinkRecord::Identity(identity.clone()));
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn sink_dropped(&self) -> u64 {
        self.sink.as_ref().map_or(0, |s| s.dropped())
    }

    /// Wakes every subscriber; they drain what is queued, then see `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for q in lock(&self.subscribers).drain(..) {
            q.close();
        }
    }
}
