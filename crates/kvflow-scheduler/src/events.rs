//! Lifecycle event log with bounded fan-out.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::pool::{WorkerId, WorkerRole};

/// Number of events retained in the ring.
pub const EVENT_LOG_CAPACITY: usize = 1_000;

/// Default number of events returned by recency queries.
pub const DEFAULT_EVENT_LIMIT: usize = 50;

const BROADCAST_CAPACITY: usize = 1_024;

/// A lifecycle event with its emission timestamp.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SchedulerEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    RequestQueued {
        request_id: String,
    },
    PrefillStarted {
        request_id: String,
        worker_id: WorkerId,
    },
    PrefillCompleted {
        request_id: String,
        worker_id: WorkerId,
        latency_ms: u64,
    },
    TransferStarted {
        request_id: String,
        from: WorkerId,
        to: WorkerId,
    },
    TransferCompleted {
        request_id: String,
        duration_ms: u64,
    },
    DecodeStarted {
        request_id: String,
        worker_id: WorkerId,
    },
    DecodeCompleted {
        request_id: String,
        worker_id: WorkerId,
        latency_ms: u64,
    },
    RequestCompleted {
        request_id: String,
        total_latency_ms: u64,
    },
    RequestFailed {
        request_id: String,
        error: String,
    },
    WorkerOnline {
        worker_id: WorkerId,
        role: WorkerRole,
    },
    WorkerOffline {
        worker_id: WorkerId,
    },
}

impl EventKind {
    /// The wire tag of the event.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::PrefillStarted { .. } => "prefill_started",
            Self::PrefillCompleted { .. } => "prefill_completed",
            Self::TransferStarted { .. } => "transfer_started",
            Self::TransferCompleted { .. } => "transfer_completed",
            Self::DecodeStarted { .. } => "decode_started",
            Self::DecodeCompleted { .. } => "decode_completed",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::WorkerOnline { .. } => "worker_online",
            Self::WorkerOffline { .. } => "worker_offline",
        }
    }

    /// The request id the event concerns, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestQueued { request_id }
            | Self::PrefillStarted { request_id, .. }
            | Self::PrefillCompleted { request_id, .. }
            | Self::TransferStarted { request_id, .. }
            | Self::TransferCompleted { request_id, .. }
            | Self::DecodeStarted { request_id, .. }
            | Self::DecodeCompleted { request_id, .. }
            | Self::RequestCompleted { request_id, .. }
            | Self::RequestFailed { request_id, .. } => Some(request_id),
            Self::WorkerOnline { .. } | Self::WorkerOffline { .. } => None,
        }
    }
}

/// Bounded ring of recent events plus a broadcast channel for observers.
///
/// Emission never blocks: lagging subscribers miss events rather than stall
/// the pipeline.
#[derive(Debug)]
pub struct EventLog {
    ring: Mutex<VecDeque<SchedulerEvent>>,
    capacity: usize,
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventLog {
    /// Creates a log retaining the last `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    /// Records an event and notifies subscribers.
    pub fn emit(&self, kind: EventKind) {
        let event = SchedulerEvent {
            timestamp_ms: epoch_millis(),
            kind,
        };

        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    /// Returns the newest `limit` events in chronological order.
    pub fn recent(&self, limit: usize) -> Vec<SchedulerEvent> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Subscribes to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Returns true if no events have been recorded.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EVENT_LOG_CAPACITY)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.emit(EventKind::RequestQueued {
                request_id: format!("req-{i}"),
            });
        }

        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kind.request_id(), Some("req-2"));
        assert_eq!(recent[2].kind.request_id(), Some("req-4"));
    }

    #[test]
    fn recent_returns_newest_in_order() {
        let log = EventLog::new(10);
        for i in 0..4 {
            log.emit(EventKind::RequestQueued {
                request_id: format!("req-{i}"),
            });
        }

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind.request_id(), Some("req-2"));
        assert_eq!(recent[1].kind.request_id(), Some("req-3"));
    }

    #[test]
    fn events_serialise_with_snake_case_tags() {
        let log = EventLog::new(4);
        log.emit(EventKind::PrefillCompleted {
            request_id: "req-0".to_string(),
            worker_id: "p1".to_string(),
            latency_ms: 12,
        });

        let json = serde_json::to_value(&log.recent(1)[0]).unwrap();
        assert_eq!(json["kind"], "prefill_completed");
        assert_eq!(json["worker_id"], "p1");
        assert_eq!(json["latency_ms"], 12);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let log = EventLog::default();
        let mut rx = log.subscribe();

        log.emit(EventKind::WorkerOffline {
            worker_id: "p1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind.label(), "worker_offline");
    }
}
