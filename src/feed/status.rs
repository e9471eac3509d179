//! Ingestion connection state and counters.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    Simulating,
    Stopped,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Disconnected => "DISCONNECTED",
            FeedState::Connecting => "CONNECTING",
            FeedState::Subscribed => "SUBSCRIBED",
            FeedState::Simulating => "SIMULATING",
            FeedState::Stopped => "STOPPED",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            FeedState::Disconnected => 0,
            FeedState::Connecting => 1,
            FeedState::Subscribed => 2,
            FeedState::Simulating => 3,
            FeedState::Stopped => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => FeedState::Connecting,
            2 => FeedState::Subscribed,
            3 => FeedState::Simulating,
            4 => FeedState::Stopped,
            _ => FeedState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    Connect,
    Opened,
    Closed,
    Simulate,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: FeedState,
    pub event: FeedEvent,
}

/// Legal moves of the ingestion client. `Stop` is accepted from anywhere.
pub fn next_state(state: FeedState, event: FeedEvent) -> Result<FeedState, TransitionError> {
    match (state, event) {
        (_, FeedEvent::Stop) => Ok(FeedState::Stopped),
        (FeedState::Stopped, _) => Err(TransitionError { from: state, event }),
        (FeedState::Disconnected, FeedEvent::Connect) => Ok(FeedState::Connecting),
        (FeedState::Disconnected, FeedEvent::Simulate) => Ok(FeedState::Simulating),
        (FeedState::Connecting, FeedEvent::Opened) => Ok(FeedState::Subscribed),
        (FeedState::Connecting, FeedEvent::Closed) => Ok(FeedState::Disconnected),
        (FeedState::Subscribed, FeedEvent::Closed) => Ok(FeedState::Disconnected),
        _ => Err(TransitionError { from: state, event }),
    }
}

/// Shared, lock-free view of the ingestion client. Written by the client,
/// read by the query surface.
#[derive(Debug)]
pub struct FeedStatus {
    state: AtomicU8,
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
    secondary_accepted: AtomicU64,
    secondary_rejected: AtomicU64,
    last_frame_ms: AtomicI64,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(FeedState::Disconnected.to_u8()),
            frames_received: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            secondary_accepted: AtomicU64::new(0),
            secondary_rejected: AtomicU64::new(0),
            last_frame_ms: AtomicI64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedState,
    pub connected: bool,
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub secondary_accepted: u64,
    pub secondary_rejected: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Applies `event` and returns the `(from, to)` pair, or the rejected move.
    pub fn apply(&self, event: FeedEvent) -> Result<(FeedState, FeedState), TransitionError> {
        let from = self.state();
        let to = next_state(from, event)?;
        self.state.store(to.to_u8(), Ordering::Release);
        Ok((from, to))
    }

    pub fn connected(&self) -> bool {
        matches!(self.state(), FeedState::Subscribed | FeedState::Simulating)
    }

    pub fn frame_received(&self, at: DateTime<Utc>) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_frame_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn secondary_accepted(&self) {
        self.secondary_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn secondary_rejected(&self) {
        self.secondary_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedStatusSnapshot {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        FeedStatusSnapshot {
            state: self.state(),
            connected: self.connected(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            secondary_accepted: self.secondary_accepted.load(Ordering::Relaxed),
            secondary_rejected: self.secondary_rejected.load(Ordering::Relaxed),
            last_frame_at: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_cycle() {
        let s = FeedStatus::new();
        assert!(!s.connected());
        s.apply(FeedEvent::Connect).unwrap();
        assert!(!s.connected());
        assert_eq!(
            s.apply(FeedEvent::Opened).unwrap(),
            (FeedState::Connecting, FeedState::Subscribed)
        );
        assert!(s.connected());
        s.apply(FeedEvent::Closed).unwrap();
        assert_eq!(s.state(), FeedState::Disconnected);
        s.apply(FeedEvent::Connect).unwrap();
    }

    #[test]
    fn test_simulation_only_from_disconnected() {
        assert_eq!(
            next_state(FeedState::Disconnected, FeedEvent::Simulate),
            Ok(FeedState::Simulating)
        );
        assert!(next_state(FeedState::Subscribed, FeedEvent::Simulate).is_err());
        assert!(next_state(FeedState::Simulating, FeedEvent::Connect).is_err());
    }

    #[test]
    fn test_stop_is_terminal() {
        assert_eq!(next_state(FeedState::Subscribed, FeedEvent::Stop), Ok(FeedState::Stopped));
        assert!(next_state(FeedState::Stopped, FeedEvent::Connect).is_err());
    }
}
