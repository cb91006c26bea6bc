//! Connection status fan-out.
//!
//! One producer (the session) publishes [`ConnectionStatus`] values; any number of
//! observers subscribe. Each subscriber owns a bounded ring buffer. When a subscriber
//! falls behind, the oldest events are dropped and the subscriber receives a
//! [`StatusEvent::Gap`] before the next retained event, so a stalled observer can
//! never block the producer or grow memory without bound. Observers that keep pace
//! see every transition in order.

use sms_core::{ConnectionState, ConnectionStatus};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Item yielded by a [`StatusStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Status(ConnectionStatus),
    /// `missed` events were dropped because this subscriber fell behind.
    Gap { missed: u64 },
}

/// Error returned when a transition is not allowed by the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
pub struct ConnectionMonitor {
    events: broadcast::Sender<ConnectionStatus>,
    current: watch::Sender<ConnectionState>,
    // Serializes check-then-publish so observers see transitions in state order.
    state: Mutex<ConnectionState>,
}

impl ConnectionMonitor {
    /// `buffer` is the per-subscriber backlog before drop-oldest kicks in.
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        let (current, _) = watch::channel(ConnectionState::Idle);
        Self {
            events,
            current,
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock()
    }

    /// Every event published after this call, in order.
    pub fn subscribe(&self) -> StatusStream {
        StatusStream {
            rx: self.events.subscribe(),
        }
    }

    /// Latest-state view, used to gate readiness.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    /// Move to `status.state` and publish it.
    ///
    /// Invalid transitions are a bug in the caller: they assert in debug builds and
    /// are logged and dropped otherwise.
    pub fn transition(&self, status: ConnectionStatus) -> Result<(), InvalidTransition> {
        let mut state = self.lock();
        self.apply(&mut state, status)
    }

    /// Publish `status` only if the current state is `expected`.
    ///
    /// Returns false when another task already moved the session on.
    pub fn transition_from(&self, expected: ConnectionState, status: ConnectionStatus) -> bool {
        let mut state = self.lock();
        if *state != expected {
            return false;
        }
        self.apply(&mut state, status).is_ok()
    }

    fn apply(
        &self,
        state: &mut MutexGuard<'_, ConnectionState>,
        status: ConnectionStatus,
    ) -> Result<(), InvalidTransition> {
        let from = **state;
        let to = status.state;
        if !from.can_transition_to(to) {
            let err = InvalidTransition { from, to };
            error!(%from, %to, "Rejected lifecycle transition");
            debug_assert!(false, "{err}");
            return Err(err);
        }

        **state = to;
        match &status.error {
            Some(detail) => warn!(state = %to, error = %detail, "SMPP connection status"),
            None => info!(state = %to, "SMPP connection status"),
        }
        self.current.send_replace(to);
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(status);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered stream of status events for one subscriber.
#[derive(Debug)]
pub struct StatusStream {
    rx: broadcast::Receiver<ConnectionStatus>,
}

impl StatusStream {
    /// Next event, or `None` once the producer is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        match self.rx.recv().await {
            Ok(status) => Some(StatusEvent::Status(status)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Status subscriber fell behind");
                Some(StatusEvent::Gap { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next status, skipping gap markers.
    pub async fn next_status(&mut self) -> Option<ConnectionStatus> {
        loop {
            match self.recv().await? {
                StatusEvent::Status(status) => return Some(status),
                StatusEvent::Gap { .. } => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn status(state: ConnectionState) -> ConnectionStatus {
        ConnectionStatus::new(state)
    }

    #[tokio::test]
    async fn subscriber_sees_every_transition_in_order() {
        let monitor = ConnectionMonitor::new(16);
        let mut stream = monitor.subscribe();

        for s in [Connecting, Connected, Disconnected, Connecting, Connected, Closed] {
            monitor.transition(status(s)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(stream.next_status().await.unwrap().state);
        }
        assert_eq!(
            seen,
            vec![Connecting, Connected, Disconnected, Connecting, Connected, Closed]
        );
        assert_eq!(monitor.state(), Closed);
    }

    #[tokio::test]
    async fn subscribers_only_see_events_after_subscribing() {
        let monitor = ConnectionMonitor::new(16);
        monitor.transition(status(Connecting)).unwrap();

        let mut stream = monitor.subscribe();
        monitor.transition(status(Connected)).unwrap();

        assert_eq!(stream.next_status().await.unwrap().state, Connected);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap_marker_and_newest_events() {
        let monitor = ConnectionMonitor::new(2);
        let mut stream = monitor.subscribe();

        for s in [Connecting, Connected, Disconnected, Connecting, Connected] {
            monitor.transition(status(s)).unwrap();
        }

        assert_eq!(stream.recv().await, Some(StatusEvent::Gap { missed: 3 }));
        assert_eq!(stream.next_status().await.unwrap().state, Connecting);
        assert_eq!(stream.next_status().await.unwrap().state, Connected);
    }

    #[tokio::test]
    async fn transition_from_is_conditional() {
        let monitor = ConnectionMonitor::new(4);
        monitor.transition(status(Connecting)).unwrap();
        monitor.transition(status(Connected)).unwrap();

        assert!(monitor.transition_from(Connected, status(Disconnected)));
        assert!(!monitor.transition_from(Connected, status(Disconnected)));
        assert_eq!(monitor.state(), Disconnected);
    }

    #[tokio::test]
    async fn watch_tracks_latest_state() {
        let monitor = ConnectionMonitor::new(4);
        let mut rx = monitor.watch();
        assert_eq!(*rx.borrow(), Idle);

        monitor.transition(status(Connecting)).unwrap();
        monitor.transition(status(Connected)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connected);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invalid lifecycle transition"))]
    fn invalid_transition_is_loud() {
        let monitor = ConnectionMonitor::new(4);
        let result = monitor.transition(status(Connected));
        assert!(result.is_err());
        assert_eq!(monitor.state(), Idle);
    }

    #[tokio::test]
    async fn stream_ends_when_monitor_dropped() {
        let monitor = ConnectionMonitor::new(4);
        let mut stream = monitor.subscribe();
        drop(monitor);
        assert_eq!(stream.recv().await, None);
    }
}
