//! Fan-out to overlay subscribers. The hub lives inside the orchestrator
//! task and never blocks it: every subscriber gets a bounded outbound queue
//! that is fed with `try_send`.
//!
//! Advisory traffic (`update`, `timer_update`) is simply dropped when a
//! queue is full, that is the coalescing the contract allows. Messages that
//! must not be lost (`phase_change`, `fight_ended`, `game_reset`, the
//! initial snapshot) instead disconnect a subscriber that cannot keep up;
//! it reconnects through the snapshot path and is consistent again.

use protocol::ServerEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Outbound queue length per subscriber.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 64;

#[derive(Default)]
pub struct Hub {
    subscribers: HashMap<u64, mpsc::Sender<ServerEvent>>,
}

/// True for events the contract allows us to coalesce away under pressure.
fn droppable(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Update { .. } | ServerEvent::TimerUpdate { .. })
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    pub fn attach(&mut self, id: u64, tx: mpsc::Sender<ServerEvent>) {
        self.subscribers.insert(id, tx);
    }

    pub fn detach(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Delivers to a single subscriber with must-deliver semantics.
    pub fn send_to(&mut self, id: u64, event: ServerEvent) {
        let Some(tx) = self.subscribers.get(&id) else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "subscriber queue full, dropping connection");
                self.subscribers.remove(&id);
            }
            Err(TrySendError::Closed(_)) => {
                self.subscribers.remove(&id);
            }
        }
    }

    /// Fans an event out to every subscriber, in subscriber-queue order.
    pub fn broadcast(&mut self, event: &ServerEvent) {
        let advisory = droppable(event);
        let mut dead = Vec::new();
        for (id, tx) in &self.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) if advisory => {
                    // Coalesced away; the next update carries fresher state.
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "subscriber too slow, dropping connection");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::GamePhase;

    fn timer_event() -> ServerEvent {
        ServerEvent::TimerUpdate { phase: GamePhase::Fighting, time_remaining_ms: 1000 }
    }

    fn reset_event() -> ServerEvent {
        ServerEvent::GameReset
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let mut hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.attach(1, tx_a);
        hub.attach(2, tx_b);

        hub.broadcast(&reset_event());
        assert!(matches!(rx_a.try_recv().unwrap(), ServerEvent::GameReset));
        assert!(matches!(rx_b.try_recv().unwrap(), ServerEvent::GameReset));
    }

    #[test]
    fn advisory_overflow_is_dropped_but_keeps_the_subscriber() {
        let mut hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        hub.attach(1, tx);

        hub.broadcast(&timer_event());
        hub.broadcast(&timer_event()); // queue full, silently coalesced
        assert_eq!(hub.count(), 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn critical_overflow_disconnects_the_subscriber() {
        let mut hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.attach(1, tx);

        hub.broadcast(&timer_event());
        hub.broadcast(&reset_event()); // must-deliver, queue is full
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let mut hub = Hub::new();
        let (tx, rx) = mpsc::channel(1);
        hub.attach(1, tx);
        drop(rx);

        hub.broadcast(&reset_event());
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn send_to_targets_only_the_addressee() {
        let mut hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.attach(1, tx_a);
        hub.attach(2, tx_b);

        hub.send_to(
            2,
            ServerEvent::AdminError { message: "invalid admin credentials".to_string() },
        );
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv().unwrap(), ServerEvent::AdminError { .. }));
    }
}
