//! Operator channel event router.
//!
//! One full-duplex operator stream at a time. Outbound messages are
//! serialised through a bounded per-connection queue drained by a single
//! writer; a slow operator client must not stall capture, so when the
//! queue fills the oldest non-prompt message is shed. Prompts are never
//! shed: if a prompt cannot be enqueued the caller auto-forwards the
//! exchange instead.

use crate::events::OutboundMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 512;

struct RouterState {
    queue: VecDeque<OutboundMessage>,
    connected: bool,
}

/// Single-connection outbound queue with prompt-priority shedding. A newer
/// connection supplants the previous one; epochs let a superseded writer
/// task notice it lost the connection.
pub struct OperatorRouter {
    state: Mutex<RouterState>,
    notify: Notify,
    capacity: usize,
    epoch: AtomicU64,
}

impl OperatorRouter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RouterState {
                queue: VecDeque::new(),
                connected: false,
            }),
            notify: Notify::new(),
            capacity,
            epoch: AtomicU64::new(0),
        }
    }

    /// Register the operator connection, supplanting any previous one.
    /// Returns the connection epoch the writer task must present to
    /// `next()`.
    pub fn connect(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.clear();
        state.connected = true;
        // Wake a superseded writer so it observes the stale epoch and exits.
        self.notify.notify_waiters();
        epoch
    }

    /// Tear down the connection if `epoch` is still current. A stale
    /// disconnect (from a supplanted connection's cleanup) is ignored.
    pub fn disconnect(&self, epoch: u64) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.connected = false;
        state.queue.clear();
        self.notify.notify_waiters();
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connected
    }

    /// Enqueue an outbound message. Returns `false` when the message could
    /// not be queued for delivery: no connection, or a queue full of
    /// prompts. Callers only need the result for prompts; shed captures
    /// are an accepted loss.
    pub fn publish(&self, msg: OutboundMessage) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.connected {
            return false;
        }

        if state.queue.len() >= self.capacity {
            // Shed the oldest non-prompt event to make room.
            match state.queue.iter().position(|m| !m.is_prompt()) {
                Some(idx) => {
                    state.queue.remove(idx);
                    debug!("Outbound queue full, shed one capture event");
                }
                None => {
                    // Queue saturated with prompts. Refuse rather than lose
                    // one that is already promised to the operator.
                    warn!("Outbound queue saturated with prompts, message refused");
                    return false;
                }
            }
        }

        state.queue.push_back(msg);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Pull the next outbound message for the writer task. Returns `None`
    /// once the connection identified by `epoch` is closed or supplanted.
    pub async fn next(&self, epoch: u64) -> Option<OutboundMessage> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if self.epoch.load(Ordering::SeqCst) != epoch || !state.connected {
                    return None;
                }
                if let Some(msg) = state.queue.pop_front() {
                    return Some(msg);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Messages waiting for the writer. Test and diagnostics hook.
    pub fn depth(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }
}

impl Default for OperatorRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Ack, ExchangeEvent, Notice};
    use crate::exchange::{Exchange, HeaderList};

    fn capture(n: u64) -> OutboundMessage {
        let ex = Exchange::new(
            format!("id-{n}"),
            n,
            String::new(),
            "GET".into(),
            "https://a.test/".into(),
            HeaderList::new(),
            Vec::new(),
            "document".into(),
        );
        OutboundMessage::Capture(ExchangeEvent::request(&ex, false))
    }

    fn prompt(n: u64) -> OutboundMessage {
        let ex = Exchange::new(
            format!("id-{n}"),
            n,
            String::new(),
            "GET".into(),
            "https://a.test/".into(),
            HeaderList::new(),
            Vec::new(),
            "document".into(),
        );
        OutboundMessage::Intercept(ExchangeEvent::request(&ex, true))
    }

    #[tokio::test]
    async fn publish_without_connection_reports_undelivered() {
        let router = OperatorRouter::new();
        assert!(!router.publish(capture(1)));
        assert!(!router.publish(prompt(1)));
    }

    #[tokio::test]
    async fn messages_drain_in_order() {
        let router = OperatorRouter::new();
        let epoch = router.connect();
        assert!(router.publish(capture(1)));
        assert!(router.publish(capture(2)));

        for want in ["id-1", "id-2"] {
            match router.next(epoch).await {
                Some(OutboundMessage::Capture(ExchangeEvent::Request { id, .. })) => {
                    assert_eq!(id, want)
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(router.depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_sheds_oldest_capture_but_keeps_prompts() {
        let router = OperatorRouter::with_capacity(3);
        let epoch = router.connect();
        assert!(router.publish(capture(1)));
        assert!(router.publish(prompt(2)));
        assert!(router.publish(capture(3)));
        // Queue full: capture(1) is shed to admit the prompt.
        assert!(router.publish(prompt(4)));

        let mut ids = Vec::new();
        for _ in 0..3 {
            match router.next(epoch).await.unwrap() {
                OutboundMessage::Capture(ExchangeEvent::Request { id, .. })
                | OutboundMessage::Intercept(ExchangeEvent::Request { id, .. }) => ids.push(id),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(ids, ["id-2", "id-3", "id-4"]);
    }

    #[tokio::test]
    async fn prompt_saturated_queue_refuses_new_prompt() {
        let router = OperatorRouter::with_capacity(2);
        router.connect();
        assert!(router.publish(prompt(1)));
        assert!(router.publish(prompt(2)));
        assert!(!router.publish(prompt(3)));
        // Non-prompt traffic is likewise refused, silently droppable.
        assert!(!router.publish(OutboundMessage::Ack(Ack::ok("forward"))));
    }

    #[tokio::test]
    async fn new_connection_supplants_old_writer() {
        let router = std::sync::Arc::new(OperatorRouter::new());
        let old_epoch = router.connect();

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.next(old_epoch).await })
        };

        let new_epoch = router.connect();
        assert!(waiter.await.unwrap().is_none());

        router.publish(OutboundMessage::Notice(Notice::new("degraded", "x")));
        assert!(router.next(new_epoch).await.is_some());
    }

    #[tokio::test]
    async fn stale_disconnect_is_ignored() {
        let router = OperatorRouter::new();
        let old_epoch = router.connect();
        let _new_epoch = router.connect();
        assert!(!router.disconnect(old_epoch));
        assert!(router.is_connected());
    }
}
