//! Update Publisher: fans registry deltas out to subscribers.
//!
//! Subscribers receive `MonitorEvent`s over a plain channel and hydrate from
//! `SessionMonitor::snapshot()`. Upserts are keyed by log path, so applying one
//! twice is harmless; `SessionList` implements that merge for consumers.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::session::Session;

/// Event pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// One session changed.
    SessionUpserted(Session),
    /// Full replacement after startup or a gap in event delivery.
    SessionsRefreshed(Vec<Session>),
    IndexProgress(IndexProgress),
    /// The directory watch keeps failing to attach.
    WatchFailed(WatchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    pub phase: String,
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFailure {
    pub root: PathBuf,
    pub attempts: u32,
    pub reason: String,
}

impl MonitorEvent {
    pub fn progress(phase: &str, current: usize, total: usize) -> Self {
        MonitorEvent::IndexProgress(IndexProgress {
            phase: phase.to_string(),
            current,
            total,
        })
    }

    /// Event name as seen on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::SessionUpserted(_) => "session_upserted",
            MonitorEvent::SessionsRefreshed(_) => "sessions_refreshed",
            MonitorEvent::IndexProgress(_) => "index_progress",
            MonitorEvent::WatchFailed(_) => "watch_failed",
        }
    }
}

pub type SubscriptionId = u64;

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: Receiver<MonitorEvent>,
}

#[derive(Default)]
pub struct Publisher {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Sender<MonitorEvent>)>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push((id, tx)),
            Err(poisoned) => poisoned.into_inner().push((id, tx)),
        }
        Subscription { id, receiver: rx }
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Deliver to every live subscriber, dropping those that hung up.
    pub fn publish(&self, event: MonitorEvent) {
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|(id, tx)| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                tracing::debug!(subscriber = id, "pruning disconnected subscriber");
            }
            delivered
        });
    }

    pub fn publish_upsert(&self, session: Session) {
        self.publish(MonitorEvent::SessionUpserted(session));
    }

    pub fn publish_refresh(&self, sessions: Vec<Session>) {
        self.publish(MonitorEvent::SessionsRefreshed(sessions));
    }

    pub fn publish_progress(&self, phase: &str, current: usize, total: usize) {
        self.publish(MonitorEvent::progress(phase, current, total));
    }
}

fn same_session(a: &Session, b: &Session) -> bool {
    if a.id.is_empty() || b.id.is_empty() {
        a.log_path == b.log_path
    } else {
        a.id == b.id
    }
}

/// Consumer-side session list kept in sync by applying events in order.
#[derive(Debug, Clone, Default)]
pub struct SessionList {
    sessions: Vec<Session>,
}

impl SessionList {
    pub fn new(snapshot: Vec<Session>) -> Self {
        Self { sessions: snapshot }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Merge one event. Returns whether the list changed.
    ///
    /// Upserts replace the entry with the same session id, or the same log
    /// path when either id is unknown.
    pub fn apply(&mut self, event: &MonitorEvent) -> bool {
        match event {
            MonitorEvent::SessionUpserted(session) => {
                match self.sessions.iter_mut().find(|s| same_session(s, session)) {
                    Some(existing) if existing == session => false,
                    Some(existing) => {
                        *existing = session.clone();
                        true
                    }
                    None => {
                        self.sessions.push(session.clone());
                        true
                    }
                }
            }
            MonitorEvent::SessionsRefreshed(sessions) => {
                self.sessions = sessions.clone();
                true
            }
            MonitorEvent::IndexProgress(_) | MonitorEvent::WatchFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn session(name: &str) -> Session {
        Session::new(Path::new(&format!("/root/-home-dev-app/{}.jsonl", name)))
    }

    // =============================================================================
    // Subscription Tests
    // =============================================================================

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let publisher = Publisher::new();
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        assert_ne!(a.id, b.id);

        publisher.publish_progress("indexing", 1, 2);
        assert_eq!(a.receiver.try_recv().unwrap().name(), "index_progress");
        assert_eq!(b.receiver.try_recv().unwrap().name(), "index_progress");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let publisher = Publisher::new();
        let sub = publisher.subscribe();
        assert!(publisher.unsubscribe(sub.id));
        assert!(!publisher.unsubscribe(sub.id));
        publisher.publish_refresh(Vec::new());
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let publisher = Publisher::new();
        let kept = publisher.subscribe();
        drop(publisher.subscribe());
        assert_eq!(publisher.subscriber_count(), 2);
        publisher.publish_upsert(session("a"));
        assert_eq!(publisher.subscriber_count(), 1);
        assert!(kept.receiver.try_recv().is_ok());
    }

    // =============================================================================
    // Wire Format Tests
    // =============================================================================

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(MonitorEvent::progress("discovering", 3, 10)).unwrap();
        assert_eq!(json["event"], "index_progress");
        assert_eq!(json["payload"]["phase"], "discovering");
        assert_eq!(json["payload"]["current"], 3);

        let json = serde_json::to_value(MonitorEvent::SessionUpserted(session("x"))).unwrap();
        assert_eq!(json["event"], "session_upserted");
        assert_eq!(json["payload"]["id"], "x");
        assert_eq!(json["payload"]["status"]["kind"], "unknown");

        let json = serde_json::to_value(MonitorEvent::WatchFailed(WatchFailure {
            root: PathBuf::from("/p"),
            attempts: 5,
            reason: "denied".to_string(),
        }))
        .unwrap();
        assert_eq!(json["event"], "watch_failed");
        assert_eq!(json["payload"]["attempts"], 5);
    }

    // =============================================================================
    // SessionList Tests
    // =============================================================================

    #[test]
    fn test_session_list_upsert_is_idempotent() {
        let mut list = SessionList::default();
        let first = session("a");
        assert!(list.apply(&MonitorEvent::SessionUpserted(first.clone())));
        assert!(!list.apply(&MonitorEvent::SessionUpserted(first.clone())));
        assert_eq!(list.sessions().len(), 1);

        let mut updated = first;
        updated.message_count = 4;
        assert!(list.apply(&MonitorEvent::SessionUpserted(updated)));
        assert_eq!(list.sessions().len(), 1);
        assert_eq!(list.sessions()[0].message_count, 4);

        assert!(list.apply(&MonitorEvent::SessionUpserted(session("b"))));
        assert_eq!(list.sessions().len(), 2);
    }

    #[test]
    fn test_session_list_merges_by_session_id() {
        let mut list = SessionList::default();
        let mut first = session("a");
        first.id = "shared".to_string();
        let mut moved = session("b");
        moved.id = "shared".to_string();
        moved.message_count = 2;

        assert!(list.apply(&MonitorEvent::SessionUpserted(first)));
        assert!(list.apply(&MonitorEvent::SessionUpserted(moved.clone())));
        assert_eq!(list.sessions(), &[moved]);

        // No id yet: fall back to the log path
        let mut anonymous = session("c");
        anonymous.id.clear();
        assert!(list.apply(&MonitorEvent::SessionUpserted(anonymous.clone())));
        anonymous.message_count = 1;
        assert!(list.apply(&MonitorEvent::SessionUpserted(anonymous)));
        assert_eq!(list.sessions().len(), 2);
    }

    #[test]
    fn test_session_list_refresh_replaces() {
        let mut list = SessionList::new(vec![session("a"), session("b")]);
        list.apply(&MonitorEvent::SessionsRefreshed(vec![session("c")]));
        assert_eq!(list.sessions().len(), 1);
        assert_eq!(list.sessions()[0].id, "c");
        assert!(!list.apply(&MonitorEvent::progress("indexing", 0, 0)));
    }
}
