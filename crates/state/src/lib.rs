use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_SCHEMA_VERSION: i32 = 1;

const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Point-in-time view of one auction's on-chain state. `sequence` is the
/// version the source of truth assigned to this read; the store only accepts
/// a candidate whose sequence is strictly greater than what it already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub contract_address: String,
    pub bid_amount_wei: u128,
    pub bidder: Option<String>,
    pub end_ts_ms: i64,
    pub last_updated_ms: i64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetch timed out")]
    NetworkTimeout,
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// One completed fetch attempt, as handed to the reconciler.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub snapshot: Result<AuctionSnapshot, FetchError>,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Current state. Delivered once at subscribe time (possibly `None`) and
    /// again with `Some` on every accepted update.
    Snapshot(Option<AuctionSnapshot>),
    StaleReadIgnored {
        incoming: u64,
        current: u64,
    },
    FetchFailed(FetchError),
    ConnectivityDegraded {
        consecutive_failures: u32,
    },
    ConnectivityRestored,
}

/// The external source of truth. The sync core only consumes this signature;
/// `indexer` implements it over HTTP and `sim` replays scripts in tests.
#[async_trait]
pub trait AuctionFetcher: Send + Sync + 'static {
    async fn fetch_auction_state(
        &self,
        contract_address: &str,
    ) -> Result<AuctionSnapshot, FetchError>;
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Renders an integer wei amount as a decimal ETH string, e.g. "0.05".
pub fn format_eth(wei: u128) -> String {
    let whole = wei / WEI_PER_ETH;
    let frac = wei % WEI_PER_ETH;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:018}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

type SubscriberFn = Box<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, SubscriberFn)>,
}

#[derive(Default)]
struct StoreInner {
    current: RwLock<Option<AuctionSnapshot>>,
    subscribers: Mutex<Subscribers>,
}

/// Holds the latest accepted snapshot and fans accepted updates out to
/// subscribers. Reads never block on network activity; writes come from a
/// single reconciler task.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_current(&self) -> Option<AuctionSnapshot> {
        match self.inner.current.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    /// Accepts `candidate` iff its sequence is strictly greater than the
    /// stored one (an empty store accepts anything). Returns whether the
    /// swap happened; acceptance notifies subscribers synchronously.
    pub fn try_set(&self, candidate: AuctionSnapshot) -> bool {
        let accepted = {
            let mut guard = match self.inner.current.write() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            match guard.as_ref() {
                Some(current) if candidate.sequence <= current.sequence => None,
                _ => {
                    *guard = Some(candidate.clone());
                    Some(candidate)
                }
            }
        };
        match accepted {
            Some(snapshot) => {
                self.publish(SyncEvent::Snapshot(Some(snapshot)));
                true
            }
            None => false,
        }
    }

    /// Registers a callback and invokes it immediately with the current
    /// snapshot. Registration and the initial delivery happen under the
    /// registry lock, so an accepted update cannot interleave between them;
    /// callbacks must not subscribe or unsubscribe from within.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        callback(&SyncEvent::Snapshot(self.get_current()));
        subscribers.entries.push((id, Box::new(callback)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers an informational event to all subscribers. Snapshot
    /// acceptance goes through `try_set` instead.
    pub fn publish(&self, event: SyncEvent) {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, callback) in subscribers.entries.iter() {
            callback(&event);
        }
    }
}

pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl Subscription {
    /// Idempotent; calling it again (or after the store is gone) is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.store.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(sequence: u64, bid_amount_wei: u128) -> AuctionSnapshot {
        AuctionSnapshot {
            contract_address: "0x123".into(),
            bid_amount_wei,
            bidder: Some("0xabc".into()),
            end_ts_ms: 1_700_000_000_000,
            last_updated_ms: now_ms(),
            sequence,
        }
    }

    fn collecting_subscriber(
        store: &SnapshotStore,
    ) -> (Arc<Mutex<Vec<SyncEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = store.subscribe(move |event| {
            sink.lock().expect("event sink").push(event.clone());
        });
        (events, subscription)
    }

    #[test]
    fn empty_store_accepts_first_snapshot() {
        let store = SnapshotStore::new();
        assert_eq!(store.get_current(), None);
        assert!(store.try_set(snapshot(1, 50_000_000_000_000_000)));
        assert_eq!(store.get_current().expect("snapshot").sequence, 1);
    }

    #[test]
    fn duplicate_sequence_is_rejected_and_amount_unchanged() {
        let store = SnapshotStore::new();
        assert!(store.try_set(snapshot(1, 50_000_000_000_000_000)));
        assert!(!store.try_set(snapshot(1, 60_000_000_000_000_000)));
        let current = store.get_current().expect("snapshot");
        assert_eq!(current.bid_amount_wei, 50_000_000_000_000_000);
        assert_eq!(format_eth(current.bid_amount_wei), "0.05");
    }

    #[test]
    fn out_of_order_completions_settle_on_newest() {
        let store = SnapshotStore::new();
        assert!(store.try_set(snapshot(3, 300)));
        assert!(!store.try_set(snapshot(1, 100)));
        assert!(!store.try_set(snapshot(2, 200)));
        let current = store.get_current().expect("snapshot");
        assert_eq!(current.sequence, 3);
        assert_eq!(current.bid_amount_wei, 300);
    }

    #[test]
    fn sequence_is_monotonically_non_decreasing() {
        let store = SnapshotStore::new();
        let mut last_seen = 0;
        for sequence in [5u64, 3, 9, 9, 1, 12, 2, 12] {
            store.try_set(snapshot(sequence, u128::from(sequence)));
            let current = store.get_current().expect("snapshot").sequence;
            assert!(current >= last_seen);
            last_seen = current;
        }
        assert_eq!(last_seen, 12);
    }

    #[test]
    fn subscriber_receives_immediate_state_then_updates() {
        let store = SnapshotStore::new();
        let (events, _subscription) = collecting_subscriber(&store);

        assert_eq!(
            events.lock().expect("events").as_slice(),
            &[SyncEvent::Snapshot(None)]
        );

        let accepted = snapshot(1, 50_000_000_000_000_000);
        assert!(store.try_set(accepted.clone()));
        assert_eq!(
            events.lock().expect("events").last(),
            Some(&SyncEvent::Snapshot(Some(accepted)))
        );
    }

    #[test]
    fn subscriber_on_populated_store_sees_current_snapshot_first() {
        let store = SnapshotStore::new();
        let seeded = snapshot(7, 700);
        assert!(store.try_set(seeded.clone()));

        let (events, _subscription) = collecting_subscriber(&store);
        assert_eq!(
            events.lock().expect("events").as_slice(),
            &[SyncEvent::Snapshot(Some(seeded))]
        );
    }

    #[test]
    fn rejected_snapshot_does_not_notify() {
        let store = SnapshotStore::new();
        assert!(store.try_set(snapshot(2, 200)));
        let (events, _subscription) = collecting_subscriber(&store);

        assert!(!store.try_set(snapshot(1, 100)));
        assert!(!store.try_set(snapshot(2, 250)));
        // Only the initial delivery; rejections are silent at the store level.
        assert_eq!(events.lock().expect("events").len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let store = SnapshotStore::new();
        let (events, subscription) = collecting_subscriber(&store);
        subscription.unsubscribe();
        subscription.unsubscribe();

        assert!(store.try_set(snapshot(1, 100)));
        assert_eq!(events.lock().expect("events").len(), 1);
    }

    #[test]
    fn publish_reaches_all_subscribers() {
        let store = SnapshotStore::new();
        let (first, _keep_first) = collecting_subscriber(&store);
        let (second, _keep_second) = collecting_subscriber(&store);

        store.publish(SyncEvent::ConnectivityDegraded {
            consecutive_failures: 5,
        });
        for events in [first, second] {
            assert_eq!(
                events.lock().expect("events").last(),
                Some(&SyncEvent::ConnectivityDegraded {
                    consecutive_failures: 5
                })
            );
        }
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let original = snapshot(42, 1_234_567_890_123_456_789);
        let encoded = serde_json::to_string(&original).expect("encode");
        let decoded: AuctionSnapshot = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn format_eth_renders_decimal_amounts() {
        assert_eq!(format_eth(0), "0");
        assert_eq!(format_eth(WEI_PER_ETH), "1");
        assert_eq!(format_eth(50_000_000_000_000_000), "0.05");
        assert_eq!(format_eth(1_234), "0.000000000000001234");
        assert_eq!(format_eth(2 * WEI_PER_ETH + WEI_PER_ETH / 2), "2.5");
    }
}
