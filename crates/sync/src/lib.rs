use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use state::{now_ms, AuctionFetcher, FetchError, FetchResult, SnapshotStore, SyncEvent};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub contract_address: String,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub degraded_threshold: u32,
}

impl SyncConfig {
    pub fn new(contract_address: impl Into<String>) -> Self {
        Self {
            contract_address: contract_address.into(),
            poll_interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            degraded_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Running,
    Paused,
}

/// Lets the admin plane suspend polling without tearing the task down.
#[derive(Clone, Default)]
pub struct SyncGate {
    state: Arc<RwLock<SyncState>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if let Ok(mut guard) = self.state.write() {
            *guard = SyncState::Paused;
        }
    }

    pub fn resume(&self) {
        if let Ok(mut guard) = self.state.write() {
            *guard = SyncState::Running;
        }
    }

    pub fn status(&self) -> SyncState {
        self.state.read().map(|guard| *guard).unwrap_or(SyncState::Paused)
    }
}

/// Exponential retry delay: base doubles per attempt up to the cap, with
/// ±20% jitter applied on top.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(15);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        jittered(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

/// Applies fetch results to the store. Failed reads never touch the store;
/// stale reads are reported and dropped. Retry policy lives in the scheduler.
pub struct Reconciler {
    store: SnapshotStore,
}

impl Reconciler {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    pub fn reconcile(&self, result: FetchResult) {
        match result.snapshot {
            Ok(snapshot) => {
                let incoming = snapshot.sequence;
                if self.store.try_set(snapshot) {
                    debug!(sequence = incoming, "snapshot accepted");
                } else {
                    let current = self
                        .store
                        .get_current()
                        .map(|snapshot| snapshot.sequence)
                        .unwrap_or(0);
                    debug!(incoming, current, "stale read ignored");
                    self.store
                        .publish(SyncEvent::StaleReadIgnored { incoming, current });
                }
            }
            Err(error) => {
                warn!(error = %error, "fetch failed");
                self.store.publish(SyncEvent::FetchFailed(error));
            }
        }
    }
}

pub struct FetchScheduler;

impl FetchScheduler {
    /// Spawns the polling loop. The first fetch happens immediately; after
    /// that the loop ticks on the poll interval, switching to backoff delays
    /// while fetches are failing.
    pub fn spawn(
        config: SyncConfig,
        fetcher: Arc<dyn AuctionFetcher>,
        store: SnapshotStore,
    ) -> SchedulerHandle {
        let refresh = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = SyncGate::new();
        let task = tokio::spawn(run_loop(
            config,
            fetcher,
            store,
            refresh.clone(),
            shutdown_rx,
            gate.clone(),
        ));
        SchedulerHandle {
            refresh,
            gate,
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerControls {
    refresh: Arc<Notify>,
    gate: SyncGate,
}

impl SchedulerControls {
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn sync_state(&self) -> SyncState {
        self.gate.status()
    }
}

pub struct SchedulerHandle {
    refresh: Arc<Notify>,
    gate: SyncGate,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn controls(&self) -> SchedulerControls {
        SchedulerControls {
            refresh: self.refresh.clone(),
            gate: self.gate.clone(),
        }
    }

    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run_loop(
    config: SyncConfig,
    fetcher: Arc<dyn AuctionFetcher>,
    store: SnapshotStore,
    refresh: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    gate: SyncGate,
) {
    let reconciler = Reconciler::new(store.clone());
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut consecutive_failures: u32 = 0;
    let mut next_wait = Duration::ZERO;
    info!(contract = %config.contract_address, "fetch scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(next_wait) => {}
            _ = refresh.notified() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        if gate.status() == SyncState::Paused {
            next_wait = config.poll_interval;
            continue;
        }

        let fetch = time::timeout(
            config.fetch_timeout,
            fetcher.fetch_auction_state(&config.contract_address),
        );
        let outcome = tokio::select! {
            // Shutdown abandons the in-flight request; its result is discarded.
            _ = shutdown.changed() => break,
            outcome = fetch => match outcome {
                Ok(result) => result,
                Err(_) => Err(FetchError::NetworkTimeout),
            },
        };
        let fetched_at_ms = now_ms();

        match outcome {
            Ok(snapshot) => {
                if consecutive_failures >= config.degraded_threshold {
                    info!("connectivity restored");
                    store.publish(SyncEvent::ConnectivityRestored);
                }
                consecutive_failures = 0;
                backoff.reset();
                reconciler.reconcile(FetchResult {
                    snapshot: Ok(snapshot),
                    fetched_at_ms,
                });
                next_wait = config.poll_interval;
            }
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                reconciler.reconcile(FetchResult {
                    snapshot: Err(error),
                    fetched_at_ms,
                });
                if consecutive_failures == config.degraded_threshold {
                    warn!(consecutive_failures, "connectivity degraded");
                    store.publish(SyncEvent::ConnectivityDegraded {
                        consecutive_failures,
                    });
                }
                next_wait = backoff.next_delay();
            }
        }
    }

    info!("fetch scheduler stopped");
}
