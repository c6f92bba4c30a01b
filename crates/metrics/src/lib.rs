use std::net::SocketAddr;

use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use state::SyncEvent;
use tracing::info;

/// Sync-health metrics plus the text-format exporter.
#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    pub fetch_success: IntCounter,
    pub fetch_failure: IntCounter,
    pub stale_reads: IntCounter,
    pub last_sequence: IntGauge,
    pub degraded: IntGauge,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let fetch_success = IntCounter::new(
            "auction_fetch_success_total",
            "Auction state fetches that produced a usable snapshot",
        )?;
        let fetch_failure = IntCounter::new(
            "auction_fetch_failure_total",
            "Auction state fetches that failed or timed out",
        )?;
        let stale_reads = IntCounter::new(
            "auction_stale_reads_total",
            "Fetched snapshots rejected for carrying an old sequence",
        )?;
        let last_sequence = IntGauge::new(
            "auction_last_sequence",
            "Sequence number of the last accepted snapshot",
        )?;
        let degraded = IntGauge::new(
            "auction_connectivity_degraded",
            "1 while fetches keep failing past the degraded threshold",
        )?;
        registry.register(Box::new(fetch_success.clone()))?;
        registry.register(Box::new(fetch_failure.clone()))?;
        registry.register(Box::new(stale_reads.clone()))?;
        registry.register(Box::new(last_sequence.clone()))?;
        registry.register(Box::new(degraded.clone()))?;
        Ok(Self {
            registry,
            fetch_success,
            fetch_failure,
            stale_reads,
            last_sequence,
            degraded,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Snapshot(Some(snapshot)) => {
                self.fetch_success.inc();
                self.last_sequence.set(snapshot.sequence as i64);
            }
            SyncEvent::Snapshot(None) => {}
            SyncEvent::StaleReadIgnored { .. } => {
                // A stale read is still a completed fetch.
                self.fetch_success.inc();
                self.stale_reads.inc();
            }
            SyncEvent::FetchFailed(_) => self.fetch_failure.inc(),
            SyncEvent::ConnectivityDegraded { .. } => self.degraded.set(1),
            SyncEvent::ConnectivityRestored => self.degraded.set(0),
        }
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let registry = self.registry.clone();
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, hyper::Error>(render(&registry)) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "metrics exporter listening");
        server.await?;
        Ok(())
    }
}

fn render(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        return Response::builder()
            .status(500)
            .body(Body::from(err.to_string()))
            .unwrap_or_default();
    }
    Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_default()
}
