use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use admin_ipc::{
    run_server, AdminRequest, AdminResponse, AdminStatus, SnapshotSummary, DEFAULT_SOCKET_PATH,
};
use anyhow::bail;
use clap::Parser;
use indexer::HttpIndexerClient;
use metrics::SyncMetrics;
use state::{format_eth, now_ms, SnapshotStore, SyncEvent};
use storage::init_sqlite;
use sync::{FetchScheduler, SyncConfig};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{info, warn, Level};
use uuid::Uuid;
use wallet::WalletConnector;

const MEMORY_PREFIX: &str = "sqlite::memory:";
const URL_PREFIX: &str = "sqlite://";

#[derive(Parser, Debug)]
struct Args {
    #[arg(
        long,
        env = "INDEXER_URL",
        default_value = "https://starknet-sepolia.public.blastapi.io/rpc/v0_6"
    )]
    indexer_url: String,

    #[arg(long, env = "AUCTION_CONTRACT")]
    contract_address: String,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 5_000)]
    poll_interval_ms: u64,

    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value_t = 10_000)]
    fetch_timeout_ms: u64,

    #[arg(long, env = "SQLITE_PATH", default_value = "sqlite://auction.db")]
    sqlite_path: String,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9109")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "WALLET_CONNECTOR", default_value = "argent")]
    wallet_connector: WalletConnector,
}

fn log_startup(args: &Args, run_id: &str) {
    info!(url = %args.indexer_url, "indexer endpoint configured");
    info!(contract = %args.contract_address, "auction contract configured");
    info!(connector = %args.wallet_connector, "wallet connector selected");
    info!(path = %args.sqlite_path, "sqlite path configured");
    info!(socket = %args.admin_socket, "admin socket bind planned");
    info!(addr = %args.metrics_addr, "metrics bind planned");
    info!(%run_id, "run initialized");
}

fn validate_sqlite_path(path: &str) -> anyhow::Result<()> {
    if path.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }
    if !path.starts_with(URL_PREFIX) {
        bail!("sqlite path must start with `sqlite://` or use `sqlite::memory:`");
    }

    // Strip off query params to check the filesystem portion.
    let rest = path.trim_start_matches(URL_PREFIX);
    let (path_part, _) = rest.split_once('?').unwrap_or((rest, ""));
    if path_part.is_empty() {
        bail!("sqlite path is missing a filesystem component after `sqlite://`");
    }
    Ok(())
}

fn ensure_sqlite_parent_dir(path: &str) -> anyhow::Result<()> {
    if path.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }
    if let Some(rest) = path.strip_prefix(URL_PREFIX) {
        let path_part = rest.split_once('?').map(|(path, _)| path).unwrap_or(rest);
        if let Some(parent) = PathBuf::from(path_part).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    validate_sqlite_path(&args.sqlite_path)?;
    ensure_sqlite_parent_dir(&args.sqlite_path)?;
    info!(
        sqlite = %args.sqlite_path,
        socket = %args.admin_socket,
        "booting auctiond"
    );

    let run_id = Uuid::new_v4().to_string();
    let db = init_sqlite(&args.sqlite_path).await?;
    db.insert_run(&run_id, None).await?;
    log_startup(&args, &run_id);

    let missing_tables = db.validate_required_tables().await?;
    if !missing_tables.is_empty() {
        warn!(tables = ?missing_tables, "sqlite missing required tables");
        if let Err(err) = db
            .log_incident(
                &run_id,
                "warning",
                "db_schema_missing",
                &format!(
                    "sqlite missing required tables: {}",
                    missing_tables.join(", ")
                ),
            )
            .await
        {
            warn!(error = ?err, "failed to log missing schema incident");
        }
    }

    let snapshots = SnapshotStore::new();

    // Warm start through the same sequence gate, so a stale journal row can
    // never mask a newer fetch.
    match db.latest_snapshot(&args.contract_address).await {
        Ok(Some(persisted)) => {
            let sequence = persisted.sequence;
            if snapshots.try_set(persisted) {
                info!(sequence, "warm started from persisted snapshot");
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = ?err, "failed to read persisted snapshot"),
    }

    let metrics = SyncMetrics::new()?;
    let degraded = Arc::new(AtomicBool::new(false));

    // Subscriber callbacks must stay cheap; persistence happens off the
    // notification path.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SyncEvent>();
    let subscription = snapshots.subscribe(move |event| {
        let _ = event_tx.send(event.clone());
    });

    {
        let db = db.clone();
        let run_id = run_id.clone();
        let metrics = metrics.clone();
        let degraded = degraded.clone();
        task::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                metrics.observe_event(&event);
                match event {
                    SyncEvent::Snapshot(Some(snapshot)) => {
                        if let Err(err) = db.record_snapshot(&run_id, &snapshot, now_ms()).await {
                            warn!(error = ?err, "failed to persist snapshot");
                        }
                    }
                    SyncEvent::ConnectivityDegraded {
                        consecutive_failures,
                    } => {
                        degraded.store(true, Ordering::SeqCst);
                        if let Err(err) = db
                            .log_incident(
                                &run_id,
                                "warning",
                                "degraded_connectivity",
                                &format!("{consecutive_failures} consecutive fetch failures"),
                            )
                            .await
                        {
                            warn!(error = ?err, "failed to log degraded incident");
                        }
                    }
                    SyncEvent::ConnectivityRestored => {
                        degraded.store(false, Ordering::SeqCst);
                        if let Err(err) = db
                            .log_incident(&run_id, "info", "connectivity_restored", "fetching recovered")
                            .await
                        {
                            warn!(error = ?err, "failed to log restored incident");
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    let fetcher = Arc::new(HttpIndexerClient::new(&args.indexer_url));
    let mut config = SyncConfig::new(&args.contract_address);
    config.poll_interval = Duration::from_millis(args.poll_interval_ms);
    config.fetch_timeout = Duration::from_millis(args.fetch_timeout_ms);
    let scheduler = FetchScheduler::spawn(config, fetcher, snapshots.clone());

    let controls = scheduler.controls();
    let status_store = snapshots.clone();
    let status_degraded = degraded.clone();
    let admin_run_id = run_id.clone();
    let socket_path = args.admin_socket.clone();
    task::spawn(async move {
        let handler = move |req: AdminRequest| -> anyhow::Result<AdminResponse> {
            match req {
                AdminRequest::Status => {
                    let snapshot = status_store.get_current().map(|snapshot| SnapshotSummary {
                        sequence: snapshot.sequence,
                        bid_eth: format_eth(snapshot.bid_amount_wei),
                        bidder: snapshot.bidder,
                        end_ts_ms: snapshot.end_ts_ms,
                        age_ms: now_ms() - snapshot.last_updated_ms,
                    });
                    let connectivity = if status_degraded.load(Ordering::SeqCst) {
                        "degraded"
                    } else {
                        "ok"
                    };
                    Ok(AdminResponse::Status(AdminStatus {
                        run_id: admin_run_id.clone(),
                        sync_state: format!("{:?}", controls.sync_state()),
                        connectivity: connectivity.to_string(),
                        snapshot,
                    }))
                }
                AdminRequest::Refresh => {
                    controls.request_refresh();
                    Ok(AdminResponse::Ack)
                }
                AdminRequest::Pause => {
                    controls.pause();
                    Ok(AdminResponse::Ack)
                }
                AdminRequest::Resume => {
                    controls.resume();
                    Ok(AdminResponse::Ack)
                }
            }
        };
        if let Err(err) = run_server(&socket_path, handler).await {
            tracing::error!(error = ?err, "admin ipc server failed");
        }
    });

    let metrics_addr = args.metrics_addr;
    let metrics_task = metrics.clone();
    task::spawn(async move {
        if let Err(err) = metrics_task.serve(metrics_addr).await {
            tracing::error!(error = ?err, "metrics server error");
        }
    });

    info!(
        run_id = %run_id,
        contract = %args.contract_address,
        admin_socket = %args.admin_socket,
        metrics_addr = %args.metrics_addr,
        "ready"
    );
    if let Err(err) = db
        .log_incident(&run_id, "info", "ready", "auctiond booted and ready")
        .await
    {
        tracing::warn!(error = ?err, "failed to record ready incident");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    scheduler.shutdown().await;
    subscription.unsubscribe();
    if let Err(err) = db
        .log_incident(&run_id, "info", "shutdown", "auctiond stopped")
        .await
    {
        warn!(error = ?err, "failed to record shutdown incident");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for VecWriter {
        type Writer = VecWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn test_args() -> Args {
        Args::parse_from([
            "auctiond",
            "--contract-address",
            "0x123",
            "--indexer-url",
            "http://indexer.local",
            "--sqlite-path",
            "sqlite:///tmp/test.db",
            "--admin-socket",
            "/tmp/test.sock",
            "--metrics-addr",
            "127.0.0.1:9000",
            "--wallet-connector",
            "braavos",
        ])
    }

    #[test]
    fn startup_logs_include_configuration() {
        let args = test_args();
        let run_id = Uuid::nil().to_string();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = VecWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(writer)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_startup(&args, &run_id);
        });

        let output =
            String::from_utf8(buffer.lock().unwrap().clone()).expect("log output should be utf8");
        assert!(output.contains("indexer endpoint configured"));
        assert!(output.contains("auction contract configured"));
        assert!(output.contains("wallet connector selected"));
        assert!(output.contains("admin socket bind planned"));
        assert!(output.contains("metrics bind planned"));
        assert!(output.contains(&args.contract_address));
        assert!(output.contains("braavos"));
        assert!(output.contains(&args.admin_socket));
        assert!(output.contains(&args.metrics_addr.to_string()));
        assert!(output.contains(&run_id));
    }

    #[test]
    fn parses_wallet_connector_argument() {
        let args = test_args();
        assert_eq!(args.wallet_connector, WalletConnector::Braavos);
    }

    #[test]
    fn validates_memory_and_file_urls() {
        validate_sqlite_path("sqlite::memory:?cache=shared").expect("memory dsn should validate");
        validate_sqlite_path("sqlite://auction.db").expect("relative file url should validate");
        validate_sqlite_path("sqlite:///var/lib/auctiond/auction.db")
            .expect("absolute file url should validate");
    }

    #[test]
    fn rejects_missing_or_invalid_urls() {
        let err = validate_sqlite_path("auction.db").expect_err("should reject plain filename");
        assert!(err
            .to_string()
            .contains("must start with `sqlite://` or use `sqlite::memory:`"));

        let err = validate_sqlite_path("sqlite://").expect_err("should reject empty path");
        assert!(err
            .to_string()
            .contains("missing a filesystem component after `sqlite://`"));
    }

    #[test]
    fn creates_parent_directory_for_sqlite_url() {
        let tmp_dir = std::env::temp_dir().join(format!("auctiond_test_{}", Uuid::new_v4()));
        let db_path = tmp_dir.join("data").join("auction.db");
        let url = format!("sqlite://{}", db_path.display());

        ensure_sqlite_parent_dir(&url).expect("should create parent directories");
        assert!(db_path.parent().expect("parent").is_dir());

        let _ = fs::remove_dir_all(&tmp_dir);
    }
}
