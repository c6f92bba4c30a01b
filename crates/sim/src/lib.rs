use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use state::{now_ms, AuctionFetcher, AuctionSnapshot, FetchError};

/// Replays a queued script of fetch results, one per call. Once the script
/// runs dry every further call fails with `NodeUnreachable`.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<AuctionSnapshot, FetchError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<AuctionSnapshot, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Makes every fetch stall for `delay` before answering, to exercise
    /// timeout handling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuctionFetcher for ScriptedFetcher {
    async fn fetch_auction_state(
        &self,
        _contract_address: &str,
    ) -> Result<AuctionSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::NodeUnreachable("script exhausted".into())))
    }
}

pub fn snapshot(contract_address: &str, sequence: u64, bid_amount_wei: u128) -> AuctionSnapshot {
    AuctionSnapshot {
        contract_address: contract_address.into(),
        bid_amount_wei,
        bidder: Some("0xbidder".into()),
        end_ts_ms: now_ms() + 60_000,
        last_updated_ms: now_ms(),
        sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_fails() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(snapshot("0x123", 1, 100)),
            Err(FetchError::NetworkTimeout),
        ]);

        let first = fetcher.fetch_auction_state("0x123").await;
        assert_eq!(first.expect("first result").sequence, 1);

        let second = fetcher.fetch_auction_state("0x123").await;
        assert_eq!(second, Err(FetchError::NetworkTimeout));

        let exhausted = fetcher.fetch_auction_state("0x123").await;
        assert!(matches!(exhausted, Err(FetchError::NodeUnreachable(_))));
        assert_eq!(fetcher.calls(), 3);
    }
}
