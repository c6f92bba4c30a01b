use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use state::{now_ms, AuctionFetcher, AuctionSnapshot, FetchError};

/// Fetches auction state from an indexer's JSON API. The sync core never
/// depends on this crate; it only sees the `AuctionFetcher` trait.
pub struct HttpIndexerClient {
    http: Client,
    base_url: String,
}

/// Wire shape served by the indexer. The bid amount comes as a decimal
/// string because JSON numbers cannot carry full wei precision.
#[derive(Debug, Deserialize)]
struct AuctionStateDto {
    contract_address: String,
    bid_amount_wei: String,
    bidder: Option<String>,
    end_ts_ms: i64,
    sequence: u64,
}

impl HttpIndexerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn auction_url(&self, contract_address: &str) -> String {
        format!(
            "{}/auctions/{contract_address}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl AuctionFetcher for HttpIndexerClient {
    async fn fetch_auction_state(
        &self,
        contract_address: &str,
    ) -> Result<AuctionSnapshot, FetchError> {
        let response = self
            .http
            .get(self.auction_url(contract_address))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    FetchError::NetworkTimeout
                } else {
                    FetchError::NodeUnreachable(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::NodeUnreachable(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::MalformedResponse(format!(
                "unexpected status {status}"
            )));
        }

        let dto: AuctionStateDto = response
            .json()
            .await
            .map_err(|err| FetchError::MalformedResponse(err.to_string()))?;
        parse_snapshot(dto)
    }
}

fn parse_snapshot(dto: AuctionStateDto) -> Result<AuctionSnapshot, FetchError> {
    let bid_amount_wei = dto
        .bid_amount_wei
        .parse::<u128>()
        .map_err(|err| FetchError::MalformedResponse(format!("bid_amount_wei: {err}")))?;
    Ok(AuctionSnapshot {
        contract_address: dto.contract_address,
        bid_amount_wei,
        bidder: dto.bidder,
        end_ts_ms: dto.end_ts_ms,
        last_updated_ms: now_ms(),
        sequence: dto.sequence,
    })
}
