use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{IndexerError, IndexerResult};
use crate::types::{Block, Hash};

/// Pull interface to the consensus node. The indexer only ever reads; the
/// node remains the source of truth for the ledger.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn tip_height(&self) -> IndexerResult<u64>;
    /// Contiguous prefix starting at `start`, possibly shorter than asked.
    async fn blocks_from(&self, start: u64, max_blocks: u64) -> IndexerResult<Vec<Block>>;
    /// Sibling hashes needed to recompute the block's Merkle root from the
    /// transaction at `height`.
    async fn merkle_path(&self, height: u64, tx_hash: &Hash) -> IndexerResult<Vec<Hash>>;
}

pub struct AgoraClient {
    endpoint: String,
    http: reqwest::Client,
}

impl AgoraClient {
    pub fn new(endpoint: &str, fetch_timeout: Duration) -> IndexerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|err| IndexerError::Config(format!("unable to build agora client: {err}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn unreachable(err: reqwest::Error) -> IndexerError {
        IndexerError::Upstream(err.to_string())
    }
}

#[async_trait]
impl BlockSource for AgoraClient {
    async fn tip_height(&self) -> IndexerResult<u64> {
        let raw = self
            .http
            .get(format!("{}/block_height", self.endpoint))
            .send()
            .await
            .map_err(Self::unreachable)?
            .error_for_status()
            .map_err(Self::unreachable)?
            .text()
            .await
            .map_err(Self::unreachable)?;
        raw.trim()
            .parse()
            .map_err(|err| IndexerError::Upstream(format!("invalid tip height: {err}")))
    }

    async fn blocks_from(&self, start: u64, max_blocks: u64) -> IndexerResult<Vec<Block>> {
        self.http
            .get(format!(
                "{}/blocks_from?height={start}&max_blocks={max_blocks}",
                self.endpoint
            ))
            .send()
            .await
            .map_err(Self::unreachable)?
            .error_for_status()
            .map_err(Self::unreachable)?
            .json()
            .await
            .map_err(Self::unreachable)
    }

    async fn merkle_path(&self, height: u64, tx_hash: &Hash) -> IndexerResult<Vec<Hash>> {
        self.http
            .get(format!(
                "{}/merkle_path/{height}/{}",
                self.endpoint,
                tx_hash.to_hex()
            ))
            .send()
            .await
            .map_err(Self::unreachable)?
            .error_for_status()
            .map_err(Self::unreachable)?
            .json()
            .await
            .map_err(Self::unreachable)
    }
}
