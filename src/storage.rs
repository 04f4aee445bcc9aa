use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::errors::{IndexerError, IndexerResult};
use crate::governance::{BallotHeadRow, BallotRow, FeeMarkerRow, ProposalMetadata, ProposalRow};
use crate::types::{BlockHeader, BlockMetadata, Hash, Transaction, TxOutput, TxType};
use crate::validators::{EnrollmentRow, PreImageRow};

const CF_BLOCKS: &str = "blocks";
const CF_BLOCK_HASHES: &str = "block_hashes";
const CF_TXS: &str = "txs";
const CF_TX_LOCATOR: &str = "tx_locator";
const CF_UTXOS: &str = "utxos";
const CF_ADDRESS_UTXOS: &str = "address_utxos";
const CF_ADDRESS_TXS: &str = "address_txs";
const CF_BALANCES: &str = "balances";
const CF_ENROLLMENTS: &str = "enrollments";
const CF_PREIMAGES: &str = "preimages";
const CF_PROPOSALS: &str = "proposals";
const CF_FEE_MARKERS: &str = "fee_markers";
const CF_BALLOTS: &str = "ballots";
const CF_BALLOT_HEADS: &str = "ballot_heads";
const CF_TX_POOL: &str = "tx_pool";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_BLOCK_HASHES,
    CF_TXS,
    CF_TX_LOCATOR,
    CF_UTXOS,
    CF_ADDRESS_UTXOS,
    CF_ADDRESS_TXS,
    CF_BALANCES,
    CF_ENROLLMENTS,
    CF_PREIMAGES,
    CF_PROPOSALS,
    CF_FEE_MARKERS,
    CF_BALLOTS,
    CF_BALLOT_HEADS,
    CF_TX_POOL,
    CF_METADATA,
];

const TIP_HEIGHT_KEY: &[u8] = b"tip_height";
const TIP_HASH_KEY: &[u8] = b"tip_hash";
const TIP_TIMESTAMP_KEY: &[u8] = b"tip_timestamp";
const STATS_KEY: &[u8] = b"stats";

/// Block row as persisted; the header keeps enrollments and the pre-image
/// vector so per-block queries need no joins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub hash: Hash,
    pub header: BlockHeader,
    pub tx_count: u32,
    pub timestamp: u64,
}

/// Input with its source output resolved at commit time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub utxo: Hash,
    pub address: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRow {
    pub hash: Hash,
    pub block_height: u64,
    pub index: u32,
    pub tx_type: TxType,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<TxOutput>,
    pub payload: Vec<u8>,
    pub fee: u64,
    pub size: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoRow {
    pub utxo_key: Hash,
    pub tx_hash: Hash,
    pub output_index: u32,
    pub address: String,
    pub amount: u64,
    pub utxo_type: TxType,
    pub unlock_height: u64,
    pub lock_type: u8,
    pub lock_bytes: Vec<u8>,
    pub created_at: u64,
    pub spent_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BalanceRow {
    pub balance: u64,
    pub frozen: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AddressTxRow {
    pub tx_hash: Hash,
    pub inbound: bool,
    pub outbound: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolTxRow {
    pub hash: Hash,
    pub tx: Transaction,
    pub received_at: u64,
    pub addresses: Vec<String>,
}

/// Rolling aggregates maintained at every commit.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StatsRow {
    pub tx_count: u64,
    pub circulating_supply: u64,
    pub frozen_supply: u64,
    pub validator_count: u64,
}

/// Every row a block commit writes, staged up front so the write is
/// all-or-nothing.
#[derive(Default)]
pub struct StagedBlock {
    pub block: Option<StoredBlock>,
    pub txs: Vec<TxRow>,
    pub utxo_inserts: Vec<UtxoRow>,
    pub utxo_spends: Vec<UtxoRow>,
    pub address_txs: Vec<(String, u64, u32, AddressTxRow)>,
    pub balances: Vec<(String, BalanceRow)>,
    pub enrollments: Vec<EnrollmentRow>,
    pub preimage_resets: Vec<PreImageRow>,
    pub fee_markers: Vec<FeeMarkerRow>,
    pub proposals: Vec<ProposalRow>,
    pub ballots: Vec<(Vec<u8>, BallotRow)>,
    pub ballot_heads: Vec<(Vec<u8>, BallotHeadRow)>,
    pub pool_removals: Vec<Hash>,
    pub stats: Option<StatsRow>,
}

pub fn address_tx_key(address: &str, height: u64, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 13);
    key.extend_from_slice(address.as_bytes());
    key.push(0);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn ballot_audit_key(proposal_id: &str, height: u64, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(proposal_id.len() + 13);
    key.extend_from_slice(proposal_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn ballot_head_key(proposal_id: &str, address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(proposal_id.len() + address.len() + 1);
    key.extend_from_slice(proposal_id.as_bytes());
    key.push(0);
    key.extend_from_slice(address.as_bytes());
    key
}

fn address_utxo_key(address: &str, utxo: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 33);
    key.extend_from_slice(address.as_bytes());
    key.push(0);
    key.extend_from_slice(utxo.as_bytes());
    key
}

fn enrollment_key(utxo: &Hash, enrolled_at: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(utxo.as_bytes());
    key.extend_from_slice(&enrolled_at.to_be_bytes());
    key
}

fn tx_key(height: u64, index: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&height.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl Storage {
    pub fn open(path: &Path) -> IndexerResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> IndexerResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IndexerError::Config(format!("missing column family {name}")))
    }

    fn get_row<T: for<'de> Deserialize<'de>>(
        &self,
        cf: &str,
        key: &[u8],
    ) -> IndexerResult<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(&handle, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn put_row<T: Serialize>(&self, cf: &str, key: &[u8], row: &T) -> IndexerResult<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(&handle, key, bincode::serialize(row)?)?;
        Ok(())
    }

    /// One past the highest committed height; 0 for an empty store.
    pub fn expected_height(&self) -> IndexerResult<u64> {
        Ok(self.tip()?.map(|tip| tip.height + 1).unwrap_or(0))
    }

    pub fn tip(&self) -> IndexerResult<Option<BlockMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        let height_bytes = match self.db.get_cf(&cf, TIP_HEIGHT_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let height = decode_u64(&height_bytes)?;
        let hash_bytes = self
            .db
            .get_cf(&cf, TIP_HASH_KEY)?
            .ok_or_else(|| IndexerError::Config("missing tip hash".into()))?;
        let hash_raw: [u8; 32] = hash_bytes
            .as_slice()
            .try_into()
            .map_err(|_| IndexerError::Config("invalid tip hash encoding".into()))?;
        let timestamp_bytes = self
            .db
            .get_cf(&cf, TIP_TIMESTAMP_KEY)?
            .ok_or_else(|| IndexerError::Config("missing tip timestamp".into()))?;
        Ok(Some(BlockMetadata {
            height,
            hash: Hash(hash_raw),
            timestamp: decode_u64(&timestamp_bytes)?,
        }))
    }

    /// Writes everything a block commit produced in one batch, tip metadata
    /// included, so readers either see all of height `h` or none of it.
    pub fn put_block(&self, staged: StagedBlock) -> IndexerResult<()> {
        let block = staged
            .block
            .ok_or_else(|| IndexerError::Config("staged commit missing block row".into()))?;
        let mut batch = WriteBatch::default();

        let blocks_cf = self.cf(CF_BLOCKS)?;
        batch.put_cf(
            &blocks_cf,
            block.header.height.to_be_bytes(),
            bincode::serialize(&block)?,
        );
        let block_hashes_cf = self.cf(CF_BLOCK_HASHES)?;
        batch.put_cf(
            &block_hashes_cf,
            block.hash.as_bytes(),
            block.header.height.to_be_bytes(),
        );

        let txs_cf = self.cf(CF_TXS)?;
        let locator_cf = self.cf(CF_TX_LOCATOR)?;
        for tx in &staged.txs {
            let key = tx_key(tx.block_height, tx.index);
            batch.put_cf(&txs_cf, key, bincode::serialize(tx)?);
            batch.put_cf(&locator_cf, tx.hash.as_bytes(), key);
        }

        let utxos_cf = self.cf(CF_UTXOS)?;
        let address_utxos_cf = self.cf(CF_ADDRESS_UTXOS)?;
        for spent in &staged.utxo_spends {
            batch.put_cf(&utxos_cf, spent.utxo_key.as_bytes(), bincode::serialize(spent)?);
            batch.delete_cf(
                &address_utxos_cf,
                address_utxo_key(&spent.address, &spent.utxo_key),
            );
        }
        for created in &staged.utxo_inserts {
            batch.put_cf(
                &utxos_cf,
                created.utxo_key.as_bytes(),
                bincode::serialize(created)?,
            );
            // Outputs consumed within their own block never enter the
            // unspent index.
            if created.spent_at.is_none() {
                batch.put_cf(
                    &address_utxos_cf,
                    address_utxo_key(&created.address, &created.utxo_key),
                    [],
                );
            }
        }

        let address_txs_cf = self.cf(CF_ADDRESS_TXS)?;
        for (address, height, index, row) in &staged.address_txs {
            batch.put_cf(
                &address_txs_cf,
                address_tx_key(address, *height, *index),
                bincode::serialize(row)?,
            );
        }

        let balances_cf = self.cf(CF_BALANCES)?;
        for (address, row) in &staged.balances {
            batch.put_cf(&balances_cf, address.as_bytes(), bincode::serialize(row)?);
        }

        let enrollments_cf = self.cf(CF_ENROLLMENTS)?;
        for enrollment in &staged.enrollments {
            batch.put_cf(
                &enrollments_cf,
                enrollment_key(&enrollment.utxo_key, enrollment.enrolled_at),
                bincode::serialize(enrollment)?,
            );
        }

        let preimages_cf = self.cf(CF_PREIMAGES)?;
        for row in &staged.preimage_resets {
            batch.put_cf(&preimages_cf, row.utxo_key.as_bytes(), bincode::serialize(row)?);
        }

        let fee_markers_cf = self.cf(CF_FEE_MARKERS)?;
        for marker in &staged.fee_markers {
            batch.put_cf(
                &fee_markers_cf,
                marker.tx_hash.as_bytes(),
                bincode::serialize(marker)?,
            );
        }

        let proposals_cf = self.cf(CF_PROPOSALS)?;
        for proposal in &staged.proposals {
            batch.put_cf(
                &proposals_cf,
                proposal.proposal_id.as_bytes(),
                bincode::serialize(proposal)?,
            );
        }

        let ballots_cf = self.cf(CF_BALLOTS)?;
        for (key, row) in &staged.ballots {
            batch.put_cf(&ballots_cf, key, bincode::serialize(row)?);
        }
        let ballot_heads_cf = self.cf(CF_BALLOT_HEADS)?;
        for (key, row) in &staged.ballot_heads {
            batch.put_cf(&ballot_heads_cf, key, bincode::serialize(row)?);
        }

        let pool_cf = self.cf(CF_TX_POOL)?;
        for hash in &staged.pool_removals {
            batch.delete_cf(&pool_cf, hash.as_bytes());
        }

        let metadata_cf = self.cf(CF_METADATA)?;
        if let Some(stats) = &staged.stats {
            batch.put_cf(&metadata_cf, STATS_KEY, bincode::serialize(stats)?);
        }
        batch.put_cf(
            &metadata_cf,
            TIP_HEIGHT_KEY,
            block.header.height.to_be_bytes(),
        );
        batch.put_cf(&metadata_cf, TIP_HASH_KEY, block.hash.as_bytes());
        batch.put_cf(&metadata_cf, TIP_TIMESTAMP_KEY, block.timestamp.to_be_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    pub fn block_by_height(&self, height: u64) -> IndexerResult<Option<StoredBlock>> {
        self.get_row(CF_BLOCKS, &height.to_be_bytes())
    }

    pub fn height_by_hash(&self, hash: &Hash) -> IndexerResult<Option<u64>> {
        let cf = self.cf(CF_BLOCK_HASHES)?;
        match self.db.get_cf(&cf, hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Newest-first page of block rows plus the total count.
    pub fn blocks_page_desc(
        &self,
        offset: u64,
        limit: u64,
    ) -> IndexerResult<(Vec<StoredBlock>, u64)> {
        let total = self.expected_height()?;
        let cf = self.cf(CF_BLOCKS)?;
        let mut rows = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::End);
        for entry in iter.skip(offset as usize).take(limit as usize) {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok((rows, total))
    }

    pub fn txs_for_block(&self, height: u64) -> IndexerResult<Vec<TxRow>> {
        let cf = self.cf(CF_TXS)?;
        let prefix = height.to_be_bytes();
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Newest-first page of transactions plus the running total.
    pub fn txs_page_desc(&self, offset: u64, limit: u64) -> IndexerResult<(Vec<TxRow>, u64)> {
        let total = self.stats()?.tx_count;
        let cf = self.cf(CF_TXS)?;
        let mut rows = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::End);
        for entry in iter.skip(offset as usize).take(limit as usize) {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok((rows, total))
    }

    pub fn tx_by_hash(&self, hash: &Hash) -> IndexerResult<Option<TxRow>> {
        let locator_cf = self.cf(CF_TX_LOCATOR)?;
        let key = match self.db.get_cf(&locator_cf, hash.as_bytes())? {
            Some(key) => key,
            None => return Ok(None),
        };
        let cf = self.cf(CF_TXS)?;
        match self.db.get_cf(&cf, &key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn utxo(&self, utxo_key: &Hash) -> IndexerResult<Option<UtxoRow>> {
        self.get_row(CF_UTXOS, utxo_key.as_bytes())
    }

    /// Unspent outputs currently held by `address`.
    pub fn utxos_by_address(&self, address: &str) -> IndexerResult<Vec<UtxoRow>> {
        let cf = self.cf(CF_ADDRESS_UTXOS)?;
        let mut prefix = address.as_bytes().to_vec();
        prefix.push(0);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, _value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw: [u8; 32] = key[prefix.len()..]
                .try_into()
                .map_err(|_| IndexerError::Config("invalid address utxo key".into()))?;
            if let Some(row) = self.utxo(&Hash(raw))? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn balance(&self, address: &str) -> IndexerResult<BalanceRow> {
        Ok(self
            .get_row(CF_BALANCES, address.as_bytes())?
            .unwrap_or_default())
    }

    pub fn balances_all(&self) -> IndexerResult<Vec<(String, BalanceRow)>> {
        let cf = self.cf(CF_BALANCES)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|err| IndexerError::Config(format!("invalid balance key: {err}")))?;
            rows.push((address, bincode::deserialize(&value)?));
        }
        Ok(rows)
    }

    /// Full per-address transaction index, oldest first.
    pub fn address_txs(&self, address: &str) -> IndexerResult<Vec<(u64, u32, AddressTxRow)>> {
        let cf = self.cf(CF_ADDRESS_TXS)?;
        let mut prefix = address.as_bytes().to_vec();
        prefix.push(0);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let tail = &key[prefix.len()..];
            if tail.len() != 12 {
                return Err(IndexerError::Config("invalid address tx key".into()));
            }
            let height = decode_u64(&tail[..8])?;
            let index = u32::from_be_bytes(
                tail[8..]
                    .try_into()
                    .map_err(|_| IndexerError::Config("invalid address tx key".into()))?,
            );
            rows.push((height, index, bincode::deserialize(&value)?));
        }
        Ok(rows)
    }

    pub fn enrollments_all(&self) -> IndexerResult<Vec<EnrollmentRow>> {
        let cf = self.cf(CF_ENROLLMENTS)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    pub fn latest_enrollment(&self, utxo_key: &Hash) -> IndexerResult<Option<EnrollmentRow>> {
        let cf = self.cf(CF_ENROLLMENTS)?;
        let mut upper = utxo_key.as_bytes().to_vec();
        upper.extend_from_slice(&u64::MAX.to_be_bytes());
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(utxo_key.as_bytes()) {
                break;
            }
            return Ok(Some(bincode::deserialize(&value)?));
        }
        Ok(None)
    }

    pub fn preimage(&self, utxo_key: &Hash) -> IndexerResult<Option<PreImageRow>> {
        self.get_row(CF_PREIMAGES, utxo_key.as_bytes())
    }

    /// Monotone tip advance. Rejects a tip at or below the stored one and a
    /// tip beyond the enrollment cycle; reports whether a row changed.
    pub fn update_preimage(&self, utxo_key: &Hash, tip_hash: Hash, tip_height: u64) -> IndexerResult<bool> {
        let mut row = match self.preimage(utxo_key)? {
            Some(row) => row,
            None => return Ok(false),
        };
        if tip_height <= row.tip_height || tip_height > row.anchor_height + row.cycle_length {
            return Ok(false);
        }
        row.tip_hash = tip_hash;
        row.tip_height = tip_height;
        self.put_row(CF_PREIMAGES, utxo_key.as_bytes(), &row)?;
        Ok(true)
    }

    pub fn proposal(&self, proposal_id: &str) -> IndexerResult<Option<ProposalRow>> {
        self.get_row(CF_PROPOSALS, proposal_id.as_bytes())
    }

    pub fn proposals_all(&self) -> IndexerResult<Vec<ProposalRow>> {
        let cf = self.cf(CF_PROPOSALS)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Best-effort metadata enrichment, written outside the commit batch.
    pub fn put_proposal_metadata(
        &self,
        proposal_id: &str,
        metadata: ProposalMetadata,
    ) -> IndexerResult<bool> {
        let mut row = match self.proposal(proposal_id)? {
            Some(row) => row,
            None => return Ok(false),
        };
        row.metadata = Some(metadata);
        self.put_row(CF_PROPOSALS, proposal_id.as_bytes(), &row)?;
        Ok(true)
    }

    pub fn fee_marker(&self, tx_hash: &Hash) -> IndexerResult<Option<FeeMarkerRow>> {
        self.get_row(CF_FEE_MARKERS, tx_hash.as_bytes())
    }

    pub fn ballots_for_proposal(&self, proposal_id: &str) -> IndexerResult<Vec<(Vec<u8>, BallotRow)>> {
        let cf = self.cf(CF_BALLOTS)?;
        let mut prefix = proposal_id.as_bytes().to_vec();
        prefix.push(0);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push((key.to_vec(), bincode::deserialize(&value)?));
        }
        Ok(rows)
    }

    pub fn ballot(&self, audit_key: &[u8]) -> IndexerResult<Option<BallotRow>> {
        self.get_row(CF_BALLOTS, audit_key)
    }

    pub fn ballot_head(
        &self,
        proposal_id: &str,
        address: &str,
    ) -> IndexerResult<Option<BallotHeadRow>> {
        self.get_row(CF_BALLOT_HEADS, &ballot_head_key(proposal_id, address))
    }

    pub fn ballot_heads_for_proposal(
        &self,
        proposal_id: &str,
    ) -> IndexerResult<Vec<BallotHeadRow>> {
        let cf = self.cf(CF_BALLOT_HEADS)?;
        let mut prefix = proposal_id.as_bytes().to_vec();
        prefix.push(0);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    pub fn put_pool_tx(&self, row: &PoolTxRow) -> IndexerResult<()> {
        self.put_row(CF_TX_POOL, row.hash.as_bytes(), row)
    }

    pub fn pool_tx(&self, hash: &Hash) -> IndexerResult<Option<PoolTxRow>> {
        self.get_row(CF_TX_POOL, hash.as_bytes())
    }

    pub fn pool_txs(&self) -> IndexerResult<Vec<PoolTxRow>> {
        let cf = self.cf(CF_TX_POOL)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    pub fn stats(&self) -> IndexerResult<StatsRow> {
        Ok(self.get_row(CF_METADATA, STATS_KEY)?.unwrap_or_default())
    }
}

fn decode_u64(bytes: &[u8]) -> IndexerResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexerError::Config("invalid integer encoding".into()))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;
    use tempfile::tempdir;

    fn block_row(height: u64) -> StoredBlock {
        let header = BlockHeader {
            height,
            prev_block: Hash([height.wrapping_sub(1) as u8; 32]),
            merkle_root: Hash::ZERO,
            signature: String::new(),
            random_seed: Hash::ZERO,
            time_offset: height * 600,
            enrollments: Vec::new(),
            preimages: Vec::new(),
        };
        StoredBlock {
            hash: Hash([height as u8 + 1; 32]),
            header,
            tx_count: 0,
            timestamp: height * 600,
        }
    }

    fn staged(height: u64) -> StagedBlock {
        StagedBlock {
            block: Some(block_row(height)),
            ..StagedBlock::default()
        }
    }

    #[test]
    fn expected_height_tracks_commits() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        assert_eq!(storage.expected_height().expect("height"), 0);
        storage.put_block(staged(0)).expect("commit 0");
        storage.put_block(staged(1)).expect("commit 1");
        assert_eq!(storage.expected_height().expect("height"), 2);
        let tip = storage.tip().expect("tip").expect("some tip");
        assert_eq!(tip.height, 1);
        assert_eq!(tip.hash, Hash([2u8; 32]));
    }

    #[test]
    fn block_lookup_by_hash_and_height_agree() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        storage.put_block(staged(0)).expect("commit");
        let by_height = storage.block_by_height(0).expect("read").expect("block");
        let height = storage
            .height_by_hash(&by_height.hash)
            .expect("read")
            .expect("height");
        assert_eq!(height, 0);
    }

    #[test]
    fn address_utxo_index_follows_spends() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let key = Hash([9u8; 32]);
        let utxo = UtxoRow {
            utxo_key: key,
            tx_hash: Hash([1u8; 32]),
            output_index: 0,
            address: "boa00".into(),
            amount: 400,
            utxo_type: TxType::Payment,
            unlock_height: 1,
            lock_type: 0,
            lock_bytes: Vec::new(),
            created_at: 0,
            spent_at: None,
        };
        let mut first = staged(0);
        first.utxo_inserts.push(utxo.clone());
        storage.put_block(first).expect("commit 0");
        assert_eq!(storage.utxos_by_address("boa00").expect("scan").len(), 1);

        let mut second = staged(1);
        second.utxo_spends.push(UtxoRow {
            spent_at: Some(1),
            ..utxo
        });
        storage.put_block(second).expect("commit 1");
        assert!(storage.utxos_by_address("boa00").expect("scan").is_empty());
        let row = storage.utxo(&key).expect("read").expect("row");
        assert_eq!(row.spent_at, Some(1));
    }
}
