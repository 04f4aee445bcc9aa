use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::Config;
use crate::errors::{IndexerError, IndexerResult};
use crate::governance::GovernanceEngine;
use crate::storage::{
    AddressTxRow, BalanceRow, PoolTxRow, ResolvedInput, StagedBlock, StatsRow, Storage,
    StoredBlock, TxRow, UtxoRow,
};
use crate::types::{
    compute_merkle_root, utxo_key, Block, BlockMetadata, Hash, PreImageInfo, Transaction, TxType,
};
use crate::validators::{self, active_from_rows, EnrollmentRow, PreImageRow};

/// Protocol constants the projection depends on.
#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    pub genesis_timestamp: u64,
    pub block_interval_seconds: u64,
    pub validator_cycle: u64,
}

impl ChainParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            genesis_timestamp: config.consensus.genesis_timestamp,
            block_interval_seconds: config.consensus.block_interval_seconds,
            validator_cycle: config.consensus.validator_cycle,
        }
    }
}

/// Result of one committed block, handed to the event bus after the store
/// write has durably returned.
pub struct CommittedBlock {
    pub block: StoredBlock,
    pub txs: Vec<TxRow>,
    pub stats: StatsRow,
    /// Proposals first materialized by this block; candidates for metadata
    /// enrichment.
    pub new_proposals: Vec<String>,
}

/// Owns the projection: validates externalized blocks, stages every row
/// they produce (governance effects included) and writes them atomically.
pub struct Ledger {
    storage: Storage,
    params: ChainParams,
    governance: GovernanceEngine,
    tip: RwLock<Option<BlockMetadata>>,
}

impl Ledger {
    pub fn new(storage: Storage, params: ChainParams, governance: GovernanceEngine) -> IndexerResult<Self> {
        let tip = storage.tip()?;
        Ok(Self {
            storage,
            params,
            governance,
            tip: RwLock::new(tip),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    pub fn tip(&self) -> Option<BlockMetadata> {
        self.tip.read().clone()
    }

    /// Authoritative next height; recovery re-reads this between passes.
    pub fn expected_height(&self) -> IndexerResult<u64> {
        self.storage.expected_height()
    }

    pub fn block_timestamp(&self, time_offset: u64) -> u64 {
        self.params.genesis_timestamp + time_offset
    }

    /// Height whose block was current at `unix_seconds`, clamped to the tip.
    /// None before genesis or on an empty store.
    pub fn height_at_time(&self, unix_seconds: u64) -> IndexerResult<Option<u64>> {
        let tip = match self.tip() {
            Some(tip) => tip,
            None => return Ok(None),
        };
        if unix_seconds < self.params.genesis_timestamp {
            return Ok(None);
        }
        let by_interval =
            (unix_seconds - self.params.genesis_timestamp) / self.params.block_interval_seconds;
        Ok(Some(by_interval.min(tip.height)))
    }

    pub fn update_preimage(&self, info: &PreImageInfo) -> IndexerResult<bool> {
        validators::apply_preimage(&self.storage, info)
    }

    /// Best-effort mempool projection; not authoritative.
    pub fn record_pool_tx(&self, tx: &Transaction) -> IndexerResult<()> {
        let hash = tx.hash();
        let mut addresses: Vec<String> =
            tx.outputs.iter().map(|output| output.address.clone()).collect();
        for input in &tx.inputs {
            if let Some(source) = self.storage.utxo(&input.utxo)? {
                addresses.push(source.address);
            }
        }
        addresses.sort();
        addresses.dedup();
        let received_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.storage.put_pool_tx(&PoolTxRow {
            hash,
            tx: tx.clone(),
            received_at,
            addresses,
        })
    }

    /// Commits the block at exactly the expected height. All projection
    /// rows, governance transitions included, land in one store batch.
    pub fn commit_block(&self, block: &Block) -> IndexerResult<CommittedBlock> {
        let height = block.header.height;
        let expected = self.storage.expected_height()?;
        if height != expected {
            return Err(IndexerError::InvalidInput(format!(
                "block height {height} does not match expected {expected}"
            )));
        }
        if height == 0 {
            if !block.header.prev_block.is_zero() {
                return Err(IndexerError::InvalidInput(
                    "genesis block must reference the zero hash".into(),
                ));
            }
        } else {
            let prev = self
                .storage
                .block_by_height(height - 1)?
                .ok_or_else(|| IndexerError::Config("missing parent block".into()))?;
            if block.header.prev_block != prev.hash {
                return Err(IndexerError::InvalidInput(format!(
                    "previous hash mismatch at height {height}"
                )));
            }
        }
        let tx_hashes = block.tx_hashes();
        if compute_merkle_root(&tx_hashes) != block.header.merkle_root {
            return Err(IndexerError::InvalidInput(format!(
                "merkle root mismatch at height {height}"
            )));
        }

        let timestamp = self.block_timestamp(block.header.time_offset);
        let mut staged = StagedBlock::default();
        // Outputs created by this block, by key; same-block spends update
        // rows in place before anything is written.
        let mut created: HashMap<Hash, UtxoRow> = HashMap::new();
        let mut balance_deltas: HashMap<String, (i128, i128)> = HashMap::new();

        for (index, tx) in block.txs.iter().enumerate() {
            let tx_hash = tx_hashes[index];
            let mut resolved = Vec::with_capacity(tx.inputs.len());
            let mut input_sum: u64 = 0;
            for input in &tx.inputs {
                let source = if let Some(row) = created.get_mut(&input.utxo) {
                    if row.spent_at.is_some() {
                        return Err(IndexerError::InvalidInput(format!(
                            "double spend of {} at height {height}",
                            input.utxo
                        )));
                    }
                    row.spent_at = Some(height);
                    row.clone()
                } else {
                    let mut row = self
                        .storage
                        .utxo(&input.utxo)?
                        .filter(|row| row.spent_at.is_none())
                        .ok_or_else(|| {
                            IndexerError::InvalidInput(format!(
                                "missing or spent input {} at height {height}",
                                input.utxo
                            ))
                        })?;
                    row.spent_at = Some(height);
                    staged.utxo_spends.push(row.clone());
                    row
                };
                input_sum = input_sum.saturating_add(source.amount);
                let delta = balance_deltas.entry(source.address.clone()).or_default();
                if source.utxo_type == TxType::Freeze {
                    delta.1 -= source.amount as i128;
                } else {
                    delta.0 -= source.amount as i128;
                }
                resolved.push(ResolvedInput {
                    utxo: source.utxo_key,
                    address: source.address,
                    amount: source.amount,
                });
            }

            let output_sum = tx.output_sum();
            let fee = if tx.tx_type == TxType::Coinbase {
                0
            } else {
                input_sum.checked_sub(output_sum).ok_or_else(|| {
                    IndexerError::InvalidInput(format!(
                        "outputs exceed inputs in tx {tx_hash} at height {height}"
                    ))
                })?
            };

            for (output_index, output) in tx.outputs.iter().enumerate() {
                let key = utxo_key(&tx_hash, output_index as u64);
                created.insert(
                    key,
                    UtxoRow {
                        utxo_key: key,
                        tx_hash,
                        output_index: output_index as u32,
                        address: output.address.clone(),
                        amount: output.amount,
                        utxo_type: output.output_type,
                        unlock_height: height + 1,
                        lock_type: output.lock_type,
                        lock_bytes: output.lock_bytes.clone(),
                        created_at: height,
                        spent_at: None,
                    },
                );
                let delta = balance_deltas.entry(output.address.clone()).or_default();
                if output.output_type == TxType::Freeze {
                    delta.1 += output.amount as i128;
                } else {
                    delta.0 += output.amount as i128;
                }
            }

            let tx_row = TxRow {
                hash: tx_hash,
                block_height: height,
                index: index as u32,
                tx_type: tx.tx_type,
                inputs: resolved,
                outputs: tx.outputs.clone(),
                payload: tx.payload.clone(),
                fee,
                size: tx.size(),
                timestamp,
            };

            let mut touched: Vec<(String, bool, bool)> = Vec::new();
            for output in &tx.outputs {
                match touched.iter_mut().find(|(address, _, _)| address == &output.address) {
                    Some(entry) => entry.1 = true,
                    None => touched.push((output.address.clone(), true, false)),
                }
            }
            for input in &tx_row.inputs {
                match touched.iter_mut().find(|(address, _, _)| address == &input.address) {
                    Some(entry) => entry.2 = true,
                    None => touched.push((input.address.clone(), false, true)),
                }
            }
            for (address, inbound, outbound) in touched {
                staged.address_txs.push((
                    address,
                    height,
                    index as u32,
                    AddressTxRow {
                        tx_hash,
                        inbound,
                        outbound,
                    },
                ));
            }

            staged.pool_removals.push(tx_hash);
            staged.txs.push(tx_row);
        }

        for enrollment in &block.header.enrollments {
            let stake = match created.get(&enrollment.utxo_key) {
                Some(row) => Some(row.clone()),
                None => self.storage.utxo(&enrollment.utxo_key)?,
            };
            let stake = match stake {
                Some(row) if row.spent_at.is_none() && row.utxo_type == TxType::Freeze => row,
                _ => {
                    return Err(IndexerError::InvalidInput(format!(
                        "enrollment stake {} is not an unspent freeze output",
                        enrollment.utxo_key
                    )))
                }
            };
            let row = EnrollmentRow {
                utxo_key: enrollment.utxo_key,
                address: stake.address,
                stake: stake.amount,
                enrolled_at: height,
                cycle_length: enrollment.cycle_length,
                commitment: enrollment.commitment,
                enroll_sig: enrollment.enroll_sig.clone(),
            };
            staged.preimage_resets.push(PreImageRow::from_enrollment(&row));
            staged.enrollments.push(row);
        }

        let mut enrollment_rows = self.storage.enrollments_all()?;
        enrollment_rows.extend(staged.enrollments.iter().cloned());
        let committee = active_from_rows(&enrollment_rows, height);
        if block.header.preimages.len() != committee.len() {
            warn!(
                height,
                header = block.header.preimages.len(),
                committee = committee.len(),
                "header pre-image vector does not match committee size"
            );
        }

        let governance_txs = staged.txs.clone();
        for tx_row in &governance_txs {
            self.governance
                .on_tx_committed(&self.storage, &mut staged, tx_row, height)?;
        }
        self.governance.on_height(&self.storage, &mut staged, height)?;

        let mut inserts: Vec<UtxoRow> = created.into_values().collect();
        inserts.sort_by_key(|row| row.utxo_key);
        staged.utxo_inserts = inserts;

        for (address, (balance_delta, frozen_delta)) in balance_deltas {
            let current = self.storage.balance(&address)?;
            let balance = apply_delta(current.balance, balance_delta, &address)?;
            let frozen = apply_delta(current.frozen, frozen_delta, &address)?;
            staged.balances.push((address, BalanceRow { balance, frozen }));
        }

        let mut stats = self.storage.stats()?;
        stats.tx_count += block.txs.len() as u64;
        let (circulating_delta, frozen_delta) = staged_supply_delta(&staged);
        stats.circulating_supply = apply_delta(stats.circulating_supply, circulating_delta, "supply")?;
        stats.frozen_supply = apply_delta(stats.frozen_supply, frozen_delta, "supply")?;
        stats.validator_count = committee.len() as u64;
        staged.stats = Some(stats);

        let stored = StoredBlock {
            hash: block.hash(),
            header: block.header.clone(),
            tx_count: block.txs.len() as u32,
            timestamp,
        };
        staged.block = Some(stored.clone());
        let txs = staged.txs.clone();
        let new_proposals = staged
            .proposals
            .iter()
            .filter(|proposal| proposal.created_at == height)
            .map(|proposal| proposal.proposal_id.clone())
            .collect();

        self.storage.put_block(staged)?;
        *self.tip.write() = Some(BlockMetadata {
            height,
            hash: stored.hash,
            timestamp,
        });

        Ok(CommittedBlock {
            block: stored,
            txs,
            stats,
            new_proposals,
        })
    }
}

fn apply_delta(current: u64, delta: i128, context: &str) -> IndexerResult<u64> {
    let next = current as i128 + delta;
    u64::try_from(next).map_err(|_| {
        IndexerError::InvalidInput(format!("balance underflow for {context}"))
    })
}

/// Net supply movement of one staged block, split by frozen/liquid.
fn staged_supply_delta(staged: &StagedBlock) -> (i128, i128) {
    let mut circulating = 0i128;
    let mut frozen = 0i128;
    for row in &staged.utxo_inserts {
        if row.spent_at.is_some() {
            continue;
        }
        if row.utxo_type == TxType::Freeze {
            frozen += row.amount as i128;
        } else {
            circulating += row.amount as i128;
        }
    }
    for row in &staged.utxo_spends {
        if row.utxo_type == TxType::Freeze {
            frozen -= row.amount as i128;
        } else {
            circulating -= row.amount as i128;
        }
    }
    (circulating, frozen)
}
