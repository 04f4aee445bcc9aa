use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::hash_full;
use crate::errors::IndexerResult;
use crate::storage::Storage;
use crate::types::{Hash, PreImageInfo};

/// Persisted enrollment. `enrolled_at` is the height of the block that
/// carried it; re-enrollment appends a new row for the same stake UTXO.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentRow {
    pub utxo_key: Hash,
    pub address: String,
    pub stake: u64,
    pub enrolled_at: u64,
    pub cycle_length: u64,
    pub commitment: Hash,
    pub enroll_sig: String,
}

impl EnrollmentRow {
    /// Active window of this enrollment, both bounds inclusive.
    pub fn covers(&self, height: u64) -> bool {
        self.enrolled_at <= height && height <= self.enrolled_at + self.cycle_length
    }
}

/// Pre-image chain state for one enrollment: the anchor commitment plus the
/// newest published tip. Earlier heights are derived on demand.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreImageRow {
    pub utxo_key: Hash,
    pub address: String,
    pub anchor_height: u64,
    pub commitment: Hash,
    pub cycle_length: u64,
    pub tip_hash: Hash,
    pub tip_height: u64,
}

impl PreImageRow {
    /// Row as reset at (re-)enrollment: the tip starts at the anchor.
    pub fn from_enrollment(enrollment: &EnrollmentRow) -> Self {
        Self {
            utxo_key: enrollment.utxo_key,
            address: enrollment.address.clone(),
            anchor_height: enrollment.enrolled_at,
            commitment: enrollment.commitment,
            cycle_length: enrollment.cycle_length,
            tip_hash: enrollment.commitment,
            tip_height: enrollment.enrolled_at,
        }
    }
}

/// Hashing a published value steps one height down the chain.
fn step(value: &Hash) -> Hash {
    Hash(hash_full(value.as_bytes()))
}

/// Pre-image for `target`, derived by re-hashing the tip
/// `tip_height − target` times. None outside the published range.
pub fn preimage_at(row: &PreImageRow, target: u64) -> Option<Hash> {
    if target < row.anchor_height || target > row.tip_height {
        return None;
    }
    let mut value = row.tip_hash;
    for _ in target..row.tip_height {
        value = step(&value);
    }
    Some(value)
}

/// Applies a pre-image reveal. Reveals for unknown enrollments are dropped
/// (out-of-order delivery); reveals that do not hash back to the anchor
/// commitment are dropped with a warning. Returns whether a row changed.
pub fn apply_preimage(storage: &Storage, info: &PreImageInfo) -> IndexerResult<bool> {
    let row = match storage.preimage(&info.utxo)? {
        Some(row) => row,
        None => return Ok(false),
    };
    if info.height < row.anchor_height || info.height > row.anchor_height + row.cycle_length {
        return Ok(false);
    }
    let mut value = info.hash;
    for _ in row.anchor_height..info.height {
        value = step(&value);
    }
    if value != row.commitment {
        warn!(utxo = %info.utxo, height = info.height, "pre-image does not match enrollment commitment");
        return Ok(false);
    }
    storage.update_preimage(&info.utxo, info.hash, info.height)
}

/// Active validators among `rows` at `height`: per stake UTXO, the latest
/// enrollment not after `height`, kept when its window covers `height`.
/// Result is in canonical committee order (by address).
pub fn active_from_rows(rows: &[EnrollmentRow], height: u64) -> Vec<EnrollmentRow> {
    let mut latest: HashMap<Hash, &EnrollmentRow> = HashMap::new();
    for row in rows {
        if row.enrolled_at > height {
            continue;
        }
        match latest.get(&row.utxo_key) {
            Some(existing) if existing.enrolled_at >= row.enrolled_at => {}
            _ => {
                latest.insert(row.utxo_key, row);
            }
        }
    }
    let mut active: Vec<EnrollmentRow> = latest
        .into_values()
        .filter(|row| row.covers(height))
        .cloned()
        .collect();
    active.sort_by(|a, b| a.address.cmp(&b.address));
    active
}

/// Committee at `height` from the store.
pub fn active_validators(storage: &Storage, height: u64) -> IndexerResult<Vec<EnrollmentRow>> {
    let rows = storage.enrollments_all()?;
    Ok(active_from_rows(&rows, height))
}

/// Committee at `height`, restricted to validators whose pre-image chain
/// already reaches `height`.
pub fn available_validators(storage: &Storage, height: u64) -> IndexerResult<Vec<EnrollmentRow>> {
    let mut available = Vec::new();
    for row in active_validators(storage, height)? {
        let reaches = storage
            .preimage(&row.utxo_key)?
            .map(|preimage| preimage.tip_height >= height)
            .unwrap_or(false);
        if reaches {
            available.push(row);
        }
    }
    Ok(available)
}
