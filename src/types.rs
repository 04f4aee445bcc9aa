use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{hash_full, hash_multi};
use crate::errors::{IndexerError, IndexerResult};

/// Fixed-width opaque hash. The store and all in-memory values hold the
/// canonical orientation; the external boundary (JSON bodies, URL params)
/// uses little-endian hex, so codecs reverse the byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(data: &str) -> IndexerResult<Self> {
        let trimmed = data.strip_prefix("0x").unwrap_or(data);
        let bytes = hex::decode(trimmed)
            .map_err(|err| IndexerError::InvalidInput(format!("invalid hash encoding: {err}")))?;
        let mut raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IndexerError::InvalidInput("hash must encode 32 bytes".into()))?;
        raw.reverse();
        Ok(Hash(raw))
    }

    pub fn to_hex(&self) -> String {
        let mut raw = self.0;
        raw.reverse();
        format!("0x{}", hex::encode(raw))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let raw = String::deserialize(deserializer)?;
            Hash::from_hex(&raw).map_err(D::Error::custom)
        } else {
            let raw = <Vec<u8>>::deserialize(deserializer)?;
            let bytes: [u8; 32] = raw
                .try_into()
                .map_err(|_| D::Error::custom("hash must hold 32 bytes"))?;
            Ok(Hash(bytes))
        }
    }
}

/// Hex codec for opaque byte payloads at the JSON boundary.
pub mod hexbytes {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let raw = String::deserialize(deserializer)?;
            let trimmed = raw.strip_prefix("0x").unwrap_or(&raw);
            hex::decode(trimmed).map_err(D::Error::custom)
        } else {
            <Vec<u8>>::deserialize(deserializer)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Payment,
    Freeze,
    Coinbase,
}

impl TxType {
    fn tag(self) -> u8 {
        match self {
            TxType::Payment => 0,
            TxType::Freeze => 1,
            TxType::Coinbase => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TxType::Payment => "Payment",
            TxType::Freeze => "Freeze",
            TxType::Coinbase => "Coinbase",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Key of the consumed UTXO.
    pub utxo: Hash,
    #[serde(default, with = "hexbytes")]
    pub unlock: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(rename = "type")]
    pub output_type: TxType,
    pub address: String,
    pub amount: u64,
    #[serde(default)]
    pub lock_type: u8,
    #[serde(default, with = "hexbytes")]
    pub lock_bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(default, with = "hexbytes")]
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Canonical serialization used for hashing and sizing; stable across
    /// wire representations.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.tx_type.tag());
        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            out.extend_from_slice(input.utxo.as_bytes());
            out.extend_from_slice(&(input.unlock.len() as u32).to_le_bytes());
            out.extend_from_slice(&input.unlock);
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.push(output.output_type.tag());
            out.extend_from_slice(&(output.address.len() as u32).to_le_bytes());
            out.extend_from_slice(output.address.as_bytes());
            out.extend_from_slice(&output.amount.to_le_bytes());
            out.push(output.lock_type);
            out.extend_from_slice(&(output.lock_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&output.lock_bytes);
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn hash(&self) -> Hash {
        Hash(hash_full(&self.canonical_bytes()))
    }

    pub fn size(&self) -> u64 {
        self.canonical_bytes().len() as u64
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }
}

/// Key under which an output is tracked as a UTXO.
pub fn utxo_key(tx_hash: &Hash, output_index: u64) -> Hash {
    Hash(hash_multi(&[
        tx_hash.as_bytes(),
        &output_index.to_le_bytes(),
    ]))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Frozen stake backing the enrollment.
    pub utxo_key: Hash,
    /// Anchor of the pre-image chain: H^cycle of the validator's secret.
    pub commitment: Hash,
    pub cycle_length: u64,
    pub enroll_sig: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    pub signature: String,
    pub random_seed: Hash,
    /// Seconds since the genesis timestamp.
    pub time_offset: u64,
    #[serde(default)]
    pub enrollments: Vec<Enrollment>,
    /// Pre-images revealed for this height, in canonical committee order;
    /// the zero hash marks a validator whose reveal was not seen.
    #[serde(default)]
    pub preimages: Vec<Hash>,
}

impl BlockHeader {
    /// Block hash covers the consensus-relevant header fields, not the
    /// signature over them.
    pub fn hash(&self) -> Hash {
        Hash(hash_multi(&[
            &self.height.to_le_bytes(),
            self.prev_block.as_bytes(),
            self.merkle_root.as_bytes(),
            self.random_seed.as_bytes(),
            &self.time_offset.to_le_bytes(),
        ]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.txs.iter().map(Transaction::hash).collect()
    }
}

/// Wire form of a pre-image reveal, as delivered to the private intake
/// endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImageInfo {
    /// Stake UTXO of the enrollment the reveal belongs to.
    pub utxo: Hash,
    pub hash: Hash,
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub hash: Hash,
    pub timestamp: u64,
}

fn hash_nodes(left: &Hash, right: &Hash) -> Hash {
    Hash(hash_multi(&[left.as_bytes(), right.as_bytes()]))
}

/// Bottom-up pairwise Merkle root; an odd node is paired with itself.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_nodes(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

/// Sibling-hash sequence for the leaf at `index`, suitable for SPV clients.
pub fn merkle_path(hashes: &[Hash], index: usize) -> Vec<Hash> {
    let mut path = Vec::new();
    let mut level = hashes.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = position ^ 1;
        let node = level.get(sibling).unwrap_or(&level[position]);
        path.push(*node);
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_nodes(&pair[0], right));
        }
        level = next;
        position /= 2;
    }
    path
}

/// Standard Merkle audit-path fold: the low bit of the index at each level
/// decides pair order.
pub fn fold_merkle_path(leaf: &Hash, path: &[Hash], index: usize) -> Hash {
    let mut acc = *leaf;
    let mut position = index;
    for sibling in path {
        acc = if position & 1 == 0 {
            hash_nodes(&acc, sibling)
        } else {
            hash_nodes(sibling, &acc)
        };
        position /= 2;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    #[test]
    fn hash_hex_reverses_byte_order_at_the_boundary() {
        let mut raw = [0u8; 32];
        raw[0] = 0xab;
        let hash = Hash(raw);
        let encoded = hash.to_hex();
        assert!(encoded.ends_with("ab"));
        assert_eq!(Hash::from_hex(&encoded).expect("decode"), hash);
    }

    #[test]
    fn merkle_path_folds_back_to_the_root() {
        let leaves: Vec<Hash> = (0..7u8).map(leaf).collect();
        let root = compute_merkle_root(&leaves);
        for (index, tx_hash) in leaves.iter().enumerate() {
            let path = merkle_path(&leaves, index);
            assert_eq!(fold_merkle_path(tx_hash, &path, index), root);
        }
    }

    #[test]
    fn tx_hash_is_stable_across_wire_round_trips() {
        let tx = Transaction {
            tx_type: TxType::Payment,
            inputs: vec![TxInput {
                utxo: leaf(1),
                unlock: vec![1, 2, 3],
            }],
            outputs: vec![TxOutput {
                output_type: TxType::Payment,
                address: "boa00".into(),
                amount: 500,
                lock_type: 0,
                lock_bytes: vec![9, 9],
            }],
            payload: b"tagged".to_vec(),
        };
        let encoded = serde_json::to_string(&tx).expect("encode");
        let decoded: Transaction = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.size(), tx.size());
    }

    #[test]
    fn utxo_keys_differ_per_output_index() {
        let tx_hash = leaf(9);
        assert_ne!(utxo_key(&tx_hash, 0), utxo_key(&tx_hash, 1));
    }
}
