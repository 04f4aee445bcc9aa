#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use ed25519_dalek::Keypair;
use tempfile::TempDir;

use agora_indexer::agora::BlockSource;
use agora_indexer::crypto::{
    address_from_public_key, encrypt_key_derive, generate_keypair, hash_full, hash_multi,
    public_key_from_address, seal_ballot, sign_message, signature_to_hex,
};
use agora_indexer::errors::IndexerResult;
use agora_indexer::events::EventBus;
use agora_indexer::governance::{
    BallotPayload, GovernanceEngine, ProposalFeePayload, ProposalPayload, ProposalType, VoterCard,
};
use agora_indexer::ledger::{ChainParams, Ledger};
use agora_indexer::storage::Storage;
use agora_indexer::types::{
    compute_merkle_root, merkle_path, utxo_key, Block, BlockHeader, Enrollment, Hash, PreImageInfo,
    Transaction, TxInput, TxOutput, TxType,
};

pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;
pub const BLOCK_INTERVAL: u64 = 600;
pub const CYCLE: u64 = 20;
pub const GRACE: u64 = 7;
pub const STAKE: u64 = 40_000;
pub const APP_NAME: &str = "Votera";

/// Output locked to the key behind `address`, the way the consensus node
/// externalizes it.
pub fn key_locked_output(output_type: TxType, address: &str, amount: u64) -> TxOutput {
    let key = public_key_from_address(address).expect("fixture addresses carry keys");
    TxOutput {
        output_type,
        address: address.to_string(),
        amount,
        lock_type: 0,
        lock_bytes: key.as_bytes().to_vec(),
    }
}

/// Full pre-image chain for one enrollment cycle. `values[k]` is the value
/// published for height `anchor + k`; `values[0]` is the commitment.
pub struct PreimageChain {
    values: Vec<Hash>,
}

impl PreimageChain {
    pub fn new(seed: Hash, cycle: u64) -> Self {
        let mut values = vec![seed];
        for _ in 0..cycle {
            let last = *values.last().expect("chain value");
            values.push(Hash(hash_full(last.as_bytes())));
        }
        values.reverse();
        Self { values }
    }

    pub fn commitment(&self) -> Hash {
        self.values[0]
    }

    pub fn at(&self, distance: u64) -> Hash {
        self.values[distance as usize]
    }
}

pub struct TestValidator {
    pub keypair: Keypair,
    pub address: String,
    pub stake_utxo: Hash,
    pub enrolled_at: u64,
    pub chain: PreimageChain,
}

impl TestValidator {
    pub fn enrollment(&self) -> Enrollment {
        Enrollment {
            utxo_key: self.stake_utxo,
            commitment: self.chain.commitment(),
            cycle_length: CYCLE,
            enroll_sig: String::new(),
        }
    }

    /// Reveal published for `height`.
    pub fn preimage(&self, height: u64) -> PreImageInfo {
        PreImageInfo {
            utxo: self.stake_utxo,
            hash: self.chain.at(height - self.enrolled_at),
            height,
        }
    }
}

/// Builds a canonical chain the way the consensus node would externalize
/// it, tracking the funding wallet's spendable outputs along the way.
pub struct TestChain {
    pub blocks: Vec<Block>,
    pub validators: Vec<TestValidator>,
    pub wallet: Keypair,
    pub wallet_address: String,
    wallet_utxos: Vec<(Hash, u64)>,
}

impl TestChain {
    /// Genesis with `validator_count` enrollments plus a funded wallet.
    pub fn new(validator_count: usize) -> Self {
        let wallet = generate_keypair();
        let wallet_address = address_from_public_key(&wallet.public);

        let freeze_outputs: Vec<(Keypair, String)> = (0..validator_count)
            .map(|_| {
                let keypair = generate_keypair();
                let address = address_from_public_key(&keypair.public);
                (keypair, address)
            })
            .collect();

        let stake_tx = Transaction {
            tx_type: TxType::Coinbase,
            inputs: Vec::new(),
            outputs: freeze_outputs
                .iter()
                .map(|(_, address)| key_locked_output(TxType::Freeze, address, STAKE))
                .collect(),
            payload: Vec::new(),
        };
        let funding_tx = Transaction {
            tx_type: TxType::Coinbase,
            inputs: Vec::new(),
            outputs: (0..8)
                .map(|_| key_locked_output(TxType::Payment, &wallet_address, 1_000_000))
                .collect(),
            payload: Vec::new(),
        };

        let stake_tx_hash = stake_tx.hash();
        let mut validators: Vec<TestValidator> = freeze_outputs
            .into_iter()
            .enumerate()
            .map(|(index, (keypair, address))| {
                let seed = Hash(hash_multi(&[b"seed", address.as_bytes()]));
                TestValidator {
                    keypair,
                    address,
                    stake_utxo: utxo_key(&stake_tx_hash, index as u64),
                    enrolled_at: 0,
                    chain: PreimageChain::new(seed, CYCLE),
                }
            })
            .collect();
        validators.sort_by(|a, b| a.address.cmp(&b.address));

        let mut chain = Self {
            blocks: Vec::new(),
            validators,
            wallet,
            wallet_address,
            wallet_utxos: Vec::new(),
        };
        let enrollments: Vec<Enrollment> = chain
            .validators
            .iter()
            .map(TestValidator::enrollment)
            .collect();
        chain.push_block(vec![stake_tx, funding_tx], enrollments);
        chain
    }

    /// Committee pre-image vector for the next block's height.
    fn committee_preimages(&self, height: u64) -> Vec<Hash> {
        let mut committee: Vec<&TestValidator> = self
            .validators
            .iter()
            .filter(|validator| {
                validator.enrolled_at <= height && height <= validator.enrolled_at + CYCLE
            })
            .collect();
        committee.sort_by(|a, b| a.address.cmp(&b.address));
        committee
            .iter()
            .map(|validator| validator.chain.at(height - validator.enrolled_at))
            .collect()
    }

    /// Appends a block carrying `txs` and `enrollments`, maintaining the
    /// wallet's view of its own outputs.
    pub fn push_block(&mut self, txs: Vec<Transaction>, enrollments: Vec<Enrollment>) -> &Block {
        let height = self.blocks.len() as u64;
        let prev_block = self
            .blocks
            .last()
            .map(Block::hash)
            .unwrap_or(Hash::ZERO);
        let tx_hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();

        for (tx, tx_hash) in txs.iter().zip(&tx_hashes) {
            for input in &tx.inputs {
                self.wallet_utxos.retain(|(key, _)| key != &input.utxo);
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                if output.address == self.wallet_address
                    && output.output_type == TxType::Payment
                {
                    self.wallet_utxos
                        .push((utxo_key(tx_hash, index as u64), output.amount));
                }
            }
        }

        let header = BlockHeader {
            height,
            prev_block,
            merkle_root: compute_merkle_root(&tx_hashes),
            signature: String::new(),
            random_seed: Hash(hash_multi(&[b"seed", &height.to_le_bytes()])),
            time_offset: height * BLOCK_INTERVAL,
            enrollments,
            preimages: self.committee_preimages(height),
        };
        self.blocks.push(Block { header, txs });
        self.blocks.last().expect("pushed block")
    }

    pub fn push_empty_block(&mut self) -> &Block {
        self.push_block(Vec::new(), Vec::new())
    }

    pub fn push_empty_blocks_to(&mut self, height: u64) {
        while (self.blocks.len() as u64) <= height {
            self.push_empty_block();
        }
    }

    /// Spends wallet funds into one output at `destination`. The consumed
    /// output is retired immediately so several transactions can be built
    /// for the same block.
    pub fn payment_tx(&mut self, destination: &str, amount: u64, payload: Vec<u8>) -> Transaction {
        let (utxo, available) = self
            .wallet_utxos
            .iter()
            .find(|(_, value)| *value >= amount)
            .copied()
            .expect("wallet can cover the payment");
        self.wallet_utxos.retain(|(key, _)| key != &utxo);
        let change = available - amount - 100;
        Transaction {
            tx_type: TxType::Payment,
            inputs: vec![TxInput {
                utxo,
                unlock: Vec::new(),
            }],
            outputs: vec![
                key_locked_output(TxType::Payment, destination, amount),
                key_locked_output(TxType::Payment, &self.wallet_address, change),
            ],
            payload,
        }
    }

    /// Freezes wallet funds as stake for a brand-new validator; the
    /// enrollment is returned for the carrying block's header.
    pub fn freeze_and_enroll(&mut self, enrolled_at: u64) -> (Transaction, Enrollment) {
        let keypair = generate_keypair();
        let address = address_from_public_key(&keypair.public);
        let (utxo, available) = self
            .wallet_utxos
            .iter()
            .find(|(_, value)| *value >= STAKE)
            .copied()
            .expect("wallet can cover the stake");
        self.wallet_utxos.retain(|(key, _)| key != &utxo);
        let tx = Transaction {
            tx_type: TxType::Freeze,
            inputs: vec![TxInput {
                utxo,
                unlock: Vec::new(),
            }],
            outputs: vec![key_locked_output(TxType::Freeze, &address, available)],
            payload: Vec::new(),
        };
        let stake_utxo = utxo_key(&tx.hash(), 0);
        let seed = Hash(hash_multi(&[b"seed", address.as_bytes()]));
        let validator = TestValidator {
            keypair,
            address,
            stake_utxo,
            enrolled_at,
            chain: PreimageChain::new(seed, CYCLE),
        };
        let enrollment = validator.enrollment();
        self.validators.push(validator);
        (tx, enrollment)
    }

    /// Payload-only transaction (no inputs, no outputs).
    pub fn payload_tx(&self, payload: Vec<u8>) -> Transaction {
        Transaction {
            tx_type: TxType::Payment,
            inputs: Vec::new(),
            outputs: Vec::new(),
            payload,
        }
    }

    pub fn proposal_fee_payload(&self, proposal_id: &str) -> Vec<u8> {
        ProposalFeePayload {
            app_name: APP_NAME.into(),
            proposal_id: proposal_id.into(),
        }
        .encode()
    }

    pub fn proposal_payload(
        &self,
        proposal_id: &str,
        fee_tx_hash: Hash,
        fee_destination: &str,
        proposal_fee: u64,
        vote_start: u64,
        vote_end: u64,
    ) -> Vec<u8> {
        ProposalPayload {
            app_name: APP_NAME.into(),
            proposal_type: ProposalType::Fund,
            proposal_id: proposal_id.into(),
            title: "Treasury disbursement".into(),
            vote_start_height: vote_start,
            vote_end_height: vote_end,
            doc_hash: Hash(hash_multi(&[b"doc", proposal_id.as_bytes()])),
            fund_amount: 10_000_000,
            proposal_fee,
            vote_fee: 100,
            fee_tx_hash,
            proposer_address: self.wallet_address.clone(),
            fee_destination: fee_destination.into(),
        }
        .encode()
    }

    /// Sealed, signed ballot from `validator_index`. The seal key derives
    /// from the voter's pre-image at `vote_end`, so decryption only works
    /// once that reveal is published.
    pub fn ballot_payload(
        &self,
        validator_index: usize,
        proposal_id: &str,
        answer: u8,
        sequence: u32,
        vote_end: u64,
    ) -> Vec<u8> {
        let validator = &self.validators[validator_index];
        let preimage = validator.chain.at(vote_end - validator.enrolled_at);
        let seed = hash_multi(&[preimage.as_bytes(), APP_NAME.as_bytes()]);
        let key = encrypt_key_derive(&seed, proposal_id);
        let encrypted_answer = seal_ballot(&key, &[answer]).expect("seal ballot");

        let temporary = generate_keypair();
        let mut card = VoterCard {
            validator_address: validator.address.clone(),
            temporary_address: address_from_public_key(&temporary.public),
            expires: "2026-12-31T00:00:00Z".into(),
            signature: String::new(),
        };
        card.signature = signature_to_hex(&sign_message(&validator.keypair, &card.signed_bytes()));

        let mut ballot = BallotPayload {
            app_name: APP_NAME.into(),
            proposal_id: proposal_id.into(),
            encrypted_answer,
            voter_card: card,
            sequence,
            signature: String::new(),
        };
        ballot.signature = signature_to_hex(&sign_message(&temporary, &ballot.signed_bytes()));
        ballot.encode()
    }
}

/// In-memory stand-in for the consensus node.
pub struct MemorySource {
    blocks: Mutex<Vec<Block>>,
}

impl MemorySource {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    async fn tip_height(&self) -> IndexerResult<u64> {
        let blocks = self.blocks.lock().expect("source lock");
        Ok(blocks.len().saturating_sub(1) as u64)
    }

    async fn blocks_from(&self, start: u64, max_blocks: u64) -> IndexerResult<Vec<Block>> {
        let blocks = self.blocks.lock().expect("source lock");
        Ok(blocks
            .iter()
            .filter(|block| block.header.height >= start)
            .take(max_blocks as usize)
            .cloned()
            .collect())
    }

    async fn merkle_path(&self, height: u64, tx_hash: &Hash) -> IndexerResult<Vec<Hash>> {
        let blocks = self.blocks.lock().expect("source lock");
        let block = blocks
            .iter()
            .find(|block| block.header.height == height)
            .expect("height served by source");
        let hashes = block.tx_hashes();
        let index = hashes
            .iter()
            .position(|candidate| candidate == tx_hash)
            .expect("tx present in block");
        Ok(merkle_path(&hashes, index))
    }
}

pub struct TestNode {
    pub ledger: Arc<Ledger>,
    pub bus: EventBus,
    _dir: TempDir,
}

pub fn test_node() -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(dir.path()).expect("open storage");
    let params = ChainParams {
        genesis_timestamp: GENESIS_TIMESTAMP,
        block_interval_seconds: BLOCK_INTERVAL,
        validator_cycle: CYCLE,
    };
    let ledger = Ledger::new(storage, params, GovernanceEngine::new(true, GRACE))
        .expect("ledger");
    TestNode {
        ledger: Arc::new(ledger),
        bus: EventBus::default(),
        _dir: dir,
    }
}

/// Commits a prefix of the canonical chain directly through the ledger.
pub fn commit_all(node: &TestNode, blocks: &[Block]) {
    for block in blocks {
        node.ledger.commit_block(block).expect("commit block");
    }
}
