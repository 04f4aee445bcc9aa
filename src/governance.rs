use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{
    encrypt_key_derive, hash_multi, open_ballot, public_key_from_address, signature_from_hex,
    verify_signature,
};
use crate::errors::{IndexerError, IndexerResult};
use crate::storage::{ballot_audit_key, ballot_head_key, StagedBlock, Storage, TxRow};
use crate::types::Hash;
use crate::validators::{active_from_rows, preimage_at};

const TAG_PROPOSAL_FEE: u8 = 0x01;
const TAG_PROPOSAL: u8 = 0x02;
const TAG_BALLOT: u8 = 0x03;

/// Classified transaction payload. Anything that does not decode cleanly is
/// `Unknown` and carries no governance effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    ProposalFee(ProposalFeePayload),
    Proposal(ProposalPayload),
    Ballot(BallotPayload),
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalFeePayload {
    pub app_name: String,
    pub proposal_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalType {
    System,
    Fund,
}

impl ProposalType {
    fn tag(self) -> u8 {
        match self {
            ProposalType::System => 0,
            ProposalType::Fund => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProposalType::System => "System",
            ProposalType::Fund => "Fund",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalPayload {
    pub app_name: String,
    pub proposal_type: ProposalType,
    pub proposal_id: String,
    pub title: String,
    pub vote_start_height: u64,
    pub vote_end_height: u64,
    pub doc_hash: Hash,
    pub fund_amount: u64,
    pub proposal_fee: u64,
    pub vote_fee: u64,
    pub fee_tx_hash: Hash,
    pub proposer_address: String,
    pub fee_destination: String,
}

/// Delegation record authorizing a one-shot temporary key to sign a ballot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCard {
    pub validator_address: String,
    pub temporary_address: String,
    pub expires: String,
    pub signature: String,
}

impl VoterCard {
    /// Bytes covered by the validator's outer signature.
    pub fn signed_bytes(&self) -> [u8; 32] {
        hash_multi(&[
            self.validator_address.as_bytes(),
            self.temporary_address.as_bytes(),
            self.expires.as_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BallotPayload {
    pub app_name: String,
    pub proposal_id: String,
    pub encrypted_answer: Vec<u8>,
    pub voter_card: VoterCard,
    pub sequence: u32,
    pub signature: String,
}

impl BallotPayload {
    /// Bytes covered by the temporary key's inner signature; includes the
    /// card signature so the delegation cannot be swapped out.
    pub fn signed_bytes(&self) -> [u8; 32] {
        hash_multi(&[
            self.app_name.as_bytes(),
            self.proposal_id.as_bytes(),
            &self.encrypted_answer,
            &self.sequence.to_le_bytes(),
            self.voter_card.signature.as_bytes(),
        ])
    }
}

struct PayloadWriter {
    out: Vec<u8>,
}

impl PayloadWriter {
    fn new(tag: u8) -> Self {
        Self { out: vec![tag] }
    }

    fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.out.extend_from_slice(data);
        self
    }

    fn string(&mut self, data: &str) -> &mut Self {
        self.bytes(data.as_bytes())
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.out.push(value);
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.out.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.out.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn hash(&mut self, value: &Hash) -> &mut Self {
        self.out.extend_from_slice(value.as_bytes());
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, len: usize) -> IndexerResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(IndexerError::PayloadDecode("payload truncated".into()));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> IndexerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> IndexerResult<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> IndexerResult<u64> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(u64::from_le_bytes(raw))
    }

    fn bytes(&mut self) -> IndexerResult<Vec<u8>> {
        let raw: [u8; 2] = self.take(2)?.try_into().expect("sized slice");
        let len = u16::from_le_bytes(raw) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> IndexerResult<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|err| IndexerError::PayloadDecode(format!("invalid utf8: {err}")))
    }

    fn hash(&mut self) -> IndexerResult<Hash> {
        let raw: [u8; 32] = self.take(32)?.try_into().expect("sized slice");
        Ok(Hash(raw))
    }

    fn done(&self) -> IndexerResult<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(IndexerError::PayloadDecode("trailing payload bytes".into()))
        }
    }
}

impl ProposalFeePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new(TAG_PROPOSAL_FEE);
        writer.string(&self.app_name).string(&self.proposal_id);
        writer.finish()
    }

    fn decode(reader: &mut PayloadReader<'_>) -> IndexerResult<Self> {
        Ok(Self {
            app_name: reader.string()?,
            proposal_id: reader.string()?,
        })
    }
}

impl ProposalPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new(TAG_PROPOSAL);
        writer
            .string(&self.app_name)
            .u8(self.proposal_type.tag())
            .string(&self.proposal_id)
            .string(&self.title)
            .u64(self.vote_start_height)
            .u64(self.vote_end_height)
            .hash(&self.doc_hash)
            .u64(self.fund_amount)
            .u64(self.proposal_fee)
            .u64(self.vote_fee)
            .hash(&self.fee_tx_hash)
            .string(&self.proposer_address)
            .string(&self.fee_destination);
        writer.finish()
    }

    fn decode(reader: &mut PayloadReader<'_>) -> IndexerResult<Self> {
        let app_name = reader.string()?;
        let proposal_type = match reader.u8()? {
            0 => ProposalType::System,
            1 => ProposalType::Fund,
            other => {
                return Err(IndexerError::PayloadDecode(format!(
                    "unknown proposal type {other}"
                )))
            }
        };
        Ok(Self {
            app_name,
            proposal_type,
            proposal_id: reader.string()?,
            title: reader.string()?,
            vote_start_height: reader.u64()?,
            vote_end_height: reader.u64()?,
            doc_hash: reader.hash()?,
            fund_amount: reader.u64()?,
            proposal_fee: reader.u64()?,
            vote_fee: reader.u64()?,
            fee_tx_hash: reader.hash()?,
            proposer_address: reader.string()?,
            fee_destination: reader.string()?,
        })
    }
}

impl BallotPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new(TAG_BALLOT);
        writer
            .string(&self.app_name)
            .string(&self.proposal_id)
            .bytes(&self.encrypted_answer)
            .string(&self.voter_card.validator_address)
            .string(&self.voter_card.temporary_address)
            .string(&self.voter_card.expires)
            .string(&self.voter_card.signature)
            .u32(self.sequence)
            .string(&self.signature);
        writer.finish()
    }

    fn decode(reader: &mut PayloadReader<'_>) -> IndexerResult<Self> {
        Ok(Self {
            app_name: reader.string()?,
            proposal_id: reader.string()?,
            encrypted_answer: reader.bytes()?,
            voter_card: VoterCard {
                validator_address: reader.string()?,
                temporary_address: reader.string()?,
                expires: reader.string()?,
                signature: reader.string()?,
            },
            sequence: reader.u32()?,
            signature: reader.string()?,
        })
    }
}

/// Tagged-variant decode over raw payload bytes.
pub fn decode_payload(payload: &[u8]) -> PayloadKind {
    let mut reader = PayloadReader::new(payload);
    let tag = match reader.u8() {
        Ok(tag) => tag,
        Err(_) => return PayloadKind::Unknown,
    };
    let decoded = match tag {
        TAG_PROPOSAL_FEE => ProposalFeePayload::decode(&mut reader).map(PayloadKind::ProposalFee),
        TAG_PROPOSAL => ProposalPayload::decode(&mut reader).map(PayloadKind::Proposal),
        TAG_BALLOT => BallotPayload::decode(&mut reader).map(PayloadKind::Ballot),
        _ => return PayloadKind::Unknown,
    };
    match decoded.and_then(|kind| reader.done().map(|_| kind)) {
        Ok(kind) => kind,
        Err(err) => {
            debug!(?err, "payload failed to decode, ignoring");
            PayloadKind::Unknown
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Voting,
    CountingVotes,
    Assessing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalResult {
    Pending,
    Passed,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BallotAnswer {
    /// Accepted but not yet decrypted; voting is still open or counting has
    /// not run.
    Sealed,
    Yes,
    No,
    Blank,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    OutsideWindow,
    UnknownProposal,
    InvalidCardSignature,
    InvalidBallotSignature,
    NotValidator,
    StaleSequence,
    Undecodable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalMetadata {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Tally {
    pub yes: u64,
    pub no: u64,
    pub blank: u64,
    pub rejected: u64,
    pub committee_size: u64,
    pub tallied_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalRow {
    pub proposal_id: String,
    pub app_name: String,
    pub proposal_type: ProposalType,
    pub title: String,
    pub proposer_address: String,
    pub fee_destination: String,
    pub fee_tx_hash: Hash,
    /// Hash of the declaration transaction.
    pub tx_hash: Hash,
    pub created_at: u64,
    pub vote_start_height: u64,
    pub vote_end_height: u64,
    pub doc_hash: Hash,
    pub fund_amount: u64,
    pub proposal_fee: u64,
    pub vote_fee: u64,
    pub result: ProposalResult,
    pub tally: Option<Tally>,
    pub metadata: Option<ProposalMetadata>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeeMarkerRow {
    pub app_name: String,
    pub proposal_id: String,
    pub tx_hash: Hash,
    pub block_height: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BallotRow {
    pub proposal_id: String,
    pub app_name: String,
    pub validator_address: String,
    pub block_height: u64,
    pub tx_hash: Hash,
    pub encrypted_ballot: Vec<u8>,
    pub voter_card: VoterCard,
    pub sequence: u32,
    pub answer: BallotAnswer,
    pub reject_reason: Option<RejectReason>,
}

/// Pointer to the currently winning ballot of one validator on one
/// proposal (last write wins under the monotone sequence rule).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BallotHeadRow {
    pub proposal_id: String,
    pub validator_address: String,
    /// Stake UTXO of the enrollment the voter was active under; keys the
    /// pre-image chain used for decryption.
    pub utxo_key: Hash,
    pub audit_key: Vec<u8>,
    pub sequence: u32,
    pub block_height: u64,
}

/// Status is a pure function of the proposal row and the ledger height; no
/// background process fires transitions.
pub fn proposal_status(row: &ProposalRow, height: u64, grace_blocks: u64) -> ProposalStatus {
    if row.result != ProposalResult::Pending {
        return ProposalStatus::Closed;
    }
    if height < row.vote_start_height {
        ProposalStatus::Pending
    } else if height <= row.vote_end_height {
        ProposalStatus::Voting
    } else if height < row.vote_end_height + grace_blocks {
        ProposalStatus::CountingVotes
    } else {
        ProposalStatus::Assessing
    }
}

pub struct GovernanceEngine {
    enabled: bool,
    grace_blocks: u64,
}

impl GovernanceEngine {
    pub fn new(enabled: bool, grace_blocks: u64) -> Self {
        Self {
            enabled,
            grace_blocks,
        }
    }

    pub fn grace_blocks(&self) -> u64 {
        self.grace_blocks
    }

    /// Classifies one committed transaction and stages its governance
    /// effect. Runs inside the block commit; every staged row lands in the
    /// same write batch as the block itself.
    pub fn on_tx_committed(
        &self,
        storage: &Storage,
        staged: &mut StagedBlock,
        tx: &TxRow,
        height: u64,
    ) -> IndexerResult<()> {
        if !self.enabled || tx.payload.is_empty() {
            return Ok(());
        }
        match decode_payload(&tx.payload) {
            PayloadKind::ProposalFee(fee) => {
                staged.fee_markers.push(FeeMarkerRow {
                    app_name: fee.app_name,
                    proposal_id: fee.proposal_id,
                    tx_hash: tx.hash,
                    block_height: height,
                });
            }
            PayloadKind::Proposal(declaration) => {
                self.materialize_proposal(storage, staged, tx, height, declaration)?;
            }
            PayloadKind::Ballot(ballot) => {
                self.record_ballot(storage, staged, tx, height, ballot)?;
            }
            PayloadKind::Unknown => {}
        }
        Ok(())
    }

    fn materialize_proposal(
        &self,
        storage: &Storage,
        staged: &mut StagedBlock,
        tx: &TxRow,
        height: u64,
        declaration: ProposalPayload,
    ) -> IndexerResult<()> {
        if declaration.vote_start_height >= declaration.vote_end_height {
            warn!(proposal = %declaration.proposal_id, "proposal window is empty, skipping");
            return Ok(());
        }
        if find_proposal(storage, staged, &declaration.proposal_id)?.is_some() {
            warn!(proposal = %declaration.proposal_id, "duplicate proposal declaration, skipping");
            return Ok(());
        }
        let marker = staged
            .fee_markers
            .iter()
            .find(|marker| marker.tx_hash == declaration.fee_tx_hash)
            .cloned()
            .or(storage.fee_marker(&declaration.fee_tx_hash)?);
        let marker = match marker {
            Some(marker)
                if marker.app_name == declaration.app_name
                    && marker.proposal_id == declaration.proposal_id =>
            {
                marker
            }
            _ => {
                warn!(proposal = %declaration.proposal_id, "no matching fee marker, skipping");
                return Ok(());
            }
        };
        let paid = find_tx(storage, staged, &marker.tx_hash)?
            .map(|fee_tx| {
                fee_tx
                    .outputs
                    .iter()
                    .filter(|output| output.address == declaration.fee_destination)
                    .map(|output| output.amount)
                    .sum::<u64>()
            })
            .unwrap_or(0);
        if paid < declaration.proposal_fee {
            warn!(
                proposal = %declaration.proposal_id,
                paid,
                required = declaration.proposal_fee,
                "insufficient proposal fee, skipping"
            );
            return Ok(());
        }
        staged.proposals.push(ProposalRow {
            proposal_id: declaration.proposal_id,
            app_name: declaration.app_name,
            proposal_type: declaration.proposal_type,
            title: declaration.title,
            proposer_address: declaration.proposer_address,
            fee_destination: declaration.fee_destination,
            fee_tx_hash: declaration.fee_tx_hash,
            tx_hash: tx.hash,
            created_at: height,
            vote_start_height: declaration.vote_start_height,
            vote_end_height: declaration.vote_end_height,
            doc_hash: declaration.doc_hash,
            fund_amount: declaration.fund_amount,
            proposal_fee: declaration.proposal_fee,
            vote_fee: declaration.vote_fee,
            result: ProposalResult::Pending,
            tally: None,
            metadata: None,
        });
        Ok(())
    }

    /// Applies the ballot acceptance rules in order. Every ballot persists
    /// for audit; failures are stamped REJECT instead of erroring.
    fn record_ballot(
        &self,
        storage: &Storage,
        staged: &mut StagedBlock,
        tx: &TxRow,
        height: u64,
        ballot: BallotPayload,
    ) -> IndexerResult<()> {
        let audit_key = ballot_audit_key(&ballot.proposal_id, height, tx.index);
        let mut row = BallotRow {
            proposal_id: ballot.proposal_id.clone(),
            app_name: ballot.app_name.clone(),
            validator_address: ballot.voter_card.validator_address.clone(),
            block_height: height,
            tx_hash: tx.hash,
            encrypted_ballot: ballot.encrypted_answer.clone(),
            voter_card: ballot.voter_card.clone(),
            sequence: ballot.sequence,
            answer: BallotAnswer::Sealed,
            reject_reason: None,
        };

        let verdict = self.validate_ballot(storage, staged, &ballot, height);
        match verdict {
            Ok(utxo_key) => {
                staged.ballot_heads.push((
                    ballot_head_key(&row.proposal_id, &row.validator_address),
                    BallotHeadRow {
                        proposal_id: row.proposal_id.clone(),
                        validator_address: row.validator_address.clone(),
                        utxo_key,
                        audit_key: audit_key.clone(),
                        sequence: row.sequence,
                        block_height: height,
                    },
                ));
            }
            Err(reason) => {
                row.answer = BallotAnswer::Reject;
                row.reject_reason = Some(reason);
            }
        }
        staged.ballots.push((audit_key, row));
        Ok(())
    }

    fn validate_ballot(
        &self,
        storage: &Storage,
        staged: &StagedBlock,
        ballot: &BallotPayload,
        height: u64,
    ) -> Result<Hash, RejectReason> {
        let proposal = match find_proposal(storage, staged, &ballot.proposal_id) {
            Ok(Some(proposal)) => proposal,
            _ => return Err(RejectReason::UnknownProposal),
        };
        if height < proposal.vote_start_height || height > proposal.vote_end_height {
            return Err(RejectReason::OutsideWindow);
        }

        let card = &ballot.voter_card;
        let card_valid = public_key_from_address(&card.validator_address)
            .and_then(|key| {
                let signature = signature_from_hex(&card.signature)?;
                verify_signature(&key, &card.signed_bytes(), &signature)
            })
            .is_ok();
        if !card_valid {
            return Err(RejectReason::InvalidCardSignature);
        }
        let ballot_valid = public_key_from_address(&card.temporary_address)
            .and_then(|key| {
                let signature = signature_from_hex(&ballot.signature)?;
                verify_signature(&key, &ballot.signed_bytes(), &signature)
            })
            .is_ok();
        if !ballot_valid {
            return Err(RejectReason::InvalidBallotSignature);
        }

        let mut rows = storage
            .enrollments_all()
            .map_err(|_| RejectReason::NotValidator)?;
        rows.extend(staged.enrollments.iter().cloned());
        let committee = active_from_rows(&rows, height);
        let member = committee
            .iter()
            .find(|row| row.address == card.validator_address)
            .ok_or(RejectReason::NotValidator)?;

        let head = staged
            .ballot_heads
            .iter()
            .rev()
            .map(|(_, head)| head)
            .find(|head| {
                head.proposal_id == ballot.proposal_id
                    && head.validator_address == card.validator_address
            })
            .map(|head| head.sequence)
            .or(storage
                .ballot_head(&ballot.proposal_id, &card.validator_address)
                .ok()
                .flatten()
                .map(|head| head.sequence));
        if let Some(sequence) = head {
            if ballot.sequence < sequence {
                return Err(RejectReason::StaleSequence);
            }
        }
        Ok(member.utxo_key)
    }

    /// Height-driven transitions: runs the deferred tally for every
    /// proposal whose grace window closes at `height`.
    pub fn on_height(
        &self,
        storage: &Storage,
        staged: &mut StagedBlock,
        height: u64,
    ) -> IndexerResult<()> {
        if !self.enabled {
            return Ok(());
        }
        for proposal in storage.proposals_all()? {
            if proposal.result != ProposalResult::Pending {
                continue;
            }
            if height == proposal.vote_end_height + self.grace_blocks {
                self.tally(storage, staged, proposal, height)?;
            }
        }
        Ok(())
    }

    fn tally(
        &self,
        storage: &Storage,
        staged: &mut StagedBlock,
        mut proposal: ProposalRow,
        height: u64,
    ) -> IndexerResult<()> {
        let committee = active_from_rows(
            &storage.enrollments_all()?,
            proposal.vote_start_height,
        );
        let committee_size = committee.len() as u64;

        let mut yes = 0u64;
        let mut no = 0u64;
        let mut blank = 0u64;
        let mut rejected = 0u64;
        for head in storage.ballot_heads_for_proposal(&proposal.proposal_id)? {
            let mut row = match storage.ballot(&head.audit_key)? {
                Some(row) => row,
                None => continue,
            };
            let answer = self.decode_answer(storage, &proposal, &head, &row);
            match answer {
                BallotAnswer::Yes => yes += 1,
                BallotAnswer::No => no += 1,
                BallotAnswer::Blank => blank += 1,
                BallotAnswer::Reject => rejected += 1,
                BallotAnswer::Sealed => unreachable!("decode always resolves"),
            }
            row.answer = answer;
            if answer == BallotAnswer::Reject {
                row.reject_reason = Some(RejectReason::Undecodable);
            }
            staged.ballots.push((head.audit_key.clone(), row));
        }

        let voted = yes + no + blank;
        let quorum = committee_size.div_ceil(3);
        proposal.result = if yes > no && voted >= quorum {
            ProposalResult::Passed
        } else {
            ProposalResult::Rejected
        };
        proposal.tally = Some(Tally {
            yes,
            no,
            blank,
            rejected,
            committee_size,
            tallied_at: height,
        });
        staged.proposals.push(proposal);
        Ok(())
    }

    fn decode_answer(
        &self,
        storage: &Storage,
        proposal: &ProposalRow,
        head: &BallotHeadRow,
        row: &BallotRow,
    ) -> BallotAnswer {
        let preimage = storage
            .preimage(&head.utxo_key)
            .ok()
            .flatten()
            .and_then(|chain| preimage_at(&chain, proposal.vote_end_height));
        let preimage = match preimage {
            Some(preimage) => preimage,
            None => return BallotAnswer::Reject,
        };
        let seed = hash_multi(&[preimage.as_bytes(), proposal.app_name.as_bytes()]);
        let key = encrypt_key_derive(&seed, &proposal.proposal_id);
        match open_ballot(&key, &row.encrypted_ballot).as_deref() {
            Ok([0]) => BallotAnswer::Yes,
            Ok([1]) => BallotAnswer::No,
            Ok([2]) => BallotAnswer::Blank,
            _ => BallotAnswer::Reject,
        }
    }
}

/// Out-of-band pull of human-readable proposal metadata. Decoupled from
/// consensus correctness: a missing record never blocks a transition.
pub struct MetadataClient {
    endpoint: String,
    http: reqwest::Client,
}

impl MetadataClient {
    pub fn new(endpoint: &str) -> IndexerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| {
                IndexerError::Config(format!("unable to build metadata client: {err}"))
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn fetch(&self, proposal_id: &str) -> Option<ProposalMetadata> {
        let response = self
            .http
            .get(format!("{}/proposal/{proposal_id}", self.endpoint))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match response {
            Ok(response) => match response.json().await {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    debug!(%proposal_id, ?err, "metadata response failed to decode");
                    None
                }
            },
            Err(err) => {
                debug!(%proposal_id, ?err, "metadata fetch failed");
                None
            }
        }
    }
}

fn find_proposal(
    storage: &Storage,
    staged: &StagedBlock,
    proposal_id: &str,
) -> IndexerResult<Option<ProposalRow>> {
    if let Some(row) = staged
        .proposals
        .iter()
        .find(|row| row.proposal_id == proposal_id)
    {
        return Ok(Some(row.clone()));
    }
    storage.proposal(proposal_id)
}

fn find_tx(storage: &Storage, staged: &StagedBlock, hash: &Hash) -> IndexerResult<Option<TxRow>> {
    if let Some(row) = staged.txs.iter().find(|row| &row.hash == hash) {
        return Ok(Some(row.clone()));
    }
    storage.tx_by_hash(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proposal() -> ProposalPayload {
        ProposalPayload {
            app_name: "Votera".into(),
            proposal_type: ProposalType::Fund,
            proposal_id: "469008972006".into(),
            title: "Treasury disbursement".into(),
            vote_start_height: 10,
            vote_end_height: 15,
            doc_hash: Hash([5u8; 32]),
            fund_amount: 10_000_000,
            proposal_fee: 100_000,
            vote_fee: 100,
            fee_tx_hash: Hash([6u8; 32]),
            proposer_address: "boa0a".into(),
            fee_destination: "boa0b".into(),
        }
    }

    #[test]
    fn payload_codec_round_trips_every_kind() {
        let fee = ProposalFeePayload {
            app_name: "Votera".into(),
            proposal_id: "469008972006".into(),
        };
        assert_eq!(
            decode_payload(&fee.encode()),
            PayloadKind::ProposalFee(fee)
        );

        let proposal = sample_proposal();
        assert_eq!(
            decode_payload(&proposal.encode()),
            PayloadKind::Proposal(proposal)
        );

        let ballot = BallotPayload {
            app_name: "Votera".into(),
            proposal_id: "469008972006".into(),
            encrypted_answer: vec![1, 2, 3],
            voter_card: VoterCard {
                validator_address: "boa01".into(),
                temporary_address: "boa02".into(),
                expires: "2026-09-01T00:00:00Z".into(),
                signature: "aa".into(),
            },
            sequence: 3,
            signature: "bb".into(),
        };
        assert_eq!(decode_payload(&ballot.encode()), PayloadKind::Ballot(ballot));
    }

    #[test]
    fn garbage_payloads_classify_as_unknown() {
        assert_eq!(decode_payload(&[]), PayloadKind::Unknown);
        assert_eq!(decode_payload(&[0x7f, 1, 2]), PayloadKind::Unknown);
        // Valid tag, truncated body.
        assert_eq!(decode_payload(&[TAG_PROPOSAL, 4, 0]), PayloadKind::Unknown);
        // Trailing bytes after a valid record.
        let mut encoded = ProposalFeePayload {
            app_name: "Votera".into(),
            proposal_id: "1".into(),
        }
        .encode();
        encoded.push(0);
        assert_eq!(decode_payload(&encoded), PayloadKind::Unknown);
    }

    #[test]
    fn status_is_a_pure_function_of_height() {
        let declaration = sample_proposal();
        let row = ProposalRow {
            proposal_id: declaration.proposal_id.clone(),
            app_name: declaration.app_name.clone(),
            proposal_type: declaration.proposal_type,
            title: declaration.title.clone(),
            proposer_address: declaration.proposer_address.clone(),
            fee_destination: declaration.fee_destination.clone(),
            fee_tx_hash: declaration.fee_tx_hash,
            tx_hash: Hash([7u8; 32]),
            created_at: 5,
            vote_start_height: 10,
            vote_end_height: 15,
            doc_hash: declaration.doc_hash,
            fund_amount: declaration.fund_amount,
            proposal_fee: declaration.proposal_fee,
            vote_fee: declaration.vote_fee,
            result: ProposalResult::Pending,
            tally: None,
            metadata: None,
        };
        assert_eq!(proposal_status(&row, 9, 7), ProposalStatus::Pending);
        assert_eq!(proposal_status(&row, 10, 7), ProposalStatus::Voting);
        assert_eq!(proposal_status(&row, 15, 7), ProposalStatus::Voting);
        assert_eq!(proposal_status(&row, 16, 7), ProposalStatus::CountingVotes);
        assert_eq!(proposal_status(&row, 21, 7), ProposalStatus::CountingVotes);
        assert_eq!(proposal_status(&row, 22, 7), ProposalStatus::Assessing);

        let closed = ProposalRow {
            result: ProposalResult::Passed,
            ..row
        };
        assert_eq!(proposal_status(&closed, 12, 7), ProposalStatus::Closed);
    }
}
