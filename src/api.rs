use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::agora::BlockSource;
use crate::errors::{IndexerError, IndexerResult};
use crate::events::{EventBus, StatsView};
use crate::governance::{proposal_status, ProposalResult, ProposalStatus, ProposalType, Tally};
use crate::ingest::IngestHandle;
use crate::ledger::Ledger;
use crate::storage::{StoredBlock, TxRow, UtxoRow};
use crate::types::{fold_merkle_path, utxo_key, Block, Hash, PreImageInfo, Transaction};
use crate::validators::{active_validators, preimage_at};

const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 10;
/// Flat per-byte fee rate used by the estimation endpoint.
const FEE_RATE_PER_BYTE: u64 = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub ledger: Arc<Ledger>,
    pub ingest: IngestHandle,
    pub bus: EventBus,
    pub source: Arc<dyn BlockSource>,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

fn bad_request(reason: impl Into<String>) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: reason.into(),
        }),
    )
}

fn no_content(reason: impl Into<String>) -> HttpError {
    (
        StatusCode::NO_CONTENT,
        Json(ErrorResponse {
            error: reason.into(),
        }),
    )
}

fn to_http_error(err: IndexerError) -> HttpError {
    match err {
        IndexerError::NotFound(reason) => no_content(reason),
        IndexerError::InvalidInput(reason) | IndexerError::PayloadDecode(reason) => {
            bad_request(reason)
        }
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: other.to_string(),
            }),
        ),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<i64>,
    #[serde(rename = "pageSize")]
    page_size: Option<i64>,
}

#[derive(Clone, Copy)]
struct Pagination {
    page: u64,
    page_size: u64,
}

impl Pagination {
    fn from_query(page: Option<i64>, page_size: Option<i64>) -> Result<Self, HttpError> {
        let page = page.unwrap_or(1);
        if page <= 0 {
            return Err(bad_request("page must be a positive integer"));
        }
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size <= 0 || page_size > MAX_PAGE_SIZE {
            return Err(bad_request(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self {
            page: page as u64,
            page_size: page_size as u64,
        })
    }

    fn offset(&self) -> u64 {
        (self.page - 1) * self.page_size
    }

    fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset() as usize)
            .take(self.page_size as usize)
            .cloned()
            .collect()
    }
}

/// Height parameters are strict: decimal digits only, nothing else.
fn parse_height(raw: &Option<String>) -> Result<Option<u64>, HttpError> {
    match raw {
        None => Ok(None),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad_request(format!("invalid height: {value}")));
            }
            trimmed
                .parse()
                .map(Some)
                .map_err(|_| bad_request(format!("invalid height: {value}")))
        }
    }
}

fn parse_hash(raw: &str) -> Result<Hash, HttpError> {
    Hash::from_hex(raw).map_err(|err| bad_request(err.to_string()))
}

#[derive(Deserialize)]
struct HeightQuery {
    height: Option<String>,
}

#[derive(Deserialize)]
struct BlockRefQuery {
    height: Option<String>,
    hash: Option<String>,
    page: Option<i64>,
    #[serde(rename = "pageSize")]
    page_size: Option<i64>,
}

fn resolve_block(
    context: &ApiContext,
    height: &Option<String>,
    hash: &Option<String>,
) -> Result<StoredBlock, HttpError> {
    let storage = context.ledger.storage();
    let height = match (parse_height(height)?, hash) {
        (Some(height), _) => height,
        (None, Some(hash)) => {
            let hash = parse_hash(hash)?;
            storage
                .height_by_hash(&hash)
                .map_err(to_http_error)?
                .ok_or_else(|| no_content("block not found"))?
        }
        (None, None) => return Err(bad_request("height or hash parameter required")),
    };
    storage
        .block_by_height(height)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("block not found"))
}

pub async fn serve_public(context: ApiContext, addr: SocketAddr) -> IndexerResult<()> {
    let router = Router::new()
        .route("/health", get(health))
        .route("/block_height", get(block_height))
        .route("/block_height_at/:time", get(block_height_at))
        .route("/validators", get(validators))
        .route("/validator/:address", get(validator))
        .route("/transaction/:hash", get(transaction))
        .route("/transaction/pending/:hash", get(transaction_pending))
        .route("/transaction/status/:hash", get(transaction_status))
        .route("/transaction/fees/:tx_size", get(transaction_fees))
        .route("/utxo/:address", get(utxos_by_address))
        .route("/utxos", post(utxos_by_keys))
        .route("/wallet/transactions/history/:address", get(wallet_history))
        .route("/wallet/transaction/overview/:hash", get(wallet_overview))
        .route("/wallet/transactions/pending/:address", get(wallet_pending))
        .route("/wallet/blocks/header", get(wallet_block_header))
        .route("/latest-blocks", get(latest_blocks))
        .route("/latest-transactions", get(latest_transactions))
        .route("/block-summary", get(block_summary))
        .route("/block-enrollments", get(block_enrollments))
        .route("/block-transactions", get(block_transactions))
        .route("/boa-stats", get(boa_stats))
        .route("/holders", get(holders))
        .route("/spv/:hash", get(spv))
        .route("/proposals", get(proposals))
        .route("/proposal/:proposal_id", get(proposal))
        .route("/ws", get(websocket))
        .with_state(context);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "public API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| IndexerError::Io(std::io::Error::other(err)))
}

pub async fn serve_private(context: ApiContext, addr: SocketAddr) -> IndexerResult<()> {
    let router = Router::new()
        .route("/block_externalized", post(block_externalized))
        .route("/preimage_received", post(preimage_received))
        .route("/transaction_received", post(transaction_received))
        .with_state(context);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "private intake API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| IndexerError::Io(std::io::Error::other(err)))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    height: Option<u64>,
}

async fn health(State(context): State<ApiContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        height: context.ledger.tip().map(|tip| tip.height),
    })
}

async fn block_height(State(context): State<ApiContext>) -> Result<Json<u64>, HttpError> {
    match context.ledger.tip() {
        Some(tip) => Ok(Json(tip.height)),
        None => Err(no_content("no blocks committed yet")),
    }
}

async fn block_height_at(
    State(context): State<ApiContext>,
    Path(time): Path<String>,
) -> Result<Json<u64>, HttpError> {
    let unix_seconds = parse_height(&Some(time))?.expect("height parsed from present value");
    match context
        .ledger
        .height_at_time(unix_seconds)
        .map_err(to_http_error)?
    {
        Some(height) => Ok(Json(height)),
        None => Err(no_content("no block existed at that time")),
    }
}

#[derive(Serialize)]
struct PreImageView {
    height: u64,
    hash: Hash,
}

#[derive(Serialize)]
struct ValidatorView {
    address: String,
    enrolled_at: u64,
    stake: String,
    cycle_length: u64,
    preimage: PreImageView,
}

fn validator_views(context: &ApiContext, height: u64) -> Result<Vec<ValidatorView>, HttpError> {
    let storage = context.ledger.storage();
    let mut views = Vec::new();
    for row in active_validators(storage, height).map_err(to_http_error)? {
        let revealed = storage
            .preimage(&row.utxo_key)
            .map_err(to_http_error)?
            .and_then(|chain| preimage_at(&chain, height))
            .unwrap_or(Hash::ZERO);
        views.push(ValidatorView {
            address: row.address,
            enrolled_at: row.enrolled_at,
            stake: row.stake.to_string(),
            cycle_length: row.cycle_length,
            preimage: PreImageView {
                height,
                hash: revealed,
            },
        });
    }
    Ok(views)
}

fn requested_or_tip_height(
    context: &ApiContext,
    query: &HeightQuery,
) -> Result<u64, HttpError> {
    match parse_height(&query.height)? {
        Some(height) => Ok(height),
        None => context
            .ledger
            .tip()
            .map(|tip| tip.height)
            .ok_or_else(|| no_content("no blocks committed yet")),
    }
}

async fn validators(
    State(context): State<ApiContext>,
    Query(query): Query<HeightQuery>,
) -> Result<Json<Vec<ValidatorView>>, HttpError> {
    let height = requested_or_tip_height(&context, &query)?;
    let views = validator_views(&context, height)?;
    if views.is_empty() {
        return Err(no_content("no validators at the requested height"));
    }
    Ok(Json(views))
}

async fn validator(
    State(context): State<ApiContext>,
    Path(address): Path<String>,
    Query(query): Query<HeightQuery>,
) -> Result<Json<ValidatorView>, HttpError> {
    let height = requested_or_tip_height(&context, &query)?;
    validator_views(&context, height)?
        .into_iter()
        .find(|view| view.address == address)
        .map(Json)
        .ok_or_else(|| no_content("validator not active at the requested height"))
}

#[derive(Serialize)]
struct TxInputView {
    utxo: Hash,
    address: String,
    amount: String,
}

#[derive(Serialize)]
struct TxOutputView {
    #[serde(rename = "type")]
    output_type: &'static str,
    address: String,
    amount: String,
    utxo: Hash,
}

#[derive(Serialize)]
struct TxDetailView {
    tx_hash: Hash,
    height: u64,
    time: u64,
    #[serde(rename = "type")]
    tx_type: &'static str,
    fee: String,
    size: u64,
    inputs: Vec<TxInputView>,
    outputs: Vec<TxOutputView>,
    #[serde(with = "crate::types::hexbytes")]
    payload: Vec<u8>,
}

fn tx_detail(row: &TxRow) -> TxDetailView {
    TxDetailView {
        tx_hash: row.hash,
        height: row.block_height,
        time: row.timestamp,
        tx_type: row.tx_type.name(),
        fee: row.fee.to_string(),
        size: row.size,
        inputs: row
            .inputs
            .iter()
            .map(|input| TxInputView {
                utxo: input.utxo,
                address: input.address.clone(),
                amount: input.amount.to_string(),
            })
            .collect(),
        outputs: row
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| TxOutputView {
                output_type: output.output_type.name(),
                address: output.address.clone(),
                amount: output.amount.to_string(),
                utxo: utxo_key(&row.hash, index as u64),
            })
            .collect(),
        payload: row.payload.clone(),
    }
}

async fn transaction(
    State(context): State<ApiContext>,
    Path(hash): Path<String>,
) -> Result<Json<TxDetailView>, HttpError> {
    let hash = parse_hash(&hash)?;
    let row = context
        .ledger
        .storage()
        .tx_by_hash(&hash)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("transaction not found"))?;
    Ok(Json(tx_detail(&row)))
}

#[derive(Serialize)]
struct PendingTxView {
    tx_hash: Hash,
    #[serde(rename = "type")]
    tx_type: &'static str,
    submission_time: u64,
    tx: Transaction,
}

async fn transaction_pending(
    State(context): State<ApiContext>,
    Path(hash): Path<String>,
) -> Result<Json<PendingTxView>, HttpError> {
    let hash = parse_hash(&hash)?;
    let row = context
        .ledger
        .storage()
        .pool_tx(&hash)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("transaction not in the pool"))?;
    Ok(Json(PendingTxView {
        tx_hash: row.hash,
        tx_type: row.tx.tx_type.name(),
        submission_time: row.received_at,
        tx: row.tx,
    }))
}

#[derive(Serialize)]
struct TxStatusView {
    status: &'static str,
    tx_hash: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_hash: Option<Hash>,
}

async fn transaction_status(
    State(context): State<ApiContext>,
    Path(hash): Path<String>,
) -> Result<Json<TxStatusView>, HttpError> {
    let hash = parse_hash(&hash)?;
    let storage = context.ledger.storage();
    if let Some(row) = storage.tx_by_hash(&hash).map_err(to_http_error)? {
        let block = storage
            .block_by_height(row.block_height)
            .map_err(to_http_error)?
            .ok_or_else(|| no_content("block not found"))?;
        return Ok(Json(TxStatusView {
            status: "confirmed",
            tx_hash: hash,
            height: Some(row.block_height),
            block_hash: Some(block.hash),
        }));
    }
    if storage.pool_tx(&hash).map_err(to_http_error)?.is_some() {
        return Ok(Json(TxStatusView {
            status: "pending",
            tx_hash: hash,
            height: None,
            block_hash: None,
        }));
    }
    Err(no_content("transaction not found"))
}

#[derive(Serialize)]
struct FeeView {
    tx_size: u64,
    low: String,
    medium: String,
    high: String,
}

async fn transaction_fees(Path(tx_size): Path<String>) -> Result<Json<FeeView>, HttpError> {
    let tx_size = parse_height(&Some(tx_size))?.expect("size parsed from present value");
    if tx_size == 0 {
        return Err(bad_request("tx size must be positive"));
    }
    let medium = tx_size * FEE_RATE_PER_BYTE;
    Ok(Json(FeeView {
        tx_size,
        low: (medium * 9 / 10).to_string(),
        medium: medium.to_string(),
        high: (medium * 11 / 10).to_string(),
    }))
}

#[derive(Serialize)]
struct UtxoView {
    utxo: Hash,
    #[serde(rename = "type")]
    utxo_type: &'static str,
    amount: String,
    height: u64,
    time: u64,
    unlock_height: u64,
    lock_type: u8,
    #[serde(with = "crate::types::hexbytes")]
    lock_bytes: Vec<u8>,
}

fn utxo_view(context: &ApiContext, row: &UtxoRow) -> Result<UtxoView, HttpError> {
    let time = context
        .ledger
        .storage()
        .block_by_height(row.created_at)
        .map_err(to_http_error)?
        .map(|block| block.timestamp)
        .unwrap_or(0);
    Ok(UtxoView {
        utxo: row.utxo_key,
        utxo_type: row.utxo_type.name(),
        amount: row.amount.to_string(),
        height: row.created_at,
        time,
        unlock_height: row.unlock_height,
        lock_type: row.lock_type,
        lock_bytes: row.lock_bytes.clone(),
    })
}

async fn utxos_by_address(
    State(context): State<ApiContext>,
    Path(address): Path<String>,
) -> Result<Json<Vec<UtxoView>>, HttpError> {
    let rows = context
        .ledger
        .storage()
        .utxos_by_address(&address)
        .map_err(to_http_error)?;
    let views = rows
        .iter()
        .map(|row| utxo_view(&context, row))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

#[derive(Deserialize)]
struct UtxoBatchRequest {
    utxos: Vec<String>,
}

async fn utxos_by_keys(
    State(context): State<ApiContext>,
    Json(request): Json<UtxoBatchRequest>,
) -> Result<Json<Vec<UtxoView>>, HttpError> {
    let mut views = Vec::new();
    for raw in &request.utxos {
        let key = parse_hash(raw)?;
        if let Some(row) = context.ledger.storage().utxo(&key).map_err(to_http_error)? {
            views.push(utxo_view(&context, &row)?);
        }
    }
    Ok(Json(views))
}

#[derive(Deserialize)]
struct HistoryQuery {
    page: Option<i64>,
    #[serde(rename = "pageSize")]
    page_size: Option<i64>,
    #[serde(rename = "type")]
    tx_types: Option<String>,
    #[serde(rename = "beginDate")]
    begin_date: Option<String>,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
    peer: Option<String>,
}

#[derive(Clone, Serialize)]
struct HistoryItem {
    height: u64,
    time: u64,
    tx_hash: Hash,
    #[serde(rename = "type")]
    display_type: &'static str,
    amount: String,
    unlock_height: u64,
    peer: String,
    peer_count: u64,
    tx_fee: String,
    full_count: u64,
}

fn classify_history(row: &TxRow, net: i128) -> &'static str {
    match row.tx_type {
        crate::types::TxType::Freeze => "freeze",
        _ if !row.payload.is_empty() => "payload",
        _ if net >= 0 => "inbound",
        _ => "outbound",
    }
}

async fn wallet_history(
    State(context): State<ApiContext>,
    Path(address): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryItem>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let type_filter: Option<Vec<String>> = match &query.tx_types {
        None => None,
        Some(raw) => {
            let mut kinds = Vec::new();
            for kind in raw.split(',') {
                let kind = kind.trim().to_lowercase();
                if !matches!(kind.as_str(), "inbound" | "outbound" | "freeze" | "payload") {
                    return Err(bad_request(format!("invalid history type: {kind}")));
                }
                kinds.push(kind);
            }
            Some(kinds)
        }
    };
    let begin = parse_height(&query.begin_date)?;
    let end = parse_height(&query.end_date)?;

    let storage = context.ledger.storage();
    let mut items = Vec::new();
    for (height, _index, entry) in storage.address_txs(&address).map_err(to_http_error)? {
        let row = storage
            .tx_by_hash(&entry.tx_hash)
            .map_err(to_http_error)?
            .ok_or_else(|| no_content("transaction index out of sync"))?;
        if begin.is_some_and(|begin| row.timestamp < begin) {
            continue;
        }
        if end.is_some_and(|end| row.timestamp > end) {
            continue;
        }
        let received: i128 = row
            .outputs
            .iter()
            .filter(|output| output.address == address)
            .map(|output| output.amount as i128)
            .sum();
        let sent: i128 = row
            .inputs
            .iter()
            .filter(|input| input.address == address)
            .map(|input| input.amount as i128)
            .sum();
        let net = received - sent;
        let display_type = classify_history(&row, net);
        if let Some(kinds) = &type_filter {
            if !kinds.iter().any(|kind| kind == display_type) {
                continue;
            }
        }
        let mut peers: Vec<&str> = row
            .outputs
            .iter()
            .map(|output| output.address.as_str())
            .chain(row.inputs.iter().map(|input| input.address.as_str()))
            .filter(|peer| *peer != address)
            .collect();
        peers.sort();
        peers.dedup();
        let peer = peers.first().copied().unwrap_or(address.as_str()).to_string();
        if let Some(filter) = &query.peer {
            if !peer.contains(filter.as_str()) {
                continue;
            }
        }
        items.push(HistoryItem {
            height,
            time: row.timestamp,
            tx_hash: row.hash,
            display_type,
            amount: net.to_string(),
            unlock_height: height + 1,
            peer,
            peer_count: peers.len() as u64,
            tx_fee: row.fee.to_string(),
            full_count: 0,
        });
    }
    items.reverse();
    let full_count = items.len() as u64;
    let mut page = pagination.slice(&items);
    for item in &mut page {
        item.full_count = full_count;
    }
    Ok(Json(page))
}

#[derive(Serialize)]
struct OverviewSender {
    address: String,
    amount: String,
    utxo: Hash,
}

#[derive(Serialize)]
struct OverviewReceiver {
    #[serde(rename = "type")]
    output_type: &'static str,
    address: String,
    amount: String,
    utxo: Hash,
    index: u32,
}

#[derive(Serialize)]
struct TxOverview {
    height: u64,
    time: u64,
    tx_hash: Hash,
    #[serde(rename = "type")]
    tx_type: &'static str,
    tx_size: u64,
    unlock_height: u64,
    unlock_time: u64,
    #[serde(with = "crate::types::hexbytes")]
    payload: Vec<u8>,
    senders: Vec<OverviewSender>,
    receivers: Vec<OverviewReceiver>,
    fee: String,
}

async fn wallet_overview(
    State(context): State<ApiContext>,
    Path(hash): Path<String>,
) -> Result<Json<TxOverview>, HttpError> {
    let hash = parse_hash(&hash)?;
    let row = context
        .ledger
        .storage()
        .tx_by_hash(&hash)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("transaction not found"))?;
    let interval = context.ledger.params().block_interval_seconds;
    Ok(Json(TxOverview {
        height: row.block_height,
        time: row.timestamp,
        tx_hash: row.hash,
        tx_type: row.tx_type.name(),
        tx_size: row.size,
        unlock_height: row.block_height + 1,
        unlock_time: row.timestamp + interval,
        payload: row.payload.clone(),
        senders: row
            .inputs
            .iter()
            .map(|input| OverviewSender {
                address: input.address.clone(),
                amount: input.amount.to_string(),
                utxo: input.utxo,
            })
            .collect(),
        receivers: row
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| OverviewReceiver {
                output_type: output.output_type.name(),
                address: output.address.clone(),
                amount: output.amount.to_string(),
                utxo: utxo_key(&row.hash, index as u64),
                index: index as u32,
            })
            .collect(),
        fee: row.fee.to_string(),
    }))
}

#[derive(Serialize)]
struct PendingWalletTx {
    tx_hash: Hash,
    submission_time: u64,
    amount: String,
    fee: String,
}

async fn wallet_pending(
    State(context): State<ApiContext>,
    Path(address): Path<String>,
) -> Result<Json<Vec<PendingWalletTx>>, HttpError> {
    let storage = context.ledger.storage();
    let mut views = Vec::new();
    for row in storage.pool_txs().map_err(to_http_error)? {
        if !row.addresses.iter().any(|candidate| candidate == &address) {
            continue;
        }
        let mut input_sum: u64 = 0;
        for input in &row.tx.inputs {
            if let Some(source) = storage.utxo(&input.utxo).map_err(to_http_error)? {
                input_sum = input_sum.saturating_add(source.amount);
            }
        }
        let output_sum = row.tx.output_sum();
        views.push(PendingWalletTx {
            tx_hash: row.hash,
            submission_time: row.received_at,
            amount: output_sum.to_string(),
            fee: input_sum.saturating_sub(output_sum).to_string(),
        });
    }
    Ok(Json(views))
}

#[derive(Serialize)]
struct BlockHeaderView {
    height: u64,
    hash: Hash,
    merkle_root: Hash,
    signature: String,
    random_seed: Hash,
    time: u64,
    enrollment_count: u64,
}

fn block_header_view(block: &StoredBlock) -> BlockHeaderView {
    BlockHeaderView {
        height: block.header.height,
        hash: block.hash,
        merkle_root: block.header.merkle_root,
        signature: block.header.signature.clone(),
        random_seed: block.header.random_seed,
        time: block.timestamp,
        enrollment_count: block.header.enrollments.len() as u64,
    }
}

async fn wallet_block_header(
    State(context): State<ApiContext>,
    Query(query): Query<HeightQuery>,
) -> Result<Json<BlockHeaderView>, HttpError> {
    let height = requested_or_tip_height(&context, &query)?;
    let block = context
        .ledger
        .storage()
        .block_by_height(height)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("block not found"))?;
    Ok(Json(block_header_view(&block)))
}

#[derive(Serialize)]
struct LatestBlockItem {
    #[serde(flatten)]
    header: BlockHeaderView,
    tx_count: u32,
    full_count: u64,
}

async fn latest_blocks(
    State(context): State<ApiContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<LatestBlockItem>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let (rows, full_count) = context
        .ledger
        .storage()
        .blocks_page_desc(pagination.offset(), pagination.page_size)
        .map_err(to_http_error)?;
    Ok(Json(
        rows.iter()
            .map(|block| LatestBlockItem {
                header: block_header_view(block),
                tx_count: block.tx_count,
                full_count,
            })
            .collect(),
    ))
}

#[derive(Clone, Serialize)]
struct LatestTxItem {
    height: u64,
    tx_hash: Hash,
    #[serde(rename = "type")]
    tx_type: &'static str,
    amount: String,
    tx_fee: String,
    tx_size: u64,
    time: u64,
    full_count: u64,
}

fn latest_tx_item(row: &TxRow, full_count: u64) -> LatestTxItem {
    LatestTxItem {
        height: row.block_height,
        tx_hash: row.hash,
        tx_type: row.tx_type.name(),
        amount: row
            .outputs
            .iter()
            .map(|output| output.amount)
            .sum::<u64>()
            .to_string(),
        tx_fee: row.fee.to_string(),
        tx_size: row.size,
        time: row.timestamp,
        full_count,
    }
}

async fn latest_transactions(
    State(context): State<ApiContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<LatestTxItem>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let (rows, full_count) = context
        .ledger
        .storage()
        .txs_page_desc(pagination.offset(), pagination.page_size)
        .map_err(to_http_error)?;
    Ok(Json(
        rows.iter()
            .map(|row| latest_tx_item(row, full_count))
            .collect(),
    ))
}

#[derive(Serialize)]
struct BlockSummaryView {
    height: u64,
    hash: Hash,
    prev_hash: Hash,
    merkle_root: Hash,
    signature: String,
    random_seed: Hash,
    time: u64,
    tx_count: u32,
    enrollment_count: u64,
    total_sent: String,
    total_fee: String,
    total_size: u64,
}

async fn block_summary(
    State(context): State<ApiContext>,
    Query(query): Query<BlockRefQuery>,
) -> Result<Json<BlockSummaryView>, HttpError> {
    let block = resolve_block(&context, &query.height, &query.hash)?;
    let txs = context
        .ledger
        .storage()
        .txs_for_block(block.header.height)
        .map_err(to_http_error)?;
    let total_sent: u64 = txs
        .iter()
        .flat_map(|row| row.outputs.iter())
        .map(|output| output.amount)
        .sum();
    let total_fee: u64 = txs.iter().map(|row| row.fee).sum();
    let total_size: u64 = txs.iter().map(|row| row.size).sum();
    Ok(Json(BlockSummaryView {
        height: block.header.height,
        hash: block.hash,
        prev_hash: block.header.prev_block,
        merkle_root: block.header.merkle_root,
        signature: block.header.signature.clone(),
        random_seed: block.header.random_seed,
        time: block.timestamp,
        tx_count: block.tx_count,
        enrollment_count: block.header.enrollments.len() as u64,
        total_sent: total_sent.to_string(),
        total_fee: total_fee.to_string(),
        total_size,
    }))
}

#[derive(Clone, Serialize)]
struct BlockEnrollmentItem {
    height: u64,
    utxo: Hash,
    commitment: Hash,
    cycle_length: u64,
    enroll_sig: String,
    full_count: u64,
}

async fn block_enrollments(
    State(context): State<ApiContext>,
    Query(query): Query<BlockRefQuery>,
) -> Result<Json<Vec<BlockEnrollmentItem>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let block = resolve_block(&context, &query.height, &query.hash)?;
    let full_count = block.header.enrollments.len() as u64;
    let items: Vec<BlockEnrollmentItem> = block
        .header
        .enrollments
        .iter()
        .map(|enrollment| BlockEnrollmentItem {
            height: block.header.height,
            utxo: enrollment.utxo_key,
            commitment: enrollment.commitment,
            cycle_length: enrollment.cycle_length,
            enroll_sig: enrollment.enroll_sig.clone(),
            full_count,
        })
        .collect();
    Ok(Json(pagination.slice(&items)))
}

async fn block_transactions(
    State(context): State<ApiContext>,
    Query(query): Query<BlockRefQuery>,
) -> Result<Json<Vec<LatestTxItem>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let block = resolve_block(&context, &query.height, &query.hash)?;
    let rows = context
        .ledger
        .storage()
        .txs_for_block(block.header.height)
        .map_err(to_http_error)?;
    let full_count = rows.len() as u64;
    let items: Vec<LatestTxItem> = rows
        .iter()
        .map(|row| latest_tx_item(row, full_count))
        .collect();
    Ok(Json(pagination.slice(&items)))
}

async fn boa_stats(State(context): State<ApiContext>) -> Result<Json<StatsView>, HttpError> {
    let tip = context
        .ledger
        .tip()
        .ok_or_else(|| no_content("no blocks committed yet"))?;
    let stats = context.ledger.storage().stats().map_err(to_http_error)?;
    Ok(Json(StatsView::from_row(tip.height, &stats)))
}

#[derive(Clone, Serialize)]
struct HolderView {
    address: String,
    total_balance: String,
    total_spendable: String,
    total_frozen: String,
    percentage: String,
    full_count: u64,
}

async fn holders(
    State(context): State<ApiContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<HolderView>>, HttpError> {
    let pagination = Pagination::from_query(query.page, query.page_size)?;
    let mut balances = context
        .ledger
        .storage()
        .balances_all()
        .map_err(to_http_error)?;
    balances.retain(|(_, row)| row.balance + row.frozen > 0);
    balances.sort_by(|a, b| {
        (b.1.balance + b.1.frozen)
            .cmp(&(a.1.balance + a.1.frozen))
            .then_with(|| a.0.cmp(&b.0))
    });
    let supply: u64 = balances.iter().map(|(_, row)| row.balance + row.frozen).sum();
    let full_count = balances.len() as u64;
    let items: Vec<HolderView> = balances
        .iter()
        .map(|(address, row)| {
            let total = row.balance + row.frozen;
            let hundredths = if supply == 0 {
                0
            } else {
                (total as u128 * 10_000 / supply as u128) as u64
            };
            HolderView {
                address: address.clone(),
                total_balance: total.to_string(),
                total_spendable: row.balance.to_string(),
                total_frozen: row.frozen.to_string(),
                percentage: format!("{}.{:02}", hundredths / 100, hundredths % 100),
                full_count,
            }
        })
        .collect();
    Ok(Json(pagination.slice(&items)))
}

#[derive(Serialize)]
struct SpvView {
    result: bool,
    message: String,
}

async fn spv(
    State(context): State<ApiContext>,
    Path(hash): Path<String>,
) -> Result<Json<SpvView>, HttpError> {
    let hash = parse_hash(&hash)?;
    let storage = context.ledger.storage();
    let row = storage
        .tx_by_hash(&hash)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("transaction not found"))?;
    let block = storage
        .block_by_height(row.block_height)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("block not found"))?;
    let path = context
        .source
        .merkle_path(row.block_height, &hash)
        .await
        .map_err(to_http_error)?;
    let root = fold_merkle_path(&hash, &path, row.index as usize);
    if root == block.header.merkle_root {
        Ok(Json(SpvView {
            result: true,
            message: "Success".into(),
        }))
    } else {
        Ok(Json(SpvView {
            result: false,
            message: "Verification failed".into(),
        }))
    }
}

#[derive(Serialize)]
struct ProposalListItem {
    proposal_id: String,
    proposal_type: &'static str,
    title: String,
    status: ProposalStatus,
    result: ProposalResult,
    proposer_address: String,
    fund_amount: String,
    proposal_fee: String,
    vote_start_height: u64,
    vote_end_height: u64,
    created_at: u64,
}

#[derive(Serialize)]
struct ProposalDetailView {
    #[serde(flatten)]
    summary: ProposalListItem,
    app_name: String,
    fee_destination: String,
    fee_tx_hash: Hash,
    tx_hash: Hash,
    doc_hash: Hash,
    vote_fee: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tally: Option<Tally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<crate::governance::ProposalMetadata>,
}

fn proposal_summary(
    context: &ApiContext,
    row: &crate::governance::ProposalRow,
    tip_height: u64,
) -> ProposalListItem {
    let grace = context.ledger.governance().grace_blocks();
    ProposalListItem {
        proposal_id: row.proposal_id.clone(),
        proposal_type: match row.proposal_type {
            ProposalType::System => "System",
            ProposalType::Fund => "Fund",
        },
        title: row
            .metadata
            .as_ref()
            .map(|metadata| metadata.title.clone())
            .unwrap_or_else(|| row.title.clone()),
        status: proposal_status(row, tip_height, grace),
        result: row.result,
        proposer_address: row.proposer_address.clone(),
        fund_amount: row.fund_amount.to_string(),
        proposal_fee: row.proposal_fee.to_string(),
        vote_start_height: row.vote_start_height,
        vote_end_height: row.vote_end_height,
        created_at: row.created_at,
    }
}

async fn proposals(
    State(context): State<ApiContext>,
) -> Result<Json<Vec<ProposalListItem>>, HttpError> {
    let tip_height = context.ledger.tip().map(|tip| tip.height).unwrap_or(0);
    let mut rows = context
        .ledger
        .storage()
        .proposals_all()
        .map_err(to_http_error)?;
    rows.sort_by_key(|row| std::cmp::Reverse(row.created_at));
    Ok(Json(
        rows.iter()
            .map(|row| proposal_summary(&context, row, tip_height))
            .collect(),
    ))
}

async fn proposal(
    State(context): State<ApiContext>,
    Path(proposal_id): Path<String>,
) -> Result<Json<ProposalDetailView>, HttpError> {
    let tip_height = context.ledger.tip().map(|tip| tip.height).unwrap_or(0);
    let row = context
        .ledger
        .storage()
        .proposal(&proposal_id)
        .map_err(to_http_error)?
        .ok_or_else(|| no_content("proposal not found"))?;
    Ok(Json(ProposalDetailView {
        summary: proposal_summary(&context, &row, tip_height),
        app_name: row.app_name.clone(),
        fee_destination: row.fee_destination.clone(),
        fee_tx_hash: row.fee_tx_hash,
        tx_hash: row.tx_hash,
        doc_hash: row.doc_hash,
        vote_fee: row.vote_fee.to_string(),
        tally: row.tally,
        metadata: row.metadata.clone(),
    }))
}

async fn websocket(State(context): State<ApiContext>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| push_events(socket, context.bus.clone()))
}

async fn push_events(mut socket: WebSocket, bus: EventBus) {
    let mut receiver = bus.subscribe();
    loop {
        match receiver.recv().await {
            Ok(event) => {
                let encoded = match serde_json::to_string(&event) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        debug!(?err, "failed to encode push event");
                        continue;
                    }
                };
                if socket.send(Message::Text(encoded)).await.is_err() {
                    return;
                }
            }
            // A slow subscriber loses events rather than blocking commits.
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "push subscriber lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
}

fn accepted() -> Json<AcceptedResponse> {
    Json(AcceptedResponse { status: "accepted" })
}

fn extract_field<T: for<'de> Deserialize<'de>>(
    body: &serde_json::Value,
    field: &'static str,
) -> Result<T, HttpError> {
    let value = body
        .get(field)
        .ok_or_else(|| bad_request(format!("missing field: {field}")))?;
    serde_json::from_value(value.clone())
        .map_err(|err| bad_request(format!("malformed {field}: {err}")))
}

async fn block_externalized(
    State(context): State<ApiContext>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AcceptedResponse>, HttpError> {
    let block: Block = extract_field(&body, "block")?;
    context
        .ingest
        .submit_block(block)
        .await
        .map_err(to_http_error)?;
    Ok(accepted())
}

async fn preimage_received(
    State(context): State<ApiContext>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AcceptedResponse>, HttpError> {
    let preimage: PreImageInfo = extract_field(&body, "preimage")?;
    context
        .ingest
        .submit_preimage(preimage)
        .await
        .map_err(to_http_error)?;
    Ok(accepted())
}

async fn transaction_received(
    State(context): State<ApiContext>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AcceptedResponse>, HttpError> {
    let tx: Transaction = extract_field(&body, "tx")?;
    context
        .ingest
        .submit_pool_tx(tx)
        .await
        .map_err(to_http_error)?;
    Ok(accepted())
}
