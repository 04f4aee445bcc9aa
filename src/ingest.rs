use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agora::BlockSource;
use crate::errors::{IndexerError, IndexerResult};
use crate::events::EventBus;
use crate::governance::MetadataClient;
use crate::ledger::{CommittedBlock, Ledger};
use crate::types::{Block, PreImageInfo, Transaction};

/// Upper bound on blocks pulled per recovery pass; larger gaps complete
/// across multiple passes.
pub const MAX_RECOVERY: u64 = 64;

const QUEUE_CAPACITY: usize = 4096;

enum IntakeTask {
    Block(Block),
    PreImage(PreImageInfo),
    PoolTx(Transaction),
}

/// Producer side of the serialized mutator queue. All state-mutating work
/// funnels through it; intake endpoints answer as soon as a task is
/// enqueued.
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<IntakeTask>,
    depth: Arc<AtomicUsize>,
    warn_depth: usize,
}

impl IngestHandle {
    pub async fn submit_block(&self, block: Block) -> IndexerResult<()> {
        self.enqueue(IntakeTask::Block(block)).await
    }

    pub async fn submit_preimage(&self, preimage: PreImageInfo) -> IndexerResult<()> {
        self.enqueue(IntakeTask::PreImage(preimage)).await
    }

    pub async fn submit_pool_tx(&self, tx: Transaction) -> IndexerResult<()> {
        self.enqueue(IntakeTask::PoolTx(tx)).await
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    async fn enqueue(&self, task: IntakeTask) -> IndexerResult<()> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.warn_depth {
            warn!(depth, "intake queue is backed up");
        }
        self.sender.send(task).await.map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            IndexerError::Config("intake queue is closed".into())
        })
    }
}

/// Spawns the single mutator worker. Ordering is FIFO and no two mutator
/// tasks ever run concurrently; a failed commit halts the worker rather
/// than letting the projection drift from the consensus node.
pub fn spawn(
    ledger: Arc<Ledger>,
    source: Arc<dyn BlockSource>,
    bus: EventBus,
    metadata: Option<Arc<MetadataClient>>,
    warn_depth: usize,
) -> (IngestHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
    let depth = Arc::new(AtomicUsize::new(0));
    let handle = IngestHandle {
        sender,
        depth: depth.clone(),
        warn_depth,
    };
    let worker = tokio::spawn(run(receiver, depth, ledger, source, bus, metadata));
    (handle, worker)
}

async fn run(
    mut receiver: mpsc::Receiver<IntakeTask>,
    depth: Arc<AtomicUsize>,
    ledger: Arc<Ledger>,
    source: Arc<dyn BlockSource>,
    bus: EventBus,
    metadata: Option<Arc<MetadataClient>>,
) {
    while let Some(task) = receiver.recv().await {
        depth.fetch_sub(1, Ordering::Relaxed);
        let result = match task {
            IntakeTask::Block(block) => {
                process_block(&ledger, source.as_ref(), &bus, &metadata, block).await
            }
            IntakeTask::PreImage(preimage) => {
                match ledger.update_preimage(&preimage) {
                    Ok(true) => {
                        debug!(utxo = %preimage.utxo, height = preimage.height, "pre-image advanced");
                        Ok(())
                    }
                    // Unknown enrollment or non-monotone tip; out-of-order
                    // delivery is dropped silently.
                    Ok(false) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            IntakeTask::PoolTx(tx) => ledger.record_pool_tx(&tx),
        };
        match result {
            Ok(()) => {}
            Err(IndexerError::Upstream(err)) => {
                warn!(%err, "recovery fetch failed; retrying on next submission");
            }
            Err(err) => {
                error!(?err, "mutator task failed; halting intake worker");
                return;
            }
        }
    }
}

/// Intake algorithm for an externalized block: commit at the expected
/// height, backfill a gap from the consensus node, or drop a duplicate.
async fn process_block(
    ledger: &Ledger,
    source: &dyn BlockSource,
    bus: &EventBus,
    metadata: &Option<Arc<MetadataClient>>,
    block: Block,
) -> IndexerResult<()> {
    let target = block.header.height;
    loop {
        let expected = ledger.expected_height()?;
        if target < expected {
            debug!(height = target, "ignoring re-delivered block");
            return Ok(());
        }
        if target == expected {
            commit_and_emit(ledger, bus, metadata, &block)?;
            return Ok(());
        }
        // Gap: pull the missing range, committing the contiguous prefix.
        // The expected height is re-read each pass because recovery itself
        // advances it.
        let fetched = source
            .blocks_from(expected, MAX_RECOVERY.min(target - expected))
            .await?;
        let mut progressed = false;
        for candidate in fetched {
            if candidate.header.height == ledger.expected_height()? {
                commit_and_emit(ledger, bus, metadata, &candidate)?;
                progressed = true;
            }
        }
        if !progressed {
            warn!(
                expected,
                target, "consensus node could not serve the gap; dropping block"
            );
            return Ok(());
        }
    }
}

fn commit_and_emit(
    ledger: &Ledger,
    bus: &EventBus,
    metadata: &Option<Arc<MetadataClient>>,
    block: &Block,
) -> IndexerResult<()> {
    let committed = ledger.commit_block(block)?;
    info!(
        height = committed.block.header.height,
        txs = committed.txs.len(),
        "committed block"
    );
    bus.publish_commit(&committed);
    enrich_proposals(ledger, metadata, &committed);
    Ok(())
}

/// Kicks off best-effort metadata pulls for proposals this block created.
fn enrich_proposals(
    ledger: &Ledger,
    metadata: &Option<Arc<MetadataClient>>,
    committed: &CommittedBlock,
) {
    let client = match metadata {
        Some(client) => client.clone(),
        None => return,
    };
    for proposal_id in &committed.new_proposals {
        let client = client.clone();
        let storage = ledger.storage().clone();
        let proposal_id = proposal_id.clone();
        tokio::spawn(async move {
            if let Some(record) = client.fetch(&proposal_id).await {
                if let Err(err) = storage.put_proposal_metadata(&proposal_id, record) {
                    warn!(%proposal_id, ?err, "failed to persist proposal metadata");
                }
            }
        });
    }
}

/// Boot-time reconciliation: pulls everything up to the consensus tip
/// before the intake endpoint opens for write traffic.
pub async fn catch_up(
    ledger: &Ledger,
    source: &dyn BlockSource,
    bus: &EventBus,
    metadata: Option<Arc<MetadataClient>>,
) -> IndexerResult<()> {
    let tip = source.tip_height().await?;
    loop {
        let expected = ledger.expected_height()?;
        if expected > tip {
            return Ok(());
        }
        let fetched = source.blocks_from(expected, MAX_RECOVERY).await?;
        let mut progressed = false;
        for candidate in fetched {
            if candidate.header.height == ledger.expected_height()? {
                commit_and_emit(ledger, bus, &metadata, &candidate)?;
                progressed = true;
            }
        }
        if !progressed {
            warn!(expected, tip, "catch-up stalled before the consensus tip");
            return Ok(());
        }
    }
}
