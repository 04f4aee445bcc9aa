use serde::Serialize;
use tokio::sync::broadcast;

use crate::ledger::CommittedBlock;
use crate::storage::StatsRow;
use crate::types::Hash;

/// Events pushed to subscribed clients, once per committed block, in
/// commit order.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    NewBlock {
        height: u64,
        hash: Hash,
        merkle_root: Hash,
        time: u64,
    },
    NewTransaction {
        txs: Vec<TxEventItem>,
    },
    LatestStats {
        stats: StatsView,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct TxEventItem {
    pub height: u64,
    pub block_hash: Hash,
    pub tx_hash: Hash,
    #[serde(rename = "type")]
    pub tx_type: &'static str,
    pub amount: String,
    pub fee: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsView {
    pub height: u64,
    pub transactions: u64,
    pub validators: u64,
    pub frozen_coin: String,
    pub circulating_supply: String,
}

impl StatsView {
    pub fn from_row(height: u64, stats: &StatsRow) -> Self {
        Self {
            height,
            transactions: stats.tx_count,
            validators: stats.validator_count,
            frozen_coin: stats.frozen_supply.to_string(),
            circulating_supply: stats.circulating_supply.to_string(),
        }
    }
}

/// Best-effort fan-out. A slow or closed subscriber loses events rather
/// than holding up the mutator track.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BusEvent) {
        // No subscribers is fine; fan-out carries no delivery guarantee.
        let _ = self.sender.send(event);
    }

    /// Emits the per-commit event triple after the store write returned.
    /// Each channel fires exactly once per block; an empty block carries an
    /// empty transaction list.
    pub fn publish_commit(&self, committed: &CommittedBlock) {
        let block = &committed.block;
        self.emit(BusEvent::NewBlock {
            height: block.header.height,
            hash: block.hash,
            merkle_root: block.header.merkle_root,
            time: block.timestamp,
        });
        let txs = committed
            .txs
            .iter()
            .map(|tx| TxEventItem {
                height: tx.block_height,
                block_hash: block.hash,
                tx_hash: tx.hash,
                tx_type: tx.tx_type.name(),
                amount: tx
                    .outputs
                    .iter()
                    .map(|output| output.amount)
                    .sum::<u64>()
                    .to_string(),
                fee: tx.fee.to_string(),
            })
            .collect();
        self.emit(BusEvent::NewTransaction { txs });
        self.emit(BusEvent::LatestStats {
            stats: StatsView::from_row(block.header.height, &committed.stats),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_live_subscribers_in_order() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        bus.emit(BusEvent::NewBlock {
            height: 1,
            hash: Hash::ZERO,
            merkle_root: Hash::ZERO,
            time: 600,
        });
        bus.emit(BusEvent::LatestStats {
            stats: StatsView::from_row(1, &StatsRow::default()),
        });
        match receiver.try_recv().expect("first event") {
            BusEvent::NewBlock { height, .. } => assert_eq!(height, 1),
            other => panic!("unexpected event {other:?}"),
        }
        match receiver.try_recv().expect("second event") {
            BusEvent::LatestStats { stats } => assert_eq!(stats.height, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        bus.emit(BusEvent::NewTransaction { txs: Vec::new() });
    }
}
