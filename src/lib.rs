//! Indexing service and read API for the Agora consensus network.
//!
//! The crate ingests externalized blocks from a consensus node and keeps a
//! query-friendly projection of the ledger: blocks, transactions, UTXOs,
//! validator enrollments with their pre-image chains, and the governance
//! records (proposals and ballots) carried in transaction payloads.
//!
//! `ingest` serializes all mutation through a single worker fed from the
//! private intake endpoints in `api`; `ledger` stages each block commit and
//! `storage` writes it atomically. `validators` and `governance` are
//! projections over the committed store, and `events` fans committed blocks
//! out to push subscribers. Applications bootstrap through
//! [`config::Config`] and the server entry points in `api`.

pub mod agora;
pub mod api;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod governance;
pub mod ingest;
pub mod ledger;
pub mod storage;
pub mod types;
pub mod validators;
