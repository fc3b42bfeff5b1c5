//! Real-time EVM chain indexing core: fetch, sequence, extract transfers,
//! and persist, behind a single-writer Orchestrator (spec.md §1-2).

pub mod async_writer;
pub mod backfill;
pub mod checkpoint_file;
pub mod command;
pub mod config;
pub mod consistency;
pub mod error;
pub mod fetcher;
pub mod height_oracle;
pub mod indexer;
pub mod models;
pub mod multicall;
pub mod orchestrator;
pub mod processor;
pub mod rpc;
pub mod sequencer;
pub mod storage;
pub mod tail_follower;

pub use backfill::Backfill;
pub use config::Config;
pub use error::{IndexerError, Result};
pub use indexer::Indexer;
pub use storage::Storage;
