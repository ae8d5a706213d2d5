//! Block-range crawler: fetch blocks over JSON-RPC, normalize their
//! transactions and commit them idempotently to SQLite.

pub mod config;
pub mod crawler;
pub mod fetcher;
pub mod normalizer;
pub mod retry;
pub mod summary;
pub mod writer;

pub use crawler::{CrawlSettings, Crawler};
pub use fetcher::RpcClient;
pub use normalizer::AmountUnit;
pub use summary::{BlockOutcome, RunStatus, RunSummary};
pub use writer::StorageWriter;
