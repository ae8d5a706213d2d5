pub mod types;
pub mod db;
pub mod error;
pub mod query;

pub use types::*;
pub use error::{CrawlerError, Result};
