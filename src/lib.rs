pub mod api;
pub mod claim;
pub mod config;
pub mod error;
pub mod evm;
pub mod invoice;
pub mod keys;
pub mod logging;
pub mod orchestrator;
pub mod refund;
pub mod retry;
pub mod swap;
pub mod sync;
pub mod units;

pub use error::{Error, Result};
