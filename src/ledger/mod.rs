//! Position and ledger accounting: margin, cost basis, realized P&L.

mod engine;
mod error;
pub mod math;
mod report;

pub use engine::{CloseReceipt, LedgerEngine, OpenReceipt};
pub use error::{EngineError, ErrorCategory};
pub use report::PnlSummary;
