//! Export orchestration: the archive lock, the durable job ledger, and the run loop that
//! verifies, fetches and stores records.

pub mod ledger;
pub mod lock;
pub mod orchestrator;

pub use ledger::{JobLedger, JobUpdate, LedgerError};
pub use lock::{LockBackend, LockError, ScopedLock};
pub use orchestrator::{ExportConfig, ExportError, Orchestrator};
