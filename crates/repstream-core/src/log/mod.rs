//! Log access: records, the storage and index collaborators, and the scanner

pub mod index;
pub mod memory;
pub mod record;
pub mod scanner;
pub mod store;

pub use index::VlsnIndex;
pub use memory::{MemoryIndex, MemoryLog};
pub use record::{EntryType, LogRecord, RecordPayload, txn_end_payload};
pub use scanner::{LogScanner, ScanMonitor, ScanOutcome, ScannerState};
pub use store::{LogStore, Step};
