//! Domain module - keys, attempt outcomes and result records
//!
//! Modern Rust module organization:
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod key;
pub mod outcome;
pub mod record;

pub use key::{KEY_WIDTH, Key, normalize, normalize_all};
pub use outcome::{AttemptStep, ErrorKind, Outcome, Payload};
pub use record::{KEY_COLUMN, RECORD_COLUMNS, Record, RecordStatus, WorkItem};
