//! Infrastructure layer: configuration, logging and external collaborators
//!
//! Everything the resolver engine talks to lives here: the page driver contract
//! and its HTTP implementation, tabular readers/writers, configuration loading
//! and logging setup.

pub mod artifacts; // Downloaded artifacts and page snapshots
pub mod config; // Layered configuration and defaults
pub mod http_driver; // reqwest + scraper page driver
pub mod logging; // Logging infrastructure
pub mod page_driver; // Driver / factory / connectivity contracts
pub mod tabular; // csv, tsv and spreadsheet I/O

pub use artifacts::{ArtifactStore, DebugSnapshots, SnapshotReason};
pub use config::AppConfig;
pub use http_driver::{HttpDriverFactory, HttpPageDriver};
pub use logging::{get_log_directory, init_logging_with_config};
pub use page_driver::{AlwaysOnline, ConnectivityProbe, DriverError, DriverFactory, MarkerSample, PageDriver};
pub use tabular::{DelimitedResultWriter, ResultWriter, TabularError, load_keys, read_keys};
