/// `fern` setup and log-file housekeeping for host binaries.
pub mod setup;

pub use setup::{cleanup_old_logs, parse_level, setup_logging};
