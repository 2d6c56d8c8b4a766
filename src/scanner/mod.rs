mod builder;
mod coordinator;
mod head_tracker;
mod ticker;
mod type_scanner;

pub use builder::{DEFAULT_MERGE_INTERVAL, ScannerBuilder};
pub use coordinator::Coordinator;
pub use head_tracker::{DEFAULT_HEAD_POLL_INTERVAL, HeadTracker};
pub use type_scanner::{
    DEFAULT_MAX_FETCH_SIZE, DEFAULT_MAX_LOOKAHEAD, DEFAULT_SCAN_INTERVAL, TypeScanner,
    TypeScannerConfig,
};
