//! File lifecycle: storage, per-file controller, error reports and the run orchestrator

pub mod controller;
pub mod orchestrator;
pub mod report;
pub mod storage;

pub use controller::{FileController, Lifecycle};
pub use orchestrator::{InputQueue, Orchestrator};
pub use report::ErrorReport;
pub use storage::{report_path_for, FileStore, StorageLayout};
