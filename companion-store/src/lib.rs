mod atomic;
mod debounce;

pub mod approvals;
pub mod config_store;
pub mod cron;
pub mod runs;

pub use approvals::{ApprovalStore, NewApproval, Resolution};
pub use config_store::ConfigStore;
pub use cron::CronStore;
pub use debounce::DebouncedFile;
pub use runs::{CreateRun, RunFilter, RunPage, RunStore, UpdateRun};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
