pub mod sync_service;
pub mod scheduler;

pub use sync_service::{PullApplyPolicy, SyncService, SyncStats};
pub use scheduler::SyncScheduler;
