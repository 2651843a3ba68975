pub mod scheduler;
pub mod sync_engine;

pub use scheduler::SyncScheduler;
pub use sync_engine::{SyncConfig, SyncEngine, SyncReport};
