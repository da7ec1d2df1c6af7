pub mod autosave;
pub mod core;
pub mod notifications;
pub mod records;
pub mod setup;
pub mod thresholds;
