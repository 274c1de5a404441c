// Re-export modules for testing
pub mod backup;
pub mod config;
pub mod exec;
pub mod job;
pub mod journal;
pub mod metrics;
pub mod sync;
pub mod telegram;
