pub mod config;
pub mod queue;
pub mod redis;
pub mod store;
pub mod tasks;
pub mod types;
