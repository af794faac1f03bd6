pub mod config;
pub mod logging;

// Engine modules: leaves first, worker last.
pub mod agent;
pub mod cache;
pub mod digest;
pub mod manifest;
pub mod storage;
pub mod sync;
pub mod transfer;
