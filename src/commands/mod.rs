pub mod config;
pub mod reprocess;
pub mod start;
pub mod status;
