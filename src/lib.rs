pub mod cli;
pub mod config;
pub mod delivery;
pub mod pipeline;
pub mod publisher;
pub mod retry;
pub mod source;
pub mod storage;
