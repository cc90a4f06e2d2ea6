pub mod api;
pub mod cli;
pub mod engine;
pub mod lock;
pub mod notify;
pub mod storage;
