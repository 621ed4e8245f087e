//! fleetd library
//!
//! Core modules for the fleet orchestration daemon.

pub mod app;
pub mod audit;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod preprocess;
pub mod progress;
pub mod providers;
pub mod reconcile;
pub mod retry;
pub mod rollout;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod vault;
pub mod workers;
