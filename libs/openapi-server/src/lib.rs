//! Wire models served by fleetd

pub mod models;

pub use models::*;
