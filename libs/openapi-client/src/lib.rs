//! Models of the platform API consumed by fleetd

pub mod models;

pub use models::*;
