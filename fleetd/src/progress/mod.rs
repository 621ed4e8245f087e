//! Provisioning progress: the server-side hub and the client-side consumer

pub mod consumer;
pub mod hub;

pub use consumer::{DeliveryMode, ProgressConsumer, Update};
pub use hub::{ProgressHub, Subscription};
