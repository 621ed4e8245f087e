//! Platform API client

pub mod audit;
pub mod client;
pub mod records;

pub use client::HttpClient;
