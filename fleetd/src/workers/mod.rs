pub mod health;
pub mod reconciler;
pub mod sweeper;
