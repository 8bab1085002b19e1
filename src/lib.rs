// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod stream;
pub mod strategy;
pub mod sync;

// Re-export commonly used types
pub use error::BotError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
