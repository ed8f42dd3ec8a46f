//! Wire models for the container service and scheduled-rule APIs

pub mod models;

pub use models::*;
