//! Deployment engine

pub mod canonical;
pub mod operations;
pub mod pipeline;
pub mod pool;
pub mod reconcile;
pub mod retry;
