//! ECS Deployer Library
//!
//! Rolls out services and scheduled tasks onto a container cluster through an
//! ordered, partially parallel pipeline.

pub mod app;
pub mod cloud;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod report;
pub mod storage;
pub mod utils;
