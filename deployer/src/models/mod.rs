//! Deploy target data model

pub mod manifest;
pub mod params;
pub mod snapshot;
pub mod spec;
pub mod target;
