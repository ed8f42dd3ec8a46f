//! Command line application layer

pub mod options;
pub mod run;
