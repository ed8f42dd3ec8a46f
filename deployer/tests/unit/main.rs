//! Integration tests, compiled as a single test target

mod fixtures;
mod test_app;
mod test_canonical;
mod test_manifest;
mod test_pipeline;
