//! Infrastructure layer: job storage and queueing, execution, artifacts, config.

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod jobs;

#[cfg(test)]
mod integration_tests;
