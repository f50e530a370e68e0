//! Analysis engine port.
//!
//! The worker hands a fully resolved run to an [`AnalysisEngine`] and gets back
//! either an aggregated result or a named fault. Engines never see stored
//! records and never touch the job store.

pub mod command;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use redrun_core::{AggregatedResult, ClientConfig, EffectiveRunConfig, JobId, TestSpec};

pub use command::{CommandEngine, CommandEngineConfig};

/// Fault kind for engine processes that exit abnormally.
pub const ENGINE_PROCESS_ERROR: &str = "EngineProcessError";
/// Fault kind for engine output that cannot be decoded.
pub const INVALID_ENGINE_OUTPUT: &str = "InvalidEngineOutputError";

/// Everything an engine needs to execute one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRun {
    pub job_id: JobId,
    pub tested_model: ClientConfig,
    pub attack_model: ClientConfig,
    pub judge_model: ClientConfig,
    pub tests: Vec<TestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<u32>,
    pub config: EffectiveRunConfig,
    /// Where the engine writes logs and reports. Packaged after the run.
    pub output_dir: PathBuf,
}

/// A failure raised by the engine, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineFault {
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl EngineFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn run(&self, run: &ResolvedRun) -> Result<AggregatedResult, EngineFault>;
}

#[async_trait]
impl<E: AnalysisEngine + ?Sized> AnalysisEngine for std::sync::Arc<E> {
    async fn run(&self, run: &ResolvedRun) -> Result<AggregatedResult, EngineFault> {
        (**self).run(run).await
    }
}
