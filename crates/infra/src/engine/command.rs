//! Engine that runs an external program per job.
//!
//! Protocol: the resolved run is written to the child's stdin as one JSON
//! document. The last non-empty stdout line must be either
//! `{"aggregated": {...}}` or `{"error": {"kind": "...", "message": "..."}}`.
//! Anything printed before that line is ignored.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use redrun_core::AggregatedResult;

use super::{AnalysisEngine, EngineFault, ResolvedRun, ENGINE_PROCESS_ERROR, INVALID_ENGINE_OUTPUT};

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandEngineConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: CommandEngineConfig,
}

#[derive(Debug, Deserialize)]
struct EngineOutput {
    #[serde(default)]
    aggregated: Option<AggregatedResult>,
    #[serde(default)]
    error: Option<EngineFault>,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    fn process_fault(message: impl Into<String>) -> EngineFault {
        EngineFault::new(ENGINE_PROCESS_ERROR, message)
    }
}

#[async_trait]
impl AnalysisEngine for CommandEngine {
    async fn run(&self, run: &ResolvedRun) -> Result<AggregatedResult, EngineFault> {
        tokio::fs::create_dir_all(&run.output_dir)
            .await
            .map_err(|e| Self::process_fault(format!("cannot create output directory: {e}")))?;

        let input = serde_json::to_vec(run)
            .map_err(|e| Self::process_fault(format!("cannot encode run: {e}")))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env("REDRUN_JOB_ID", run.job_id.to_string())
            .env("REDRUN_OUTPUT_DIR", &run.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Self::process_fault(format!(
                    "failed to start '{}': {e}",
                    self.config.program.display()
                ))
            })?;

        info!(job_id = %run.job_id, pid = child.id(), "engine process started");

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The engine may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(Self::process_fault(format!("failed to write run: {e}"))),
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Self::process_fault(format!("failed to wait for engine: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<EngineOutput>(line.trim()));

        if let Some(Ok(EngineOutput {
            error: Some(fault), ..
        })) = &parsed
        {
            debug!(job_id = %run.job_id, kind = %fault.kind, "engine reported a fault");
            return Err(fault.clone());
        }

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            warn!(job_id = %run.job_id, status = %output.status, "engine exited abnormally");
            return Err(Self::process_fault(format!(
                "engine exited with {}: {tail}",
                output.status
            )));
        }

        match parsed {
            Some(Ok(EngineOutput {
                aggregated: Some(aggregated),
                ..
            })) => Ok(aggregated),
            Some(Ok(_)) => Err(EngineFault::new(
                INVALID_ENGINE_OUTPUT,
                "engine output has neither 'aggregated' nor 'error'",
            )),
            Some(Err(e)) => Err(EngineFault::new(
                INVALID_ENGINE_OUTPUT,
                format!("engine output is not valid JSON: {e}"),
            )),
            None => Err(EngineFault::new(INVALID_ENGINE_OUTPUT, "engine produced no output")),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use redrun_core::{ClientConfig, JobId, RunConfig, RunDefaults};

    fn run_in(dir: &std::path::Path) -> ResolvedRun {
        let client = ClientConfig::new("http://m/v1", "m");
        ResolvedRun {
            job_id: JobId::new(),
            tested_model: client.clone(),
            attack_model: client.clone(),
            judge_model: client,
            tests: Vec::new(),
            preset_name: Some("owasp".into()),
            num_threads: Some(1),
            config: RunConfig::default().merged_onto(&RunDefaults::default()),
            output_dir: dir.join("out"),
        }
    }

    fn sh(script: &str) -> CommandEngine {
        CommandEngine::new(CommandEngineConfig::new("sh").with_args(["-c", script]))
    }

    #[tokio::test]
    async fn aggregated_output_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh(
            r#"cat > /dev/null; echo "progress..."; echo '{"aggregated":{"prompt_injection":{"broken":2,"resilient":8}}}'"#,
        );
        let agg = engine.run(&run_in(dir.path())).await.unwrap();
        assert_eq!(agg["prompt_injection"]["broken"], 2);
        assert_eq!(agg["prompt_injection"]["resilient"], 8);
        assert!(dir.path().join("out").is_dir());
    }

    #[tokio::test]
    async fn run_is_passed_on_stdin_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_in(dir.path());
        let engine = sh(
            r#"grep -q "$REDRUN_JOB_ID" && touch "$REDRUN_OUTPUT_DIR/seen"; echo '{"aggregated":{}}'"#,
        );
        let agg = engine.run(&run).await.unwrap();
        assert!(agg.is_empty());
        assert!(run.output_dir.join("seen").is_file());
    }

    #[tokio::test]
    async fn structured_error_wins_over_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh(r#"echo '{"error":{"kind":"ValueError","message":"bad preset"}}'; exit 3"#);
        let fault = engine.run(&run_in(dir.path())).await.unwrap_err();
        assert_eq!(fault, EngineFault::new("ValueError", "bad preset"));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sh("echo 'model unreachable' >&2; exit 2");
        let fault = engine.run(&run_in(dir.path())).await.unwrap_err();
        assert_eq!(fault.kind, ENGINE_PROCESS_ERROR);
        assert!(fault.message.contains("model unreachable"), "{}", fault.message);
    }

    #[tokio::test]
    async fn garbage_output_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let fault = sh("echo 'not json'").run(&run_in(dir.path())).await.unwrap_err();
        assert_eq!(fault.kind, INVALID_ENGINE_OUTPUT);

        let fault = sh("true").run(&run_in(dir.path())).await.unwrap_err();
        assert_eq!(fault.kind, INVALID_ENGINE_OUTPUT);
    }

    #[tokio::test]
    async fn missing_program_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CommandEngine::new(CommandEngineConfig::new("/nonexistent/redrun-engine"));
        let fault = engine.run(&run_in(dir.path())).await.unwrap_err();
        assert_eq!(fault.kind, ENGINE_PROCESS_ERROR);
    }
}
