//! Process settings loaded from `REDRUN_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use redrun_core::{ClientConfig, ReportLanguage, RunDefaults, ValidationPolicy};

use crate::jobs::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("{key} is required: {reason}")]
    Missing { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreSettings,
    pub execution: ExecutionSettings,
    pub artifacts: ArtifactSettings,
    pub models: ModelSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// `None` keeps jobs and the queue in process memory.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub job_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub run_timeout: Duration,
    pub wait_timeout: Duration,
    pub wait_poll_interval: Duration,
    pub concurrency: usize,
    pub queue_poll_interval: Duration,
    pub engine_program: PathBuf,
    pub engine_args: Vec<String>,
    pub allowed_import_prefixes: Vec<String>,
    pub run_defaults: RunDefaults,
    pub reconcile_on_start: bool,
    /// Run a worker pool inside the API process.
    pub embedded_worker: bool,
}

impl ExecutionSettings {
    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            allowed_import_prefixes: self.allowed_import_prefixes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactBackendKind {
    Memory,
    Local,
    S3,
    /// S3 when a bucket is configured, local otherwise.
    Auto,
}

impl FromStr for ArtifactBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown backend '{other}' (memory, local, s3, auto)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSettings {
    /// Parent of every job's local output directory.
    pub root: PathBuf,
    pub backend: ArtifactBackendKind,
    /// Object root of the `local` backend.
    pub local_store_dir: PathBuf,
    /// Empty or ending with `/`.
    pub key_prefix: String,
    pub local_retention: Duration,
    pub upload_max_attempts: u32,
    pub upload_retry_delay: Duration,
    pub presign_expires: Duration,
    pub list_max_keys: usize,
    pub remote_retention: Option<Duration>,
    pub s3: Option<S3Settings>,
}

impl ArtifactSettings {
    /// Backend actually used once `Auto` is resolved.
    pub fn effective_backend(&self) -> ArtifactBackendKind {
        match self.backend {
            ArtifactBackendKind::Auto if self.s3.is_some() => ArtifactBackendKind::S3,
            ArtifactBackendKind::Auto => ArtifactBackendKind::Local,
            other => other,
        }
    }

    /// Worst-case time spent uploading one job's archive.
    pub fn upload_budget(&self) -> Duration {
        self.upload_retry_delay * self.upload_max_attempts.saturating_sub(1)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    /// Host used in presigned links, when it differs from `endpoint`.
    pub public_endpoint: Option<String>,
    pub allow_http: bool,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .field("allow_http", &self.allow_http)
            .finish_non_exhaustive()
    }
}

/// Attack and judge models used for every run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub attack: ClientConfig,
    pub judge: ClientConfig,
}

#[derive(Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub bind: SocketAddr,
    /// `None` disables the `X-API-Key` guard.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for HttpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSettings")
            .field("bind", &self.bind)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests, embedding).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let store = StoreSettings {
            redis_url: env.string("REDRUN_REDIS_URL"),
            key_prefix: env
                .string("REDRUN_KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            job_ttl: env.secs("REDRUN_JOB_TTL_SECONDS", 7 * 24 * 3600)?,
        };
        if store.job_ttl.is_zero() {
            return Err(ConfigError::invalid("REDRUN_JOB_TTL_SECONDS", "must be >= 1"));
        }

        let run_timeout = env.secs("REDRUN_RUN_TIMEOUT_SECONDS", 3600)?;
        if run_timeout.is_zero() {
            return Err(ConfigError::invalid("REDRUN_RUN_TIMEOUT_SECONDS", "must be >= 1"));
        }
        let execution = ExecutionSettings {
            run_timeout,
            wait_timeout: env.secs("REDRUN_WAIT_TIMEOUT_SECONDS", run_timeout.as_secs())?,
            wait_poll_interval: env.millis("REDRUN_WAIT_POLL_MS", 250)?,
            concurrency: env.parse("REDRUN_WORKER_CONCURRENCY", 2usize)?.max(1),
            queue_poll_interval: env.millis("REDRUN_QUEUE_POLL_MS", 500)?,
            engine_program: env
                .string("REDRUN_ENGINE_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("redrun-engine")),
            engine_args: env
                .string("REDRUN_ENGINE_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            allowed_import_prefixes: env
                .list("REDRUN_CUSTOM_TEST_PREFIXES")
                .unwrap_or_else(|| vec!["llamator.".to_string()]),
            run_defaults: RunDefaults {
                report_language: env.parse("REDRUN_REPORT_LANGUAGE", ReportLanguage::En)?,
                ..RunDefaults::default()
            },
            reconcile_on_start: env.flag("REDRUN_RECONCILE_ON_START", true)?,
            embedded_worker: env.flag("REDRUN_EMBEDDED_WORKER", false)?,
        };

        let s3 = match env.string("REDRUN_S3_BUCKET") {
            Some(bucket) => Some(S3Settings {
                bucket,
                region: env
                    .string("REDRUN_S3_REGION")
                    .unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: env.string("REDRUN_S3_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: env.string("REDRUN_S3_SECRET_ACCESS_KEY").unwrap_or_default(),
                endpoint: env.string("REDRUN_S3_ENDPOINT_URL"),
                public_endpoint: env.string("REDRUN_S3_PUBLIC_ENDPOINT_URL"),
                allow_http: env.flag("REDRUN_S3_ALLOW_HTTP", false)?,
            }),
            None => None,
        };

        let remote_retention = env.secs("REDRUN_REMOTE_RETENTION_SECONDS", 7 * 24 * 3600)?;
        let artifacts = ArtifactSettings {
            root: env
                .string("REDRUN_ARTIFACTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/data/artifacts")),
            backend: env.parse("REDRUN_ARTIFACTS_BACKEND", ArtifactBackendKind::Auto)?,
            local_store_dir: env
                .string("REDRUN_ARTIFACTS_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/data/artifact-store")),
            key_prefix: normalize_key_prefix(
                &env.string("REDRUN_ARTIFACTS_KEY_PREFIX").unwrap_or_default(),
            ),
            local_retention: env.secs("REDRUN_LOCAL_RETENTION_SECONDS", 24 * 3600)?,
            upload_max_attempts: env.parse("REDRUN_UPLOAD_MAX_ATTEMPTS", 3u32)?.max(1),
            upload_retry_delay: env.millis("REDRUN_UPLOAD_RETRY_DELAY_MS", 2000)?,
            presign_expires: env.secs("REDRUN_PRESIGN_EXPIRES_SECONDS", 900)?,
            list_max_keys: env.parse("REDRUN_ARTIFACTS_LIST_MAX_KEYS", 1000usize)?,
            remote_retention: (!remote_retention.is_zero()).then_some(remote_retention),
            s3,
        };
        if artifacts.backend == ArtifactBackendKind::S3 && artifacts.s3.is_none() {
            return Err(ConfigError::Missing {
                key: "REDRUN_S3_BUCKET".to_string(),
                reason: "REDRUN_ARTIFACTS_BACKEND=s3".to_string(),
            });
        }

        let models = ModelSettings {
            attack: env.client("ATTACK", 0.5)?,
            judge: env.client("JUDGE", 0.1)?,
        };

        let http = HttpSettings {
            bind: env.parse(
                "REDRUN_HTTP_BIND",
                SocketAddr::from(([0, 0, 0, 0], 8000)),
            )?,
            api_key: env.string("REDRUN_API_KEY"),
        };

        Ok(Self {
            store,
            execution,
            artifacts,
            models,
            http,
        })
    }

    /// Age after which a `running` record is considered orphaned.
    pub fn reconcile_stale_after(&self) -> Duration {
        self.execution.run_timeout + self.artifacts.upload_budget() + Duration::from_secs(600)
    }
}

fn normalize_key_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Prompts as a JSON array of strings, or one prompt per line.
fn parse_system_prompts(key: &str, raw: &str) -> Result<Option<Vec<String>>, ConfigError> {
    let raw = raw.trim();
    let prompts: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw)
            .map_err(|e| ConfigError::invalid(key, format!("expected a JSON array of strings: {e}")))?
    } else {
        raw.lines().map(str::to_string).collect()
    };
    let prompts: Vec<String> = prompts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    Ok((!prompts.is_empty()).then_some(prompts))
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Trimmed value; blank counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{raw}': {e}"))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, format!("'{v}' is not a boolean"))),
            },
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .string(key)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        (!items.is_empty()).then_some(items)
    }

    /// `REDRUN_{role}_*` model settings, validated like a submitted client.
    fn client(&self, role: &str, default_temperature: f64) -> Result<ClientConfig, ConfigError> {
        let key = |suffix: &str| format!("REDRUN_{role}_{suffix}");

        let mut client = ClientConfig::new(
            self.string(&key("BASE_URL"))
                .unwrap_or_else(|| "http://localhost:1234/v1".to_string()),
            self.string(&key("MODEL"))
                .unwrap_or_else(|| "model-identifier".to_string()),
        );
        client.api_key = self.string(&key("API_KEY"));
        client.temperature = Some(self.parse(&key("TEMPERATURE"), default_temperature)?);
        let prompts_key = key("SYSTEM_PROMPTS");
        client.system_prompts = match (self.0)(&prompts_key) {
            Some(raw) => parse_system_prompts(&prompts_key, &raw)?,
            None => None,
        };

        let field = format!("{}_model", role.to_ascii_lowercase());
        client
            .normalize(&field)
            .map_err(|e| ConfigError::invalid(&key("*"), e.to_string()))?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.store.redis_url, None);
        assert_eq!(s.store.key_prefix, "redrun:");
        assert_eq!(s.store.job_ttl, Duration::from_secs(604_800));
        assert_eq!(s.execution.run_timeout, Duration::from_secs(3600));
        assert_eq!(s.execution.wait_timeout, Duration::from_secs(3600));
        assert_eq!(s.execution.wait_poll_interval, Duration::from_millis(250));
        assert_eq!(s.execution.concurrency, 2);
        assert_eq!(s.execution.allowed_import_prefixes, vec!["llamator."]);
        assert!(s.execution.reconcile_on_start);
        assert!(!s.execution.embedded_worker);
        assert_eq!(s.artifacts.root, PathBuf::from("/data/artifacts"));
        assert_eq!(s.artifacts.effective_backend(), ArtifactBackendKind::Local);
        assert_eq!(s.artifacts.local_retention, Duration::from_secs(86_400));
        assert_eq!(s.artifacts.upload_max_attempts, 3);
        assert_eq!(s.artifacts.upload_retry_delay, Duration::from_secs(2));
        assert_eq!(s.artifacts.presign_expires, Duration::from_secs(900));
        assert_eq!(s.artifacts.list_max_keys, 1000);
        assert_eq!(s.artifacts.remote_retention, Some(Duration::from_secs(604_800)));
        assert_eq!(s.http.bind, SocketAddr::from(([0, 0, 0, 0], 8000)));
        assert_eq!(s.http.api_key, None);
        assert_eq!(s.execution.run_defaults.report_language, ReportLanguage::En);
        assert_eq!(s.models.attack.temperature, Some(0.5));
        assert_eq!(s.models.judge.temperature, Some(0.1));
        assert_eq!(
            s.reconcile_stale_after(),
            Duration::from_secs(3600 + 4 + 600)
        );
    }

    #[test]
    fn overrides() {
        let s = settings(&[
            ("REDRUN_RUN_TIMEOUT_SECONDS", "120"),
            ("REDRUN_WAIT_TIMEOUT_SECONDS", "30"),
            ("REDRUN_CUSTOM_TEST_PREFIXES", "llamator., my_tests. ,"),
            ("REDRUN_S3_BUCKET", "artifacts"),
            ("REDRUN_S3_ENDPOINT_URL", "http://minio:9000"),
            ("REDRUN_ARTIFACTS_KEY_PREFIX", "/runs/"),
            ("REDRUN_REMOTE_RETENTION_SECONDS", "0"),
            ("REDRUN_REPORT_LANGUAGE", "ru"),
            ("REDRUN_API_KEY", "  "),
            ("REDRUN_JUDGE_SYSTEM_PROMPTS", r#"["be strict", " "]"#),
            ("REDRUN_ATTACK_SYSTEM_PROMPTS", "first\n\nsecond"),
        ])
        .unwrap();
        assert_eq!(s.execution.run_timeout, Duration::from_secs(120));
        assert_eq!(s.execution.wait_timeout, Duration::from_secs(30));
        assert_eq!(s.execution.allowed_import_prefixes, vec!["llamator.", "my_tests."]);
        assert_eq!(s.artifacts.effective_backend(), ArtifactBackendKind::S3);
        assert_eq!(s.artifacts.s3.as_ref().unwrap().region, "us-east-1");
        assert_eq!(s.artifacts.key_prefix, "runs/");
        assert_eq!(s.artifacts.remote_retention, None);
        assert_eq!(s.execution.run_defaults.report_language, ReportLanguage::Ru);
        assert_eq!(s.http.api_key, None);
        assert_eq!(s.models.judge.system_prompts, Some(vec!["be strict".to_string()]));
        assert_eq!(
            s.models.attack.system_prompts,
            Some(vec!["first".to_string(), "second".to_string()])
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (key, value) in [
            ("REDRUN_JOB_TTL_SECONDS", "soon"),
            ("REDRUN_JOB_TTL_SECONDS", "0"),
            ("REDRUN_RECONCILE_ON_START", "maybe"),
            ("REDRUN_ARTIFACTS_BACKEND", "ftp"),
            ("REDRUN_REPORT_LANGUAGE", "de"),
            ("REDRUN_HTTP_BIND", "localhost"),
            ("REDRUN_ATTACK_BASE_URL", "not a url"),
            ("REDRUN_JUDGE_TEMPERATURE", "3.5"),
        ] {
            assert!(
                matches!(settings(&[(key, value)]), Err(ConfigError::Invalid { .. })),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn s3_backend_needs_bucket() {
        assert!(matches!(
            settings(&[("REDRUN_ARTIFACTS_BACKEND", "s3")]),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn secrets_stay_out_of_debug() {
        let s = settings(&[
            ("REDRUN_API_KEY", "top-secret"),
            ("REDRUN_S3_BUCKET", "b"),
            ("REDRUN_S3_SECRET_ACCESS_KEY", "s3-secret"),
            ("REDRUN_ATTACK_API_KEY", "sk-attack"),
        ])
        .unwrap();
        let dump = format!("{s:?}");
        assert!(!dump.contains("top-secret"));
        assert!(!dump.contains("s3-secret"));
        assert!(!dump.contains("sk-attack"));
    }
}
