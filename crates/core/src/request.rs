//! Test run submission model and its validation rules.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::path::normalize_relative;

const MAX_MODEL_LEN: usize = 300;
const MAX_PARAM_NAME_LEN: usize = 200;
const MAX_CODE_NAME_LEN: usize = 200;
const MAX_IMPORT_PATH_LEN: usize = 500;

/// LLM client flavour. Only OpenAI-compatible endpoints are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Openai,
}

/// Connection settings for one LLM client (tested, attack or judge model).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub kind: ClientKind,
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_description: Option<String>,
}

// Hand-written so the key never reaches logs.
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("system_prompts", &self.system_prompts)
            .field("model_description", &self.model_description)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: ClientKind::Openai,
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: None,
            system_prompts: None,
            model_description: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Validate and normalise in place. `field` prefixes error paths.
    pub fn normalize(&mut self, field: &str) -> DomainResult<()> {
        self.base_url = self.base_url.trim().to_string();
        if !is_http_url(&self.base_url) {
            return Err(DomainError::validation(
                format!("{field}.base_url"),
                "must be an absolute http(s) URL",
            ));
        }

        let model = self.model.trim();
        if model.is_empty() || model.chars().count() > MAX_MODEL_LEN {
            return Err(DomainError::validation(
                format!("{field}.model"),
                format!("must be 1..={MAX_MODEL_LEN} characters"),
            ));
        }
        self.model = model.to_string();

        if matches!(self.api_key.as_deref(), Some("")) {
            return Err(DomainError::validation(
                format!("{field}.api_key"),
                "must be non-empty when provided",
            ));
        }

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(DomainError::validation(
                    format!("{field}.temperature"),
                    "must be in [0.0, 2.0]",
                ));
            }
        }

        if let Some(prompts) = self.system_prompts.take() {
            let cleaned: Vec<String> = prompts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            self.system_prompts = (!cleaned.is_empty()).then_some(cleaned);
        }

        Ok(())
    }
}

fn is_http_url(raw: &str) -> bool {
    let rest = match raw
        .strip_prefix("http://")
        .or_else(|| raw.strip_prefix("https://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    !host.is_empty() && !raw.chars().any(char::is_whitespace)
}

/// Report language of generated documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLanguage {
    #[default]
    En,
    Ru,
}

impl std::str::FromStr for ReportLanguage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "ru" => Ok(Self::Ru),
            other => Err(DomainError::validation(
                "report_language",
                format!("unsupported language '{other}' (expected en or ru)"),
            )),
        }
    }
}

/// Per-job overrides for the engine run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_logging: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_reports: Option<bool>,
    /// Sub-directory inside the job's output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_language: Option<ReportLanguage>,
}

impl RunConfig {
    fn normalize(&mut self) -> DomainResult<()> {
        if let Some(raw) = self.artifacts_path.take() {
            let normalized = normalize_relative(&raw).ok_or_else(|| {
                DomainError::validation(
                    "run_config.artifacts_path",
                    "must be a safe relative path",
                )
            })?;
            self.artifacts_path = Some(normalized);
        }
        if let Some(level) = self.debug_level {
            if level > 2 {
                return Err(DomainError::validation(
                    "run_config.debug_level",
                    "must be one of: 0, 1, 2",
                ));
            }
        }
        Ok(())
    }

    /// Apply these overrides on top of process defaults.
    pub fn merged_onto(&self, defaults: &RunDefaults) -> EffectiveRunConfig {
        EffectiveRunConfig {
            enable_logging: self.enable_logging.unwrap_or(defaults.enable_logging),
            enable_reports: self.enable_reports.unwrap_or(defaults.enable_reports),
            debug_level: self.debug_level.unwrap_or(defaults.debug_level),
            report_language: self.report_language.unwrap_or(defaults.report_language),
            artifacts_path: self.artifacts_path.clone(),
        }
    }
}

/// Process-wide run configuration defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDefaults {
    pub enable_logging: bool,
    pub enable_reports: bool,
    pub debug_level: u8,
    pub report_language: ReportLanguage,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_reports: false,
            debug_level: 1,
            report_language: ReportLanguage::En,
        }
    }
}

/// Run configuration with every knob decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRunConfig {
    pub enable_logging: bool,
    pub enable_reports: bool,
    pub debug_level: u8,
    pub report_language: ReportLanguage,
    pub artifacts_path: Option<String>,
}

/// A single named test parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParameter {
    pub name: String,
    pub value: serde_json::Value,
}

/// Built-in test selected by code name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicTestSpec {
    pub code_name: String,
    #[serde(default)]
    pub params: Vec<TestParameter>,
}

/// Custom test loaded by import path in the engine environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTestSpec {
    pub import_path: String,
    #[serde(default)]
    pub params: Vec<TestParameter>,
}

/// One entry of a test plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestSpec {
    Basic {
        code_name: String,
        params: Vec<TestParameter>,
    },
    Custom {
        import_path: String,
        params: Vec<TestParameter>,
    },
}

impl TestSpec {
    /// Code name of a basic test, import path of a custom one.
    pub fn name(&self) -> &str {
        match self {
            TestSpec::Basic { code_name, .. } => code_name,
            TestSpec::Custom { import_path, .. } => import_path,
        }
    }

    pub fn params(&self) -> &[TestParameter] {
        match self {
            TestSpec::Basic { params, .. } | TestSpec::Custom { params, .. } => params,
        }
    }
}

/// Which tests to run and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_tests: Option<Vec<BasicTestSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_tests: Option<Vec<CustomTestSpec>>,
}

impl TestPlan {
    /// Flatten basic and custom tests into one ordered list (basic first).
    pub fn specs(&self) -> Vec<TestSpec> {
        let basic = self.basic_tests.iter().flatten().map(|t| TestSpec::Basic {
            code_name: t.code_name.clone(),
            params: t.params.clone(),
        });
        let custom = self.custom_tests.iter().flatten().map(|t| TestSpec::Custom {
            import_path: t.import_path.clone(),
            params: t.params.clone(),
        });
        basic.chain(custom).collect()
    }

    fn normalize(&mut self, policy: &ValidationPolicy) -> DomainResult<()> {
        if matches!(self.num_threads, Some(0)) {
            return Err(DomainError::validation("plan.num_threads", "must be >= 1"));
        }
        if let Some(preset) = self.preset_name.as_mut() {
            let trimmed = preset.trim();
            if trimmed.is_empty() {
                return Err(DomainError::validation(
                    "plan.preset_name",
                    "must be non-empty when provided",
                ));
            }
            *preset = trimmed.to_string();
        }

        for (i, test) in self.basic_tests.iter_mut().flatten().enumerate() {
            let field = format!("plan.basic_tests[{i}]");
            test.code_name = non_blank(&test.code_name, MAX_CODE_NAME_LEN)
                .ok_or_else(|| {
                    DomainError::validation(
                        format!("{field}.code_name"),
                        format!("must be 1..={MAX_CODE_NAME_LEN} characters"),
                    )
                })?;
            normalize_params(&mut test.params, &field)?;
        }

        for (i, test) in self.custom_tests.iter_mut().flatten().enumerate() {
            let field = format!("plan.custom_tests[{i}]");
            let path = non_blank(&test.import_path, MAX_IMPORT_PATH_LEN).ok_or_else(|| {
                DomainError::validation(
                    format!("{field}.import_path"),
                    format!("must be 1..={MAX_IMPORT_PATH_LEN} characters"),
                )
            })?;
            if !policy.allows_import(&path) {
                return Err(DomainError::validation(
                    format!("{field}.import_path"),
                    "not allowed by import policy",
                ));
            }
            test.import_path = path;
            normalize_params(&mut test.params, &field)?;
        }

        Ok(())
    }
}

fn non_blank(raw: &str, max_len: usize) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty() && trimmed.chars().count() <= max_len).then(|| trimmed.to_string())
}

fn normalize_params(params: &mut [TestParameter], field: &str) -> DomainResult<()> {
    let mut seen = HashSet::new();
    for p in params.iter_mut() {
        p.name = non_blank(&p.name, MAX_PARAM_NAME_LEN).ok_or_else(|| {
            DomainError::validation(
                format!("{field}.params"),
                format!("parameter names must be 1..={MAX_PARAM_NAME_LEN} characters"),
            )
        })?;
        if !seen.insert(p.name.clone()) {
            return Err(DomainError::validation(
                format!("{field}.params"),
                format!("duplicate parameter name: {}", p.name),
            ));
        }
    }
    Ok(())
}

/// Submission rules that depend on deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Prefixes a custom test import path must start with.
    pub allowed_import_prefixes: Vec<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            allowed_import_prefixes: vec!["llamator.".to_string()],
        }
    }
}

impl ValidationPolicy {
    pub fn allows_import(&self, path: &str) -> bool {
        self.allowed_import_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Request to start a test run against an LLM endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunRequest {
    pub tested_model: ClientConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_config: Option<RunConfig>,
    pub plan: TestPlan,
}

impl TestRunRequest {
    /// Validate the request, returning its normalised form.
    pub fn validate(mut self, policy: &ValidationPolicy) -> DomainResult<Self> {
        self.tested_model.normalize("tested_model")?;
        if let Some(rc) = self.run_config.as_mut() {
            rc.normalize()?;
        }
        self.plan.normalize(policy)?;
        Ok(self)
    }
}
