//! Storage-safe view of a submitted request.

use serde::{Deserialize, Serialize};

use crate::request::{ClientConfig, ClientKind, RunConfig, TestPlan, TestRunRequest};

/// Client configuration with the API key replaced by a presence flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactedClient {
    pub kind: ClientKind,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub system_prompts: Option<Vec<String>>,
    pub model_description: Option<String>,
    pub api_key_present: bool,
}

impl From<&ClientConfig> for RedactedClient {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            kind: cfg.kind,
            base_url: cfg.base_url.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            system_prompts: cfg.system_prompts.clone(),
            model_description: cfg.model_description.clone(),
            api_key_present: cfg.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }
}

/// What gets persisted on the job record as `request`.
///
/// Includes the attack and judge models the server chose for the run so the
/// record describes the whole run, not only what the caller sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactedRequest {
    pub tested_model: RedactedClient,
    pub attack_model: RedactedClient,
    pub judge_model: RedactedClient,
    pub run_config: Option<RunConfig>,
    pub plan: TestPlan,
}

impl RedactedRequest {
    pub fn new(req: &TestRunRequest, attack: &ClientConfig, judge: &ClientConfig) -> Self {
        Self {
            tested_model: req.tested_model.as_redacted(),
            attack_model: attack.as_redacted(),
            judge_model: judge.as_redacted(),
            run_config: req.run_config.clone(),
            plan: req.plan.clone(),
        }
    }
}

impl ClientConfig {
    pub fn as_redacted(&self) -> RedactedClient {
        RedactedClient::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_become_flags() {
        let req = TestRunRequest {
            tested_model: ClientConfig::new("http://tested/v1", "t").with_api_key("sk-tested"),
            run_config: None,
            plan: TestPlan::default(),
        };
        let attack = ClientConfig::new("http://attack/v1", "a").with_api_key("sk-attack");
        let judge = ClientConfig::new("http://judge/v1", "j");

        let redacted = RedactedRequest::new(&req, &attack, &judge);
        assert!(redacted.tested_model.api_key_present);
        assert!(redacted.attack_model.api_key_present);
        assert!(!redacted.judge_model.api_key_present);
        assert_eq!(redacted.judge_model.model, "j");

        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("sk-"));
        assert!(!json.contains("\"api_key\""));
    }
}
