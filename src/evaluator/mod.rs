//! LLM-backed evaluation of agent outputs.
//!
//! Each criterion is evaluated by sending the same prompt to the model
//! several times concurrently, parsing every answer, and aggregating:
//!
//! - `score`: the mean of the parsed scores, rounded to one decimal
//! - `success-failure`: majority vote, with a tie counting as failure

pub mod openai;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{EvaluationError, LlmError};
use crate::models::{CriteriaDocument, EvaluationCriteria, EvaluationJob, EvaluationMethod};

pub use openai::{OpenAiClient, SimulatedClient};

static SCORE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("score pattern is valid"));

/// A text-completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync + fmt::Debug {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Failure,
}

/// The interpreted value of one model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedResponse {
    Score(f64),
    Verdict(Verdict),
}

/// One raw model response and its interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub raw: String,
    pub parsed: ParsedResponse,
}

/// Aggregate over all samples of a criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Aggregate {
    Score {
        score: f64,
    },
    Verdict {
        verdict: Verdict,
        success_count: usize,
        failure_count: usize,
    },
}

/// Outcome of evaluating one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionEvaluation {
    pub name: String,
    pub method: EvaluationMethod,
    pub samples: Vec<Sample>,
    pub aggregate: Aggregate,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Builds evaluation prompts and aggregates sampled model answers.
#[derive(Debug, Clone)]
pub struct EvaluationService {
    client: Arc<dyn CompletionClient>,
    samples: usize,
}

impl EvaluationService {
    /// `samples` is clamped to at least one call per criterion.
    pub fn new(client: Arc<dyn CompletionClient>, samples: usize) -> Self {
        Self {
            client,
            samples: samples.max(1),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// The prompt sent for one criterion.
    pub fn build_prompt(
        method: EvaluationMethod,
        rules: &serde_yaml::Value,
        agent_output: Option<&str>,
    ) -> String {
        let rules_text = match rules {
            serde_yaml::Value::String(text) => text.clone(),
            other => serde_yaml::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
        };
        let agent_output = agent_output.unwrap_or("").trim();

        format!(
            "You are an objective evaluator.\n\
             Evaluate the following agent output using the rules below.\n\n\
             Method: {method}\n\n\
             Rules:\n\
             {rules_text}\n\n\
             Agent Output:\n\
             {agent_output}\n\n\
             Instructions: Provide your response in plain text. For method 'score', \
             return a single numeric score between 0 and 100 optionally followed by a brief rationale. \
             For method 'success-failure', return either 'success' or 'failure' and an optional brief rationale."
        )
    }

    /// Sample the model `samples` times concurrently and aggregate the answers.
    pub async fn evaluate_criterion(
        &self,
        name: &str,
        method: EvaluationMethod,
        rules: &serde_yaml::Value,
        agent_output: Option<&str>,
    ) -> Result<CriterionEvaluation, LlmError> {
        let prompt = Self::build_prompt(method, rules, agent_output);

        let calls = (0..self.samples).map(|_| self.client.complete(&prompt));
        let raw_responses = futures::future::try_join_all(calls).await.map_err(|e| {
            tracing::error!("Concurrent completion calls for criterion {} failed: {}", name, e);
            e
        })?;

        let samples: Vec<Sample> = raw_responses
            .into_iter()
            .map(|raw| {
                let parsed = parse_response(method, &raw);
                Sample { raw, parsed }
            })
            .collect();
        let aggregate = aggregate(method, &samples);

        Ok(CriterionEvaluation {
            name: name.to_string(),
            method,
            samples,
            aggregate,
        })
    }

    /// Evaluate a job's output against every criterion in its document.
    ///
    /// Returns the results document stored on the job.
    pub async fn evaluate_job(
        &self,
        job: &EvaluationJob,
        criteria: &EvaluationCriteria,
    ) -> Result<Value, EvaluationError> {
        let document = CriteriaDocument::from_yaml(&criteria.criteria_yaml)?;

        let mut evaluations = Vec::with_capacity(document.criteria.len());
        for criterion in &document.criteria {
            tracing::debug!(
                "Evaluating job {} against criterion {} ({})",
                job.id,
                criterion.name,
                criterion.method
            );
            let evaluation = self
                .evaluate_criterion(
                    &criterion.name,
                    criterion.method,
                    &criterion.rules,
                    job.output.as_deref(),
                )
                .await?;
            evaluations.push(evaluation);
        }

        Ok(json!({
            "agent_name": job.agent_name,
            "version": job.version,
            "criteria": evaluations,
        }))
    }
}

/// Interpret one raw model response.
pub fn parse_response(method: EvaluationMethod, raw: &str) -> ParsedResponse {
    match method {
        EvaluationMethod::Score => {
            let score = SCORE_PATTERN
                .captures(raw)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|v| round_to(v.clamp(0.0, 100.0), 2))
                .unwrap_or(0.0);
            ParsedResponse::Score(score)
        }
        EvaluationMethod::SuccessFailure => {
            let low = raw.to_lowercase();
            let verdict = if low.contains("success") && !low.contains("failure") {
                Verdict::Success
            } else {
                // "failure" alone, or ambiguous
                Verdict::Failure
            };
            ParsedResponse::Verdict(verdict)
        }
    }
}

/// Combine parsed samples into one result.
pub fn aggregate(method: EvaluationMethod, samples: &[Sample]) -> Aggregate {
    match method {
        EvaluationMethod::Score => {
            let scores: Vec<f64> = samples
                .iter()
                .filter_map(|s| match s.parsed {
                    ParsedResponse::Score(v) => Some(v),
                    ParsedResponse::Verdict(_) => None,
                })
                .collect();
            let mean = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            Aggregate::Score {
                score: round_to(mean, 1),
            }
        }
        EvaluationMethod::SuccessFailure => {
            let count = |wanted: Verdict| {
                samples
                    .iter()
                    .filter(|s| s.parsed == ParsedResponse::Verdict(wanted))
                    .count()
            };
            let success_count = count(Verdict::Success);
            let failure_count = count(Verdict::Failure);
            let verdict = if success_count > failure_count {
                Verdict::Success
            } else {
                Verdict::Failure
            };
            Aggregate::Verdict {
                verdict,
                success_count,
                failure_count,
            }
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns queued responses in order, then repeats the last one.
    #[derive(Debug)]
    struct QueuedClient {
        responses: Mutex<VecDeque<String>>,
    }

    impl QueuedClient {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for QueuedClient {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop_front().unwrap())
            } else {
                Ok(responses.front().cloned().unwrap_or_default())
            }
        }
    }

    #[derive(Debug)]
    struct FailingClient;

    #[async_trait]
    impl CompletionClient for FailingClient {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError::MissingApiKey)
        }
    }

    fn rules(text: &str) -> serde_yaml::Value {
        serde_yaml::Value::String(text.to_string())
    }

    #[test]
    fn test_build_prompt_contains_parts() {
        let prompt = EvaluationService::build_prompt(
            EvaluationMethod::Score,
            &rules("Be accurate"),
            Some("  The answer is 42.  "),
        );
        assert!(prompt.contains("Method: score"));
        assert!(prompt.contains("Be accurate"));
        assert!(prompt.contains("Agent Output:\nThe answer is 42.\n"));
    }

    #[test]
    fn test_build_prompt_renders_structured_rules_as_yaml() {
        let structured: serde_yaml::Value = serde_yaml::from_str("- polite\n- concise\n").unwrap();
        let prompt =
            EvaluationService::build_prompt(EvaluationMethod::SuccessFailure, &structured, None);
        assert!(prompt.contains("- polite"));
        assert!(prompt.contains("Method: success-failure"));
    }

    #[test]
    fn test_parse_score() {
        let score = |raw| parse_response(EvaluationMethod::Score, raw);
        assert_eq!(score("85 - solid answer"), ParsedResponse::Score(85.0));
        assert_eq!(score("Score: 72.456"), ParsedResponse::Score(72.46));
        assert_eq!(score("150"), ParsedResponse::Score(100.0));
        assert_eq!(score("no number here"), ParsedResponse::Score(0.0));
    }

    #[test]
    fn test_parse_verdict() {
        let verdict = |raw| parse_response(EvaluationMethod::SuccessFailure, raw);
        assert_eq!(verdict("Success!"), ParsedResponse::Verdict(Verdict::Success));
        assert_eq!(verdict("failure: off topic"), ParsedResponse::Verdict(Verdict::Failure));
        assert_eq!(
            verdict("not a success, a failure"),
            ParsedResponse::Verdict(Verdict::Failure)
        );
        assert_eq!(verdict("unclear"), ParsedResponse::Verdict(Verdict::Failure));
    }

    #[tokio::test]
    async fn test_score_aggregation_average() {
        let svc = EvaluationService::new(QueuedClient::new(&["80", "90", "70"]), 3);
        let result = svc
            .evaluate_criterion("accuracy", EvaluationMethod::Score, &rules("r"), Some("out"))
            .await
            .unwrap();
        assert_eq!(result.samples.len(), 3);
        assert_eq!(result.aggregate, Aggregate::Score { score: 80.0 });
    }

    #[tokio::test]
    async fn test_success_failure_majority_and_tie() {
        let svc = EvaluationService::new(
            QueuedClient::new(&["success", "success", "failure"]),
            3,
        );
        let result = svc
            .evaluate_criterion("tone", EvaluationMethod::SuccessFailure, &rules("r"), None)
            .await
            .unwrap();
        assert_eq!(
            result.aggregate,
            Aggregate::Verdict {
                verdict: Verdict::Success,
                success_count: 2,
                failure_count: 1,
            }
        );

        let svc = EvaluationService::new(QueuedClient::new(&["success", "failure"]), 2);
        let result = svc
            .evaluate_criterion("tone", EvaluationMethod::SuccessFailure, &rules("r"), None)
            .await
            .unwrap();
        assert_eq!(
            result.aggregate,
            Aggregate::Verdict {
                verdict: Verdict::Failure,
                success_count: 1,
                failure_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        let svc = EvaluationService::new(Arc::new(FailingClient), 2);
        let result = svc
            .evaluate_criterion("x", EvaluationMethod::Score, &rules("r"), None)
            .await;
        assert!(matches!(result, Err(LlmError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_evaluate_job_document() {
        let criteria = EvaluationCriteria {
            id: "crit".to_string(),
            agent_name: "agent".to_string(),
            version: 2,
            criteria_yaml: "criteria:\n  - name: accuracy\n    method: score\n    rules: cite\n  - name: tone\n    method: success-failure\n    rules: polite\n".to_string(),
            created_at: None,
        };
        let job = EvaluationJob {
            id: "job".to_string(),
            evaluation_id: "crit".to_string(),
            agent_name: "agent".to_string(),
            version: 2,
            prompt: "p".to_string(),
            output: Some("hello".to_string()),
            status: crate::models::JobStatus::InProgress,
            results: None,
            error_message: None,
            created_at: None,
            updated_at: None,
            completed_at: None,
        };

        let svc = EvaluationService::new(Arc::new(SimulatedClient), 2);
        let results = svc.evaluate_job(&job, &criteria).await.unwrap();
        assert_eq!(results["version"], 2);
        assert_eq!(results["criteria"][0]["aggregate"], json!({"score": 50.0}));
        assert_eq!(results["criteria"][1]["aggregate"]["verdict"], "failure");
        assert_eq!(results["criteria"][1]["samples"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_evaluate_job_rejects_bad_yaml() {
        let criteria = EvaluationCriteria {
            id: "c".to_string(),
            agent_name: "a".to_string(),
            version: 1,
            criteria_yaml: "criteria: [".to_string(),
            created_at: None,
        };
        let job = EvaluationJob {
            id: "j".to_string(),
            evaluation_id: "c".to_string(),
            agent_name: "a".to_string(),
            version: 1,
            prompt: "p".to_string(),
            output: None,
            status: crate::models::JobStatus::InProgress,
            results: None,
            error_message: None,
            created_at: None,
            updated_at: None,
            completed_at: None,
        };
        let svc = EvaluationService::new(Arc::new(SimulatedClient), 1);
        assert!(matches!(
            svc.evaluate_job(&job, &criteria).await,
            Err(EvaluationError::Criteria(_))
        ));
    }
}
