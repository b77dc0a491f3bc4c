//! YAML criteria documents.
//!
//! A criteria document lists the checks an agent output is evaluated against:
//!
//! ```yaml
//! criteria:
//!   - name: accuracy
//!     method: score
//!     rules: The answer must cite at least one source.
//!   - name: tone
//!     method: success-failure
//!     rules:
//!       - polite
//!       - no jargon
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::EvaluationError;

/// How a criterion's LLM responses are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvaluationMethod {
    /// A numeric score between 0 and 100.
    #[serde(rename = "score")]
    Score,
    /// A `success` / `failure` verdict.
    #[serde(rename = "success-failure")]
    SuccessFailure,
}

impl EvaluationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMethod::Score => "score",
            EvaluationMethod::SuccessFailure => "success-failure",
        }
    }
}

impl fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionSpec {
    pub name: String,
    pub method: EvaluationMethod,
    /// Free-form rules; strings are used verbatim, anything else is re-rendered as YAML.
    #[serde(default)]
    pub rules: serde_yaml::Value,
}

/// The parsed contents of [`EvaluationCriteria::criteria_yaml`](super::EvaluationCriteria).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaDocument {
    pub criteria: Vec<CriterionSpec>,
}

impl CriteriaDocument {
    /// Parse and validate a YAML criteria document.
    pub fn from_yaml(yaml: &str) -> Result<Self, EvaluationError> {
        let doc: CriteriaDocument = serde_yaml::from_str(yaml)?;
        if doc.criteria.is_empty() {
            return Err(EvaluationError::EmptyCriteria);
        }
        Ok(doc)
    }
}
