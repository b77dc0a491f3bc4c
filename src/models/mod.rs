//! Data model for evaluation criteria and evaluation jobs.

pub mod criteria;
pub mod evaluation;

pub use criteria::{CriteriaDocument, CriterionSpec, EvaluationMethod};
pub use evaluation::{EvaluationCriteria, EvaluationJob, JobStatus, NewJob, Timestamp};
