use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuillError;

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Known but not finished.
    Pending,
    /// Finished; result is final.
    Succeeded,
    /// Last attempt failed.
    Failed,
}

impl StepStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(QuillError::InvalidState(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

/// Persisted outcome of one named step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub step_name: String,
    /// Order in which the body reached the step.
    pub position: u32,
    pub attempts: u32,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn succeeded(
        run_id: Uuid,
        step_name: impl Into<String>,
        position: u32,
        attempts: u32,
        result: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            position,
            attempts,
            status: StepStatus::Succeeded,
            result: Some(result),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(
        run_id: Uuid,
        step_name: impl Into<String>,
        position: u32,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            position,
            attempts,
            status: StepStatus::Failed,
            result: None,
            error: Some(error.into()),
            updated_at: Utc::now(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}
