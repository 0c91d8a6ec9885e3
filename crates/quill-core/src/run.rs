//! Run lifecycle.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuillError, Result};
use crate::event::Event;

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, waiting for a concurrency slot or the first invocation.
    Scheduled,
    /// Claimed; steps are being executed or retried.
    Running,
    /// Body returned successfully.
    Completed,
    /// Attempts exhausted or a fatal error was raised.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl RunStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Running)
                | (Self::Scheduled, Self::Cancelled)
                | (Self::Scheduled, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(QuillError::InvalidState(format!("unknown run status '{other}'"))),
        }
    }
}

/// One execution of a function for one triggering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub function_id: String,
    pub event_id: String,
    /// Full triggering event.
    pub event: Event,
    /// Resolved concurrency key, if the function limits per key.
    pub concurrency_key: Option<String>,
    pub status: RunStatus,
    /// Failed attempts of the current step. Reset when a step succeeds.
    pub attempt: u32,
    /// Earliest time the scheduler may advance the run.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Create a scheduled run for an event.
    pub fn new(function_id: impl Into<String>, event: Event, concurrency_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            function_id: function_id.into(),
            event_id: event.event_id().to_string(),
            event,
            concurrency_key,
            status: RunStatus::Scheduled,
            attempt: 0,
            next_run_at: Some(now),
            created_at: now,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            leased_until: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(QuillError::InvalidState(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the run as claimed.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a successful step: clears the attempt counter and makes the run due now.
    pub fn step_succeeded(&mut self) {
        self.attempt = 0;
        self.error = None;
        self.next_run_at = Some(Utc::now());
    }

    /// Record a retryable failure and when to try again.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.attempt += 1;
        self.error = Some(error.into());
        self.next_run_at = Some(at);
    }

    /// Push the next invocation back without consuming an attempt.
    pub fn defer(&mut self, at: DateTime<Utc>) {
        self.next_run_at = Some(at);
    }

    pub fn complete(&mut self, output: serde_json::Value) -> Result<()> {
        self.transition(RunStatus::Completed)?;
        self.output = Some(output);
        self.error = None;
        self.finish();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        self.finish();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(RunStatus::Cancelled)?;
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        self.next_run_at = None;
    }
}
