//! Bulk user import.
//!
//! Rows are validated, checked against existing accounts, inserted in
//! batches and welcomed by email. A failed batch is retried row by row so
//! one bad row cannot sink its neighbours; batches already committed stay
//! committed. The output reports what happened to every row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use quill_core::capability::{EmailMessage, Mailer};
use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::step::StepContext;

use super::escape_html;
use crate::ports::{Inserted, NewUser, UserDirectory, UserRole};

pub const DEFAULT_BATCH_SIZE: usize = 50;
const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRow {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportInput {
    pub org_id: String,
    pub rows: Vec<ImportRow>,
    #[serde(default = "default_true")]
    pub send_welcome: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Created,
    Existing,
    Invalid,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WelcomeStatus {
    Sent,
    Skipped,
    Failed,
}

/// Outcome of one input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub index: usize,
    pub email: String,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome: Option<WelcomeStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub org_id: String,
    pub total: usize,
    pub created: usize,
    pub existing: usize,
    pub invalid: usize,
    pub failed: usize,
    pub rows: Vec<RowOutcome>,
}

/// A row that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ValidRow {
    index: usize,
    user: NewUser,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Validated {
    valid: Vec<ValidRow>,
    invalid: Vec<RowOutcome>,
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        && !email.contains(char::is_whitespace)
}

fn validate_rows(org_id: &str, rows: &[ImportRow]) -> Validated {
    let mut seen = HashSet::new();
    let mut out = Validated::default();

    for (index, row) in rows.iter().enumerate() {
        let email = row.email.trim().to_lowercase();
        let name = row.name.split_whitespace().collect::<Vec<_>>().join(" ");
        let role = row
            .role
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(str::parse::<UserRole>)
            .unwrap_or(Ok(UserRole::Student));

        let problem = if !is_plausible_email(&email) {
            Some(format!("invalid email '{}'", row.email.trim()))
        } else if name.is_empty() {
            Some("name is required".to_string())
        } else if let Err(e) = &role {
            Some(e.clone())
        } else if !seen.insert(email.clone()) {
            Some("duplicate of an earlier row".to_string())
        } else {
            None
        };

        match (problem, role) {
            (None, Ok(role)) => out.valid.push(ValidRow {
                index,
                user: NewUser {
                    org_id: org_id.to_string(),
                    email,
                    name,
                    role,
                },
            }),
            (problem, _) => out.invalid.push(RowOutcome {
                index,
                email,
                status: RowStatus::Invalid,
                user_id: None,
                error: problem,
                welcome: None,
            }),
        }
    }
    out
}

fn outcome(index: usize, inserted: Inserted) -> RowOutcome {
    RowOutcome {
        index,
        email: inserted.user.email,
        status: if inserted.created {
            RowStatus::Created
        } else {
            RowStatus::Existing
        },
        user_id: Some(inserted.user.id),
        error: None,
        welcome: None,
    }
}

fn welcome_message(org_id: &str, row: &ValidRow) -> EmailMessage {
    let name = escape_html(&row.user.name);
    EmailMessage {
        to: row.user.email.clone(),
        subject: "Welcome to your new classroom account".into(),
        html: format!(
            "<p>Hi {name},</p><p>An account was created for you as a {}. \
             Sign in with this email address to get started.</p>",
            row.user.role.as_str()
        ),
        text: Some(format!(
            "Hi {},\n\nAn account was created for you as a {}. Sign in with this email address to get started.",
            row.user.name,
            row.user.role.as_str()
        )),
        idempotency_key: Some(format!("welcome:{org_id}:{}", row.user.email)),
    }
}

/// Creates accounts from an uploaded roster.
pub struct BulkUserImport {
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn Mailer>,
}

impl BulkUserImport {
    pub fn new(users: Arc<dyn UserDirectory>, mailer: Arc<dyn Mailer>) -> Self {
        Self { users, mailer }
    }

    async fn create_batch(&self, batch: &[ValidRow]) -> Result<Vec<RowOutcome>> {
        let users: Vec<NewUser> = batch.iter().map(|r| r.user.clone()).collect();
        match self.users.insert_batch(&users).await {
            Ok(inserted) => Ok(batch
                .iter()
                .zip(inserted)
                .map(|(row, inserted)| outcome(row.index, inserted))
                .collect()),
            Err(e) => {
                tracing::warn!(
                    rows = batch.len(),
                    error = %e,
                    "Batch insert failed, falling back to single inserts"
                );
                let mut outcomes = Vec::with_capacity(batch.len());
                for row in batch {
                    match self.users.insert_one(&row.user).await {
                        Ok(inserted) => outcomes.push(outcome(row.index, inserted)),
                        Err(e) if e.is_retryable() => return Err(e),
                        Err(e) => outcomes.push(RowOutcome {
                            index: row.index,
                            email: row.user.email.clone(),
                            status: RowStatus::Failed,
                            user_id: None,
                            error: Some(e.to_string()),
                            welcome: None,
                        }),
                    }
                }
                Ok(outcomes)
            }
        }
    }

    async fn send_welcome(&self, org_id: &str, row: &ValidRow) -> Result<WelcomeStatus> {
        match self.mailer.send(welcome_message(org_id, row)).await {
            Ok(_) => Ok(WelcomeStatus::Sent),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(email = %row.user.email, error = %e, "Welcome email rejected");
                Ok(WelcomeStatus::Failed)
            }
        }
    }
}

impl QuillFunction for BulkUserImport {
    type Input = ImportInput;
    type Output = ImportReport;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("bulk-user-import", "users/import.requested")
            .named("Bulk user import")
            .concurrency(1, Some("/org_id"))
            .retry(RetryConfig::attempts(5))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: ImportInput,
    ) -> BoxFuture<'a, Result<ImportReport>> {
        Box::pin(async move {
            if input.org_id.trim().is_empty() {
                return Err(QuillError::Validation("org_id is required".into()));
            }
            let org_id = input.org_id.as_str();
            let batch_size = input
                .batch_size
                .unwrap_or(DEFAULT_BATCH_SIZE)
                .clamp(1, MAX_BATCH_SIZE);

            let validated: Validated = ctx
                .step("validate-rows", || async {
                    Ok(validate_rows(org_id, &input.rows))
                })
                .run()
                .await?;

            let existing: Vec<String> = ctx
                .step("dedupe-existing", || async {
                    let emails: Vec<String> =
                        validated.valid.iter().map(|r| r.user.email.clone()).collect();
                    let found = self.users.find_by_emails(org_id, &emails).await?;
                    Ok(found.into_iter().map(|u| u.email).collect())
                })
                .run()
                .await?;

            let existing: HashSet<&str> = existing.iter().map(String::as_str).collect();
            let pending: Vec<ValidRow> = validated
                .valid
                .iter()
                .filter(|r| !existing.contains(r.user.email.as_str()))
                .cloned()
                .collect();

            let mut outcomes: Vec<RowOutcome> = validated.invalid.clone();
            outcomes.extend(
                validated
                    .valid
                    .iter()
                    .filter(|r| existing.contains(r.user.email.as_str()))
                    .map(|r| RowOutcome {
                        index: r.index,
                        email: r.user.email.clone(),
                        status: RowStatus::Existing,
                        user_id: None,
                        error: None,
                        welcome: None,
                    }),
            );

            for batch in pending.chunks(batch_size) {
                let created: Vec<RowOutcome> = ctx
                    .step("create-batch", || self.create_batch(batch))
                    .run()
                    .await?;
                outcomes.extend(created);
            }

            let rows_by_index: HashMap<usize, &ValidRow> =
                pending.iter().map(|r| (r.index, r)).collect();
            for outcome in outcomes.iter_mut() {
                if outcome.status != RowStatus::Created {
                    continue;
                }
                let Some(row) = rows_by_index.get(&outcome.index) else {
                    continue;
                };
                outcome.welcome = Some(if input.send_welcome {
                    ctx.step("send-welcome", || self.send_welcome(org_id, row))
                        .run()
                        .await?
                } else {
                    WelcomeStatus::Skipped
                });
            }

            outcomes.sort_by_key(|o| o.index);
            let count = |status: RowStatus| outcomes.iter().filter(|o| o.status == status).count();
            let report = ImportReport {
                org_id: org_id.to_string(),
                total: input.rows.len(),
                created: count(RowStatus::Created),
                existing: count(RowStatus::Existing),
                invalid: count(RowStatus::Invalid),
                failed: count(RowStatus::Failed),
                rows: outcomes.clone(),
            };

            tracing::info!(
                org_id = %report.org_id,
                total = report.total,
                created = report.created,
                existing = report.existing,
                invalid = report.invalid,
                failed = report.failed,
                "Import finished"
            );
            Ok(report)
        })
    }
}
