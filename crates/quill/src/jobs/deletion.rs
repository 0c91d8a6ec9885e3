//! Cascading user deletion.
//!
//! Runs at most once at a time per user so it never interleaves with another
//! deletion of the same account.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};

use quill_core::capability::{EmailMessage, IdentityProvider, Mailer};
use quill_core::error::Result;
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::step::StepContext;

use super::escape_html;
use crate::ports::{DeletedRecords, OwnershipStore, UserDirectory, UserRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct DeletionInput {
    /// Also the concurrency key, so it must arrive exactly as stored.
    #[serde(deserialize_with = "exact_id")]
    pub user_id: String,
    /// Receives the user's classes and exercises. Without one they are
    /// archived.
    #[serde(default)]
    pub successor_id: Option<String>,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

fn default_notify() -> bool {
    true
}

fn exact_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let id = String::deserialize(deserializer)?;
    if id.is_empty() {
        return Err(serde::de::Error::custom("user_id is required"));
    }
    if id.trim() != id {
        return Err(serde::de::Error::custom(
            "user_id must not have surrounding whitespace",
        ));
    }
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handover {
    Reassigned,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverSummary {
    pub mode: Handover,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub user_id: String,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<HandoverSummary>,
    #[serde(default)]
    pub records: DeletedRecords,
    pub notified: bool,
}

/// Deletes a user and everything hanging off the account.
pub struct UserDeletion {
    users: Arc<dyn UserDirectory>,
    ownership: Arc<dyn OwnershipStore>,
    identity: Arc<dyn IdentityProvider>,
    mailer: Arc<dyn Mailer>,
}

impl UserDeletion {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        ownership: Arc<dyn OwnershipStore>,
        identity: Arc<dyn IdentityProvider>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            users,
            ownership,
            identity,
            mailer,
        }
    }

    async fn hand_over(&self, user: &UserRecord, successor_id: Option<&str>) -> Result<HandoverSummary> {
        if let Some(successor_id) = successor_id {
            match self.users.get(successor_id).await? {
                Some(successor) if successor.org_id == user.org_id && successor.id != user.id => {
                    let count = self.ownership.reassign(&user.id, &successor.id).await?;
                    return Ok(HandoverSummary {
                        mode: Handover::Reassigned,
                        count,
                        successor_id: Some(successor.id),
                    });
                }
                _ => {
                    tracing::warn!(
                        user_id = %user.id,
                        successor_id,
                        "Successor unusable, archiving owned entities instead"
                    );
                }
            }
        }
        let count = self.ownership.archive(&user.id).await?;
        Ok(HandoverSummary {
            mode: Handover::Archived,
            count,
            successor_id: None,
        })
    }
}

fn farewell(user: &UserRecord) -> EmailMessage {
    EmailMessage {
        to: user.email.clone(),
        subject: "Your account has been deleted".into(),
        html: format!(
            "<p>Hi {},</p><p>Your account and its data have been deleted. \
             If you did not expect this, contact your school administrator.</p>",
            escape_html(&user.name)
        ),
        text: None,
        idempotency_key: Some(format!("deletion:{}", user.id)),
    }
}

impl QuillFunction for UserDeletion {
    type Input = DeletionInput;
    type Output = DeletionReport;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("user-deletion", "users/deletion.requested")
            .named("Delete user")
            .concurrency(1, Some("/user_id"))
            .retry(RetryConfig::attempts(5))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: DeletionInput,
    ) -> BoxFuture<'a, Result<DeletionReport>> {
        Box::pin(async move {
            let user_id = input.user_id.as_str();

            let user: Option<UserRecord> = ctx
                .step("load-user", || self.users.get(user_id))
                .run()
                .await?;
            let Some(user) = user else {
                tracing::info!(user_id, "User not found, nothing to delete");
                return Ok(DeletionReport {
                    user_id: user_id.to_string(),
                    deleted: false,
                    handover: None,
                    records: DeletedRecords::default(),
                    notified: false,
                });
            };

            let handover: HandoverSummary = ctx
                .step("reassign-owned", || {
                    self.hand_over(&user, input.successor_id.as_deref())
                })
                .run()
                .await?;

            ctx.step("revoke-auth", || self.identity.revoke(&user.id))
                .run()
                .await?;

            let records: DeletedRecords = ctx
                .step("delete-records", || self.users.delete(&user.id))
                .run()
                .await?;

            let notified = if input.notify {
                ctx.step("notify", || async {
                    self.mailer.send(farewell(&user)).await?;
                    Ok(true)
                })
                .run()
                .await?
            } else {
                false
            };

            tracing::info!(
                user_id = %user.id,
                handed_over = handover.count,
                submissions = records.submissions,
                "User deleted"
            );

            Ok(DeletionReport {
                user_id: user.id,
                deleted: true,
                handover: Some(handover),
                records,
                notified,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::UserRole;

    #[test]
    fn test_farewell_is_deduplicated_per_user() {
        let user = UserRecord {
            id: "u1".into(),
            org_id: "o1".into(),
            email: "u1@example.com".into(),
            name: "Uma".into(),
            role: UserRole::Teacher,
            locale: None,
        };
        let message = farewell(&user);
        assert_eq!(message.to, "u1@example.com");
        assert_eq!(message.idempotency_key.as_deref(), Some("deletion:u1"));
    }

    #[test]
    fn test_padded_or_empty_user_id_is_rejected() {
        for id in [" u1", "u1 ", ""] {
            let parsed = serde_json::from_value::<DeletionInput>(serde_json::json!({"user_id": id}));
            assert!(parsed.is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn test_input_defaults() {
        let input: DeletionInput = serde_json::from_value(serde_json::json!({"user_id": "u1"})).unwrap();
        assert!(input.notify);
        assert!(input.successor_id.is_none());
    }
}
