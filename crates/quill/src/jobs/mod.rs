//! The platform's durable jobs.
//!
//! | id | trigger |
//! |----|---------|
//! | `bulk-user-import` | `users/import.requested` |
//! | `user-deletion` | `users/deletion.requested` |
//! | `session-notification` | `sessions/scheduled` |
//! | `session-cancellation` | `sessions/cancelled` |
//! | `question-generation` | `exercises/questions.requested` |
//! | `submission-grading` | `submissions/submitted` |

pub mod deletion;
pub mod grading;
pub mod import;
pub mod question_gen;
pub mod session_email;

#[cfg(test)]
mod end_to_end;

use std::sync::Arc;

use quill_core::capability::{Generator, IdentityProvider, Mailer, ObjectStore, TextExtractor};
use quill_core::error::Result;
use quill_runtime::jobs::FunctionRegistry;

use crate::ports::{DeliveryLog, OwnershipStore, QuestionBank, SubmissionStore, UserDirectory};

pub use deletion::UserDeletion;
pub use grading::SubmissionGrading;
pub use import::BulkUserImport;
pub use question_gen::QuestionGeneration;
pub use session_email::{SessionCancellation, SessionNotification};

/// Everything the jobs depend on.
#[derive(Clone)]
pub struct JobServices {
    pub users: Arc<dyn UserDirectory>,
    pub ownership: Arc<dyn OwnershipStore>,
    pub questions: Arc<dyn QuestionBank>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub deliveries: Arc<dyn DeliveryLog>,
    pub mailer: Arc<dyn Mailer>,
    pub generator: Arc<dyn Generator>,
    pub extractor: Arc<dyn TextExtractor>,
    pub storage: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Register every job.
pub fn register_all(registry: &mut FunctionRegistry, services: &JobServices) -> Result<()> {
    registry.register(BulkUserImport::new(
        services.users.clone(),
        services.mailer.clone(),
    ))?;
    registry.register(UserDeletion::new(
        services.users.clone(),
        services.ownership.clone(),
        services.identity.clone(),
        services.mailer.clone(),
    ))?;
    registry.register(SessionNotification::new(
        services.mailer.clone(),
        services.deliveries.clone(),
    ))?;
    registry.register(SessionCancellation::new(
        services.mailer.clone(),
        services.deliveries.clone(),
    ))?;
    registry.register(QuestionGeneration::new(
        services.storage.clone(),
        services.extractor.clone(),
        services.generator.clone(),
        services.questions.clone(),
    ))?;
    registry.register(SubmissionGrading::new(
        services.submissions.clone(),
        services.generator.clone(),
    ))?;
    Ok(())
}

/// The JSON document inside a model reply, which may wrap it in prose or a
/// code fence.
pub(crate) fn extract_json(reply: &str) -> &str {
    let trimmed = reply.trim();
    match (trimmed.find(['{', '[']), trimmed.rfind(['}', ']'])) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Minimal HTML escaping for text placed in email bodies.
pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Here you go: [1, 2]. Enjoy"), "[1, 2]");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>Tom & \"Jerry\"</b>"),
            "&lt;b&gt;Tom &amp; &quot;Jerry&quot;&lt;/b&gt;"
        );
    }
}
