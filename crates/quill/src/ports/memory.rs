use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use quill_core::error::{QuillError, Result};

use super::{
    DeletedRecords, DeliveryEntry, DeliveryLog, Grade, Inserted, NewQuestion, NewUser,
    OwnershipStore, Question, QuestionBank, Submission, SubmissionBundle, SubmissionStore,
    UserDirectory, UserRecord,
};

/// An owned class, exercise or assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedEntity {
    pub id: String,
    pub kind: String,
    pub owner_id: Option<String>,
    pub archived: bool,
}

#[derive(Default)]
struct Inner {
    users: BTreeMap<String, UserRecord>,
    rejected_emails: HashSet<String>,
    owned: Vec<OwnedEntity>,
    questions: HashMap<String, Vec<(Option<Uuid>, Question)>>,
    submissions: HashMap<String, Submission>,
    grades: HashMap<String, Grade>,
    deliveries: Vec<DeliveryEntry>,
}

impl Inner {
    fn find(&self, org_id: &str, email: &str) -> Option<&UserRecord> {
        self.users
            .values()
            .find(|u| u.org_id == org_id && u.email == email)
    }

    fn check(&self, user: &NewUser) -> Result<()> {
        if self.rejected_emails.contains(&user.email) {
            return Err(QuillError::Validation(format!(
                "email '{}' violates a constraint",
                user.email
            )));
        }
        Ok(())
    }

    fn insert(&mut self, user: &NewUser) -> Inserted {
        if let Some(existing) = self.find(&user.org_id, &user.email) {
            return Inserted {
                user: existing.clone(),
                created: false,
            };
        }
        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            org_id: user.org_id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            locale: None,
        };
        self.users.insert(record.id.clone(), record.clone());
        Inserted {
            user: record,
            created: true,
        }
    }
}

/// Every product port, held in memory.
#[derive(Clone, Default)]
pub struct MemoryPorts {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: UserRecord) {
        self.inner.lock().await.users.insert(user.id.clone(), user);
    }

    /// Make inserts of `email` fail with a validation error.
    pub async fn reject_email(&self, email: &str) {
        self.inner
            .lock()
            .await
            .rejected_emails
            .insert(email.to_string());
    }

    pub async fn add_owned(&self, id: &str, kind: &str, owner_id: &str) {
        self.inner.lock().await.owned.push(OwnedEntity {
            id: id.to_string(),
            kind: kind.to_string(),
            owner_id: Some(owner_id.to_string()),
            archived: false,
        });
    }

    pub async fn add_question(&self, exercise_id: &str, question: Question) {
        self.inner
            .lock()
            .await
            .questions
            .entry(exercise_id.to_string())
            .or_default()
            .push((None, question));
    }

    pub async fn add_submission(&self, submission: Submission) {
        self.inner
            .lock()
            .await
            .submissions
            .insert(submission.id.clone(), submission);
    }

    pub async fn users(&self) -> Vec<UserRecord> {
        self.inner.lock().await.users.values().cloned().collect()
    }

    pub async fn owned(&self) -> Vec<OwnedEntity> {
        self.inner.lock().await.owned.clone()
    }

    pub async fn grade(&self, submission_id: &str) -> Option<Grade> {
        self.inner.lock().await.grades.get(submission_id).cloned()
    }

    pub async fn deliveries(&self) -> Vec<DeliveryEntry> {
        self.inner.lock().await.deliveries.clone()
    }
}

impl UserDirectory for MemoryPorts {
    fn find_by_emails<'a>(
        &'a self,
        org_id: &'a str,
        emails: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<UserRecord>>> {
        Box::pin(async move {
            let wanted: HashSet<&str> = emails.iter().map(String::as_str).collect();
            Ok(self
                .inner
                .lock()
                .await
                .users
                .values()
                .filter(|u| u.org_id == org_id && wanted.contains(u.email.as_str()))
                .cloned()
                .collect())
        })
    }

    fn insert_batch<'a>(&'a self, users: &'a [NewUser]) -> BoxFuture<'a, Result<Vec<Inserted>>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            for user in users {
                inner.check(user)?;
            }
            Ok(users.iter().map(|u| inner.insert(u)).collect())
        })
    }

    fn insert_one<'a>(&'a self, user: &'a NewUser) -> BoxFuture<'a, Result<Inserted>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.check(user)?;
            Ok(inner.insert(user))
        })
    }

    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserRecord>>> {
        Box::pin(async move { Ok(self.inner.lock().await.users.get(user_id).cloned()) })
    }

    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<DeletedRecords>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let users = u64::from(inner.users.remove(user_id).is_some());
            let doomed: Vec<String> = inner
                .submissions
                .values()
                .filter(|s| s.student_id == user_id)
                .map(|s| s.id.clone())
                .collect();
            for id in &doomed {
                inner.submissions.remove(id);
                inner.grades.remove(id);
            }
            Ok(DeletedRecords {
                users,
                submissions: doomed.len() as u64,
            })
        })
    }
}

impl OwnershipStore for MemoryPorts {
    fn reassign<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let mut moved = 0;
            for entity in inner
                .owned
                .iter_mut()
                .filter(|e| e.owner_id.as_deref() == Some(from))
            {
                entity.owner_id = Some(to.to_string());
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn archive<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let mut archived = 0;
            for entity in inner
                .owned
                .iter_mut()
                .filter(|e| e.owner_id.as_deref() == Some(owner))
            {
                entity.owner_id = None;
                entity.archived = true;
                archived += 1;
            }
            Ok(archived)
        })
    }
}

impl QuestionBank for MemoryPorts {
    fn save_generated<'a>(
        &'a self,
        exercise_id: &'a str,
        run_id: Uuid,
        questions: &'a [NewQuestion],
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let stored = inner.questions.entry(exercise_id.to_string()).or_default();
            stored.retain(|(source, _)| *source != Some(run_id));

            let mut ids = Vec::with_capacity(questions.len());
            for question in questions {
                let id = Uuid::new_v4().to_string();
                stored.push((Some(run_id), question.clone().into_question(id.clone())));
                ids.push(id);
            }
            Ok(ids)
        })
    }

    fn list<'a>(&'a self, exercise_id: &'a str) -> BoxFuture<'a, Result<Vec<Question>>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .questions
                .get(exercise_id)
                .map(|qs| qs.iter().map(|(_, q)| q.clone()).collect())
                .unwrap_or_default())
        })
    }
}

impl SubmissionStore for MemoryPorts {
    fn load<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SubmissionBundle>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let Some(submission) = inner.submissions.get(submission_id).cloned() else {
                return Ok(None);
            };
            let questions = inner
                .questions
                .get(&submission.exercise_id)
                .map(|qs| qs.iter().map(|(_, q)| q.clone()).collect())
                .unwrap_or_default();
            Ok(Some(SubmissionBundle {
                submission,
                questions,
            }))
        })
    }

    fn save_grade<'a>(&'a self, grade: &'a Grade) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .grades
                .insert(grade.submission_id.clone(), grade.clone());
            Ok(())
        })
    }
}

impl DeliveryLog for MemoryPorts {
    fn record<'a>(&'a self, entries: &'a [DeliveryEntry]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            for entry in entries {
                let seen = inner.deliveries.iter().any(|d| {
                    d.session_id == entry.session_id && d.kind == entry.kind && d.email == entry.email
                });
                if !seen {
                    inner.deliveries.push(entry.clone());
                }
            }
            Ok(())
        })
    }
}
