//! Product data the jobs read and write.
//!
//! The engine never touches these tables itself; jobs reach them through the
//! traits below. [`PgPorts`] serves them from Postgres and [`MemoryPorts`]
//! from memory for tests and database-less development.

mod memory;
mod postgres;

pub use memory::MemoryPorts;
pub use postgres::{product_migrations, PgPorts};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_core::error::Result;

/// Roles a user can hold inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Teacher,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Admin => "admin",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub org_id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    #[serde(default)]
    pub locale: Option<String>,
}

/// A user to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub org_id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

/// Result of inserting one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inserted {
    pub user: UserRecord,
    /// `false` when the email already existed in the organization.
    pub created: bool,
}

/// What a user deletion removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletedRecords {
    pub users: u64,
    pub submissions: u64,
}

/// User accounts.
pub trait UserDirectory: Send + Sync {
    /// Users of `org_id` whose email is in `emails`.
    fn find_by_emails<'a>(
        &'a self,
        org_id: &'a str,
        emails: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<UserRecord>>>;

    /// Insert all users in one transaction. Emails that already exist are
    /// returned with `created: false`; any other failure inserts nothing.
    fn insert_batch<'a>(&'a self, users: &'a [NewUser]) -> BoxFuture<'a, Result<Vec<Inserted>>>;

    /// Insert a single user.
    fn insert_one<'a>(&'a self, user: &'a NewUser) -> BoxFuture<'a, Result<Inserted>>;

    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserRecord>>>;

    /// Delete a user and the records only they own. Deleting twice is a no-op.
    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<DeletedRecords>>;
}

/// Classes, exercises and assignments owned by users.
pub trait OwnershipStore: Send + Sync {
    /// Move everything owned by `from` to `to`. Returns the number moved.
    fn reassign<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<u64>>;

    /// Archive everything owned by `owner` and clear its owner.
    fn archive<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<u64>>;
}

/// Kinds of exercise questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    ShortAnswer,
    FillBlank,
    MultipleChoice,
    TrueFalse,
    OpenEnded,
}

impl QuestionKind {
    /// Kinds scored by deterministic matching.
    pub fn is_objective(&self) -> bool {
        !matches!(self, Self::OpenEnded)
    }
}

/// A selectable option of a multiple-choice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

/// A question with its answer key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    /// Expected answer for text and true/false questions.
    #[serde(default)]
    pub correct_answer: Option<String>,
    /// Other accepted spellings of `correct_answer`.
    #[serde(default)]
    pub accepted_variants: Vec<String>,
    /// Option ids that must all be selected, and nothing else.
    #[serde(default)]
    pub correct_options: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    pub max_points: f64,
    #[serde(default)]
    pub word_limit: Option<usize>,
    /// Grading guidance for open-ended questions.
    #[serde(default)]
    pub rubric: Option<String>,
}

/// Generated questions waiting to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQuestion {
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub accepted_variants: Vec<String>,
    #[serde(default)]
    pub correct_options: Vec<String>,
    pub max_points: f64,
    #[serde(default)]
    pub rubric: Option<String>,
}

impl NewQuestion {
    pub fn into_question(self, id: String) -> Question {
        Question {
            id,
            kind: self.kind,
            prompt: self.prompt,
            options: self.options,
            correct_answer: self.correct_answer,
            accepted_variants: self.accepted_variants,
            correct_options: self.correct_options,
            case_sensitive: false,
            max_points: self.max_points,
            word_limit: None,
            rubric: self.rubric,
        }
    }
}

/// Exercise questions.
pub trait QuestionBank: Send + Sync {
    /// Store questions generated by one run, replacing anything that run
    /// stored before. Returns the question ids in order.
    fn save_generated<'a>(
        &'a self,
        exercise_id: &'a str,
        run_id: Uuid,
        questions: &'a [NewQuestion],
    ) -> BoxFuture<'a, Result<Vec<String>>>;

    fn list<'a>(&'a self, exercise_id: &'a str) -> BoxFuture<'a, Result<Vec<Question>>>;
}

/// A student's answer to one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Selected option ids.
    #[serde(default)]
    pub selected: Vec<String>,
}

/// A submitted exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub exercise_id: String,
    pub student_id: String,
    pub answers: Vec<Answer>,
}

/// A submission with the questions it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionBundle {
    pub submission: Submission,
    pub questions: Vec<Question>,
}

/// How a question was scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    Matching,
    Model,
    Unanswered,
}

/// Score of one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question_id: String,
    pub points: f64,
    pub max_points: f64,
    pub method: ScoreMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// A graded submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub submission_id: String,
    pub score: f64,
    pub max_score: f64,
    pub questions: Vec<QuestionScore>,
    pub graded_at: DateTime<Utc>,
}

/// Submissions and their grades.
pub trait SubmissionStore: Send + Sync {
    fn load<'a>(&'a self, submission_id: &'a str)
        -> BoxFuture<'a, Result<Option<SubmissionBundle>>>;

    /// Store a grade, replacing an earlier one.
    fn save_grade<'a>(&'a self, grade: &'a Grade) -> BoxFuture<'a, Result<()>>;
}

/// One delivered session email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEntry {
    pub session_id: String,
    pub kind: String,
    pub email: String,
    pub delivery_id: String,
}

/// Record of sent session emails.
pub trait DeliveryLog: Send + Sync {
    /// Record deliveries. Entries already recorded are left as they are.
    fn record<'a>(&'a self, entries: &'a [DeliveryEntry]) -> BoxFuture<'a, Result<()>>;
}
