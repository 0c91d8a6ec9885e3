use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use quill_core::error::{QuillError, Result};
use quill_runtime::Migration;

use super::{
    DeletedRecords, DeliveryEntry, DeliveryLog, Grade, Inserted, NewQuestion, NewUser,
    OwnershipStore, Question, QuestionBank, Submission, SubmissionBundle, SubmissionStore,
    UserDirectory, UserRecord,
};

const PRODUCT_SQL: &str = include_str!("../../migrations/0101_product.sql");

/// Schema of the product tables, applied after the engine's own.
pub fn product_migrations() -> Vec<Migration> {
    vec![Migration::new("0101_product", PRODUCT_SQL)]
}

/// Integrity violations are permanent; anything else may pass on retry.
fn classify(e: sqlx::Error) -> QuillError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().is_some_and(|code| code.starts_with("23")) {
            return QuillError::Validation(db.message().to_string());
        }
    }
    QuillError::Sql(e)
}

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    let role: String = row.try_get("role")?;
    Ok(UserRecord {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        role: role.parse().map_err(QuillError::Database)?,
        locale: row.try_get("locale")?,
    })
}

fn question_from_row(row: &PgRow) -> Result<Question> {
    let mut question: Question = serde_json::from_value(row.try_get("body")?)?;
    question.id = row.try_get("id")?;
    Ok(question)
}

/// Product ports over the tables in `0101_product.sql`.
#[derive(Clone)]
pub struct PgPorts {
    pool: PgPool,
}

impl PgPorts {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_with(conn: &mut PgConnection, user: &NewUser) -> Result<Inserted> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, org_id, email, name, role)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (org_id, email) DO NOTHING
            RETURNING id, org_id, email, name, role, locale
            "#,
        )
        .bind(&id)
        .bind(&user.org_id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify)?;

        if let Some(row) = row {
            return Ok(Inserted {
                user: user_from_row(&row)?,
                created: true,
            });
        }

        let row = sqlx::query(
            "SELECT id, org_id, email, name, role, locale FROM users WHERE org_id = $1 AND email = $2",
        )
        .bind(&user.org_id)
        .bind(&user.email)
        .fetch_one(&mut *conn)
        .await?;
        Ok(Inserted {
            user: user_from_row(&row)?,
            created: false,
        })
    }
}

impl UserDirectory for PgPorts {
    fn find_by_emails<'a>(
        &'a self,
        org_id: &'a str,
        emails: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<UserRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT id, org_id, email, name, role, locale
                FROM users
                WHERE org_id = $1 AND email = ANY($2)
                "#,
            )
            .bind(org_id)
            .bind(emails)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(user_from_row).collect()
        })
    }

    fn insert_batch<'a>(&'a self, users: &'a [NewUser]) -> BoxFuture<'a, Result<Vec<Inserted>>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let mut inserted = Vec::with_capacity(users.len());
            for user in users {
                inserted.push(Self::insert_with(&mut *tx, user).await?);
            }
            tx.commit().await?;
            Ok(inserted)
        })
    }

    fn insert_one<'a>(&'a self, user: &'a NewUser) -> BoxFuture<'a, Result<Inserted>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            Self::insert_with(&mut conn, user).await
        })
    }

    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserRecord>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT id, org_id, email, name, role, locale FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(user_from_row).transpose()
        })
    }

    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<DeletedRecords>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let submissions = sqlx::query("DELETE FROM submissions WHERE student_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let users = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(DeletedRecords { users, submissions })
        })
    }
}

impl OwnershipStore for PgPorts {
    fn reassign<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let moved = sqlx::query("UPDATE owned_entities SET owner_id = $2 WHERE owner_id = $1")
                .bind(from)
                .bind(to)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(moved)
        })
    }

    fn archive<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let archived = sqlx::query(
                r#"
                UPDATE owned_entities
                SET owner_id = NULL, archived_at = COALESCE(archived_at, NOW())
                WHERE owner_id = $1
                "#,
            )
            .bind(owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(archived)
        })
    }
}

impl QuestionBank for PgPorts {
    fn save_generated<'a>(
        &'a self,
        exercise_id: &'a str,
        run_id: Uuid,
        questions: &'a [NewQuestion],
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM questions WHERE exercise_id = $1 AND source_run = $2")
                .bind(exercise_id)
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
            let offset: i32 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM questions WHERE exercise_id = $1",
            )
            .bind(exercise_id)
            .fetch_one(&mut *tx)
            .await?;

            let mut ids = Vec::with_capacity(questions.len());
            for (i, question) in questions.iter().enumerate() {
                let id = Uuid::new_v4().to_string();
                let body = serde_json::to_value(question.clone().into_question(id.clone()))?;
                sqlx::query(
                    r#"
                    INSERT INTO questions (id, exercise_id, position, body, source_run)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(&id)
                .bind(exercise_id)
                .bind(offset + i as i32)
                .bind(&body)
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
                ids.push(id);
            }
            tx.commit().await?;
            Ok(ids)
        })
    }

    fn list<'a>(&'a self, exercise_id: &'a str) -> BoxFuture<'a, Result<Vec<Question>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, body FROM questions WHERE exercise_id = $1 ORDER BY position",
            )
            .bind(exercise_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(question_from_row).collect()
        })
    }
}

impl SubmissionStore for PgPorts {
    fn load<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SubmissionBundle>>> {
        Box::pin(async move {
            let Some(row) = sqlx::query(
                "SELECT id, exercise_id, student_id, answers FROM submissions WHERE id = $1",
            )
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await?
            else {
                return Ok(None);
            };

            let submission = Submission {
                id: row.try_get("id")?,
                exercise_id: row.try_get("exercise_id")?,
                student_id: row.try_get("student_id")?,
                answers: serde_json::from_value(row.try_get("answers")?)?,
            };
            let questions = self.list(&submission.exercise_id).await?;
            Ok(Some(SubmissionBundle {
                submission,
                questions,
            }))
        })
    }

    fn save_grade<'a>(&'a self, grade: &'a Grade) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let details = serde_json::to_value(&grade.questions)?;
            sqlx::query(
                r#"
                INSERT INTO grades (submission_id, score, max_score, details, graded_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (submission_id) DO UPDATE SET
                    score = EXCLUDED.score,
                    max_score = EXCLUDED.max_score,
                    details = EXCLUDED.details,
                    graded_at = EXCLUDED.graded_at
                "#,
            )
            .bind(&grade.submission_id)
            .bind(grade.score)
            .bind(grade.max_score)
            .bind(&details)
            .bind(grade.graded_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }
}

impl DeliveryLog for PgPorts {
    fn record<'a>(&'a self, entries: &'a [DeliveryEntry]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            for entry in entries {
                sqlx::query(
                    r#"
                    INSERT INTO session_deliveries (session_id, kind, email, delivery_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (session_id, kind, email) DO NOTHING
                    "#,
                )
                .bind(&entry.session_id)
                .bind(&entry.kind)
                .bind(&entry.email)
                .bind(&entry.delivery_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}
