//! The platform jobs driven end to end through the engine, against
//! in-memory stores and capability mocks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::jobs::{self, JobServices};
use crate::ports::{
    Answer, MemoryPorts, Question, QuestionBank, QuestionKind, QuestionOption, ScoreMethod,
    Submission, UserRecord, UserRole,
};
use quill_core::run::RunStatus;
use quill_core::store::RunStore;
use quill_core::testing::{
    MockExtractor, MockGenerator, MockIdentity, MockMailer, MockObjectStore,
};
use quill_core::{assert_ok, Event, MemoryRunStore};
use quill_runtime::jobs::{AdvanceOutcome, Dispatcher, Executor, ExecutorConfig, FunctionRegistry};
use quill_runtime::LocalEventBus;

struct Harness {
    ports: MemoryPorts,
    mailer: MockMailer,
    generator: MockGenerator,
    storage: MockObjectStore,
    identity: MockIdentity,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
}

fn harness_with(generator: MockGenerator) -> Harness {
    let ports = MemoryPorts::new();
    let mailer = MockMailer::new();
    let storage = MockObjectStore::new();
    let identity = MockIdentity::new();

    let services = JobServices {
        users: Arc::new(ports.clone()),
        ownership: Arc::new(ports.clone()),
        questions: Arc::new(ports.clone()),
        submissions: Arc::new(ports.clone()),
        deliveries: Arc::new(ports.clone()),
        mailer: Arc::new(mailer.clone()),
        generator: Arc::new(generator.clone()),
        extractor: Arc::new(MockExtractor::new()),
        storage: Arc::new(storage.clone()),
        identity: Arc::new(identity.clone()),
    };
    let mut registry = FunctionRegistry::new();
    assert_ok!(jobs::register_all(&mut registry, &services));

    let registry = Arc::new(registry);
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), store.clone()));
    let config = ExecutorConfig {
        lease: Duration::from_secs(60),
        throttle_delay: Duration::from_millis(5),
    };
    let executor = Arc::new(
        Executor::new(registry, store, config)
            .with_bus(Arc::new(LocalEventBus::new(dispatcher.clone()))),
    );

    Harness {
        ports,
        mailer,
        generator,
        storage,
        identity,
        dispatcher,
        executor,
    }
}

fn harness() -> Harness {
    harness_with(MockGenerator::new())
}

impl Harness {
    async fn trigger(&self, name: &str, data: Value) -> uuid::Uuid {
        let report = self
            .dispatcher
            .dispatch(vec![Event::new(name, data).with_id(format!("{name}-1"))])
            .await
            .unwrap();
        assert_eq!(report.runs.len(), 1, "{name} should start exactly one run");
        report.runs[0].run_id
    }

    /// Advance until the run stops needing work.
    async fn drive(&self, run_id: uuid::Uuid) -> AdvanceOutcome {
        for _ in 0..100 {
            let outcome = self.executor.advance(run_id, None).await.unwrap();
            if !outcome.is_pending() {
                return outcome;
            }
        }
        panic!("run {run_id} did not settle");
    }

    async fn run(&self, name: &str, data: Value) -> (uuid::Uuid, AdvanceOutcome) {
        let run_id = self.trigger(name, data).await;
        (run_id, self.drive(run_id).await)
    }
}

fn output(outcome: AdvanceOutcome) -> Value {
    match outcome {
        AdvanceOutcome::Completed { output } => output,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn user(id: &str, org_id: &str, email: &str) -> UserRecord {
    UserRecord {
        id: id.into(),
        org_id: org_id.into(),
        email: email.into(),
        name: format!("User {id}"),
        role: UserRole::Teacher,
        locale: None,
    }
}

#[tokio::test]
async fn test_import_reports_every_row() {
    let h = harness();
    h.ports.add_user(user("u0", "org-1", "existing@example.com")).await;
    h.ports.reject_email("rejected@example.com").await;
    h.mailer.fail_next(1);

    let (_, outcome) = h
        .run(
            "users/import.requested",
            json!({
                "org_id": "org-1",
                "batch_size": 10,
                "rows": [
                    {"email": " Ana@Example.com ", "name": "Ana   Silva", "role": "teacher"},
                    {"email": "not-an-email", "name": "Nope"},
                    {"email": "ana@example.com", "name": "Ana again"},
                    {"email": "existing@example.com", "name": "Old Timer"},
                    {"email": "rejected@example.com", "name": "Rita"},
                    {"email": "bo@example.com", "name": "Bo"}
                ]
            }),
        )
        .await;
    let report = output(outcome);

    assert_eq!(report["total"], 6);
    assert_eq!(report["created"], 2);
    assert_eq!(report["existing"], 1);
    assert_eq!(report["invalid"], 2);
    assert_eq!(report["failed"], 1);

    let statuses: Vec<&str> = report["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec!["created", "invalid", "invalid", "existing", "failed", "created"]
    );
    assert_eq!(report["rows"][0]["welcome"], "sent");

    // The failed first send was retried; each address got one welcome.
    assert_eq!(h.mailer.sent().len(), 2);
    assert_eq!(h.mailer.sent_to("ana@example.com").len(), 1);

    let created = h.ports.users().await;
    let ana = created.iter().find(|u| u.email == "ana@example.com").unwrap();
    assert_eq!(ana.name, "Ana Silva");
    assert_eq!(ana.role, UserRole::Teacher);
}

#[tokio::test]
async fn test_import_without_welcome() {
    let h = harness();
    let (_, outcome) = h
        .run(
            "users/import.requested",
            json!({
                "org_id": "org-1",
                "send_welcome": false,
                "rows": [{"email": "a@example.com", "name": "A"}]
            }),
        )
        .await;
    let report = output(outcome);
    assert_eq!(report["rows"][0]["welcome"], "skipped");
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_deletion_of_missing_user_is_a_no_op() {
    let h = harness();
    let (_, outcome) = h
        .run("users/deletion.requested", json!({"user_id": "ghost"}))
        .await;
    let report = output(outcome);
    assert_eq!(report["deleted"], false);
    assert!(h.identity.revoked().is_empty());
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_deletion_with_padded_user_id_is_rejected() {
    let h = harness();
    let report = h
        .dispatcher
        .dispatch(vec![
            Event::new("users/deletion.requested", json!({"user_id": " u1"})).with_id("pad-1"),
        ])
        .await
        .unwrap();
    assert!(report.runs.is_empty());
    assert_eq!(report.rejected.len(), 1);
}

#[tokio::test]
async fn test_deletion_reassigns_to_successor() {
    let h = harness();
    h.ports.add_user(user("u1", "org-1", "leaver@example.com")).await;
    h.ports.add_user(user("u2", "org-1", "heir@example.com")).await;
    h.ports.add_owned("class-1", "class", "u1").await;
    h.ports.add_owned("ex-1", "exercise", "u1").await;
    h.ports.add_owned("ex-2", "exercise", "u2").await;
    h.identity.fail_next(1);

    let (_, outcome) = h
        .run(
            "users/deletion.requested",
            json!({"user_id": "u1", "successor_id": "u2"}),
        )
        .await;
    let report = output(outcome);

    assert_eq!(report["deleted"], true);
    assert_eq!(report["handover"]["mode"], "reassigned");
    assert_eq!(report["handover"]["count"], 2);
    assert_eq!(report["notified"], true);

    assert_eq!(h.identity.revoked(), vec!["u1".to_string()]);
    assert!(h.ports.owned().await.iter().all(|e| e.owner_id.as_deref() == Some("u2")));
    assert!(h.ports.users().await.iter().all(|u| u.id != "u1"));

    let farewell = h.mailer.sent_to("leaver@example.com");
    assert_eq!(farewell.len(), 1);
    assert_eq!(farewell[0].idempotency_key.as_deref(), Some("deletion:u1"));
}

#[tokio::test]
async fn test_deletion_archives_without_usable_successor() {
    let h = harness();
    h.ports.add_user(user("u1", "org-1", "leaver@example.com")).await;
    h.ports.add_user(user("x9", "org-2", "stranger@example.com")).await;
    h.ports.add_owned("class-1", "class", "u1").await;

    let (_, outcome) = h
        .run(
            "users/deletion.requested",
            json!({"user_id": "u1", "successor_id": "x9", "notify": false}),
        )
        .await;
    let report = output(outcome);

    assert_eq!(report["handover"]["mode"], "archived");
    assert_eq!(report["notified"], false);
    let owned = h.ports.owned().await;
    assert!(owned[0].archived);
    assert!(h.mailer.sent().is_empty());
}

fn session(recipients: Value) -> Value {
    json!({
        "session_id": "sess-7",
        "title": "Fractions workshop",
        "starts_at": "2025-03-03T13:30:00Z",
        "timezone": "Europe/Madrid",
        "locale": "es",
        "recipients": recipients,
    })
}

#[tokio::test]
async fn test_session_notification_sends_once_per_recipient() {
    let h = harness();
    h.mailer.fail_next(1);

    let (_, outcome) = h
        .run(
            "sessions/scheduled",
            session(json!([
                {"email": "ana@example.com", "name": "Ana"},
                {"email": "ANA@example.com"},
                {"email": "bo@example.com", "locale": "en-GB"}
            ])),
        )
        .await;
    let report = output(outcome);

    assert_eq!(report["kind"], "scheduled");
    assert_eq!(report["sent"], 2);

    let ana = h.mailer.sent_to("ana@example.com");
    assert_eq!(ana.len(), 1);
    assert_eq!(ana[0].subject, "Sesión programada: Fractions workshop");
    assert!(ana[0].html.contains("lunes, 3 de marzo de 2025, 14:30"));
    assert_eq!(
        ana[0].idempotency_key.as_deref(),
        Some("session:sess-7:scheduled:ana@example.com")
    );

    let bo = h.mailer.sent_to("bo@example.com");
    assert_eq!(bo[0].subject, "Session scheduled: Fractions workshop");

    let deliveries = h.ports.deliveries().await;
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.kind == "scheduled"));
}

#[tokio::test]
async fn test_session_cancellation_with_bad_timezone_fails() {
    let h = harness();
    let mut data = session(json!([{"email": "ana@example.com"}]));
    data["timezone"] = json!("Atlantis/Lost");

    let (run_id, outcome) = h.run("sessions/cancelled", data).await;
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
    let run = h.executor.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(h.mailer.sent().is_empty());
}

const GOOD_QUESTIONS: &str = r#"{"questions": [
    {"kind": "multiple_choice", "prompt": "Which is a mammal?", "options": ["Shark", "Whale"], "correct": "b"},
    {"kind": "short_answer", "prompt": "Largest ocean?", "correct": "Pacific", "points": 2}
]}"#;

#[tokio::test]
async fn test_question_generation_retries_malformed_output() {
    let generator = MockGenerator::new();
    generator.push_reply("Sorry, here are some ideas: none");
    generator.push_reply(GOOD_QUESTIONS);
    let h = harness_with(generator);
    h.storage
        .insert("uploads/ocean.pdf", "Oceans cover most of the planet.", Some("application/pdf"));

    let (run_id, outcome) = h
        .run(
            "exercises/questions.requested",
            json!({"exercise_id": "ex-1", "source_key": "uploads/ocean.pdf", "count": 3}),
        )
        .await;
    let report = output(outcome);

    assert_eq!(report["count"], 2);
    assert_eq!(h.generator.calls(), 2);
    assert!(h.generator.requests()[0].prompt.contains("Oceans cover most"));

    let stored = h.ports.list("ex-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].correct_options, vec!["b".to_string()]);
    assert_eq!(stored[1].max_points, 2.0);

    // Re-advancing a finished run stores nothing twice.
    h.executor.advance(run_id, None).await.unwrap();
    assert_eq!(h.ports.list("ex-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_question_generation_rejects_unsupported_files() {
    let h = harness();
    h.storage.insert("uploads/photo.png", vec![0x89, 0x50], None);

    let (_, outcome) = h
        .run(
            "exercises/questions.requested",
            json!({"exercise_id": "ex-1", "source_key": "uploads/photo.png"}),
        )
        .await;
    match outcome {
        AdvanceOutcome::Failed { error } => assert!(error.contains("application/octet-stream")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.generator.calls(), 0);
}

fn quiz() -> Vec<Question> {
    let base = Question {
        id: String::new(),
        kind: QuestionKind::ShortAnswer,
        prompt: String::new(),
        options: vec![],
        correct_answer: None,
        accepted_variants: vec![],
        correct_options: vec![],
        case_sensitive: false,
        max_points: 1.0,
        word_limit: None,
        rubric: None,
    };
    vec![
        Question {
            id: "q1".into(),
            prompt: "Capital of France?".into(),
            correct_answer: Some("Paris".into()),
            ..base.clone()
        },
        Question {
            id: "q2".into(),
            kind: QuestionKind::MultipleChoice,
            prompt: "Pick the primes".into(),
            options: vec![
                QuestionOption { id: "a".into(), text: "2".into() },
                QuestionOption { id: "b".into(), text: "4".into() },
                QuestionOption { id: "c".into(), text: "5".into() },
            ],
            correct_options: vec!["a".into(), "c".into()],
            max_points: 2.0,
            ..base.clone()
        },
        Question {
            id: "q3".into(),
            kind: QuestionKind::OpenEnded,
            prompt: "Why do leaves fall?".into(),
            max_points: 5.0,
            ..base.clone()
        },
        Question {
            id: "q4".into(),
            kind: QuestionKind::OpenEnded,
            prompt: "Describe photosynthesis".into(),
            max_points: 5.0,
            ..base
        },
    ]
}

#[tokio::test]
async fn test_grading_matches_before_asking_the_model() {
    let generator = MockGenerator::new().with_handler(|_| Ok(r#"{"score": 7, "feedback": "Thorough"}"#.into()));
    let h = harness_with(generator);
    for question in quiz() {
        h.ports.add_question("ex-1", question).await;
    }
    h.ports
        .add_submission(Submission {
            id: "sub-1".into(),
            exercise_id: "ex-1".into(),
            student_id: "s1".into(),
            answers: vec![
                Answer {
                    question_id: "q1".into(),
                    text: Some("  paris ".into()),
                    ..Default::default()
                },
                Answer {
                    question_id: "q2".into(),
                    selected: vec!["a".into()],
                    ..Default::default()
                },
                Answer {
                    question_id: "q3".into(),
                    text: Some("Less daylight stops chlorophyll production.".into()),
                    ..Default::default()
                },
            ],
        })
        .await;

    let (_, outcome) = h
        .run("submissions/submitted", json!({"submission_id": "sub-1"}))
        .await;
    let summary = output(outcome);

    // q1 right, q2 partially selected scores nothing, q3 clamped to 5, q4 unanswered.
    assert_eq!(summary["score"], 6.0);
    assert_eq!(summary["max_score"], 13.0);
    assert_eq!(summary["matched"], 2);
    assert_eq!(summary["assessed"], 1);
    assert_eq!(h.generator.calls(), 1);

    let grade = h.ports.grade("sub-1").await.unwrap();
    let ids: Vec<&str> = grade.questions.iter().map(|q| q.question_id.as_str()).collect();
    assert_eq!(ids, vec!["q1", "q2", "q3", "q4"]);
    assert_eq!(grade.questions[2].method, ScoreMethod::Model);
    assert_eq!(grade.questions[3].method, ScoreMethod::Unanswered);
}

#[tokio::test]
async fn test_grading_unknown_submission_fails() {
    let h = harness();
    let (_, outcome) = h
        .run("submissions/submitted", json!({"submission_id": "nope"}))
        .await;
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
}
