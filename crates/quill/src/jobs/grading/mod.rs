//! Submission grading: deterministic matching first, then the model for
//! open-ended answers.

pub mod matching;

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use quill_core::capability::{GenerationRequest, Generator};
use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::step::StepContext;

use self::matching::{check_word_limit, is_answered, score_objective};
use super::extract_json;
use crate::ports::{
    Answer, Grade, Question, QuestionScore, ScoreMethod, SubmissionBundle, SubmissionStore,
};

const ASSESS_SYSTEM: &str = "You are a fair, concise teacher grading a student's answer. \
Reply with a JSON object {\"score\": number, \"feedback\": string}.";

#[derive(Debug, Clone, Deserialize)]
pub struct GradingInput {
    pub submission_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSummary {
    pub submission_id: String,
    pub score: f64,
    pub max_score: f64,
    pub matched: usize,
    pub assessed: usize,
}

#[derive(Deserialize)]
struct Assessment {
    score: f64,
    #[serde(default)]
    feedback: String,
}

/// Grades a submitted exercise.
pub struct SubmissionGrading {
    submissions: Arc<dyn SubmissionStore>,
    generator: Arc<dyn Generator>,
}

impl SubmissionGrading {
    pub fn new(submissions: Arc<dyn SubmissionStore>, generator: Arc<dyn Generator>) -> Self {
        Self {
            submissions,
            generator,
        }
    }

    async fn assess(&self, question: &Question, text: &str) -> Result<QuestionScore> {
        let over_limit = question
            .word_limit
            .filter(|&limit| !check_word_limit(text, limit));

        let mut prompt = format!(
            "Question: {}\nMaximum points: {}\n",
            question.prompt, question.max_points
        );
        if let Some(rubric) = &question.rubric {
            prompt.push_str(&format!("Rubric: {rubric}\n"));
        }
        if let Some(limit) = over_limit {
            prompt.push_str(&format!(
                "The answer exceeds the {limit}-word limit; take that into account.\n"
            ));
        }
        prompt.push_str(&format!("Student answer:\n{text}\n"));

        let reply = self
            .generator
            .generate(
                GenerationRequest::new(prompt)
                    .with_system(ASSESS_SYSTEM)
                    .json(),
            )
            .await?;
        parse_assessment(&reply, question, over_limit)
    }
}

/// Parse and clamp a model assessment. Malformed replies are retryable.
fn parse_assessment(
    reply: &str,
    question: &Question,
    over_limit: Option<usize>,
) -> Result<QuestionScore> {
    let malformed = |why: String| QuillError::retryable("assess-open", format!("malformed assessment: {why}"));

    let assessment: Assessment = serde_json::from_str(extract_json(reply))
        .map_err(|e| malformed(e.to_string()))?;
    if !assessment.score.is_finite() {
        return Err(malformed(format!("score {}", assessment.score)));
    }

    let mut feedback = assessment.feedback.trim().to_string();
    if let Some(limit) = over_limit {
        if !feedback.is_empty() {
            feedback.push(' ');
        }
        feedback.push_str(&format!("(Answer exceeds the {limit}-word limit.)"));
    }

    Ok(QuestionScore {
        question_id: question.id.clone(),
        points: assessment.score.clamp(0.0, point_ceiling(question)),
        max_points: question.max_points,
        method: ScoreMethod::Model,
        correct: None,
        feedback: (!feedback.is_empty()).then_some(feedback),
    })
}

/// Upper bound for awarded points; zero when the stored maximum is unusable.
fn point_ceiling(question: &Question) -> f64 {
    if question.max_points.is_finite() {
        question.max_points.max(0.0)
    } else {
        0.0
    }
}

/// Reject questions whose maximum can't be scored against.
fn check_points(questions: &[Question]) -> Result<()> {
    match questions
        .iter()
        .find(|q| !q.max_points.is_finite() || q.max_points < 0.0)
    {
        Some(q) => Err(QuillError::permanent(
            "load-submission",
            format!("question '{}' has invalid max_points {}", q.id, q.max_points),
        )),
        None => Ok(()),
    }
}

fn answer_for<'a>(bundle: &'a SubmissionBundle, question: &Question) -> Option<&'a Answer> {
    bundle
        .submission
        .answers
        .iter()
        .find(|a| a.question_id == question.id)
}

impl QuillFunction for SubmissionGrading {
    type Input = GradingInput;
    type Output = GradeSummary;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("submission-grading", "submissions/submitted")
            .named("Grade submission")
            .retry(RetryConfig::attempts(4))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: GradingInput,
    ) -> BoxFuture<'a, Result<GradeSummary>> {
        Box::pin(async move {
            let id = input.submission_id;
            let bundle: SubmissionBundle = ctx
                .step("load-submission", || async {
                    let bundle = self
                        .submissions
                        .load(&id)
                        .await?
                        .ok_or_else(|| QuillError::NotFound(format!("submission '{id}'")))?;
                    check_points(&bundle.questions)?;
                    Ok(bundle)
                })
                .run()
                .await?;

            let objective: Vec<QuestionScore> = ctx
                .step("score-objective", || async {
                    Ok(bundle
                        .questions
                        .iter()
                        .filter_map(|q| score_objective(q, answer_for(&bundle, q)))
                        .collect())
                })
                .run()
                .await?;

            let mut open = Vec::new();
            for question in bundle.questions.iter().filter(|q| !q.kind.is_objective()) {
                let answer = answer_for(&bundle, question);
                let text = match answer.and_then(|a| a.text.as_deref()) {
                    Some(text) if is_answered(answer) => text,
                    _ => {
                        open.push(QuestionScore {
                            question_id: question.id.clone(),
                            points: 0.0,
                            max_points: question.max_points,
                            method: ScoreMethod::Unanswered,
                            correct: None,
                            feedback: None,
                        });
                        continue;
                    }
                };
                let score: QuestionScore = ctx
                    .step("assess-open", || self.assess(question, text))
                    .run()
                    .await?;
                open.push(score);
            }

            let matched = objective
                .iter()
                .filter(|s| s.method == ScoreMethod::Matching)
                .count();
            let assessed = open
                .iter()
                .filter(|s| s.method == ScoreMethod::Model)
                .count();

            // Keep the questions' order in the stored grade.
            let mut scores: Vec<QuestionScore> = Vec::with_capacity(bundle.questions.len());
            for question in &bundle.questions {
                if let Some(score) = objective
                    .iter()
                    .chain(open.iter())
                    .find(|s| s.question_id == question.id)
                {
                    scores.push(score.clone());
                }
            }

            let grade: Grade = ctx
                .step("persist-grade", || async {
                    let grade = Grade {
                        submission_id: id.clone(),
                        score: scores.iter().map(|s| s.points).sum(),
                        max_score: scores.iter().map(|s| s.max_points).sum(),
                        questions: scores,
                        graded_at: Utc::now(),
                    };
                    self.submissions.save_grade(&grade).await?;
                    Ok(grade)
                })
                .run()
                .await?;

            tracing::info!(
                submission_id = %grade.submission_id,
                score = grade.score,
                max_score = grade.max_score,
                "Submission graded"
            );

            Ok(GradeSummary {
                submission_id: grade.submission_id,
                score: grade.score,
                max_score: grade.max_score,
                matched,
                assessed,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::QuestionKind;

    fn essay(limit: Option<usize>) -> Question {
        Question {
            id: "q9".into(),
            kind: QuestionKind::OpenEnded,
            prompt: "Explain erosion".into(),
            options: vec![],
            correct_answer: None,
            accepted_variants: vec![],
            correct_options: vec![],
            case_sensitive: false,
            max_points: 5.0,
            word_limit: limit,
            rubric: None,
        }
    }

    #[test]
    fn test_assessment_is_clamped() {
        let high = parse_assessment(r#"{"score": 9, "feedback": "Great"}"#, &essay(None), None).unwrap();
        assert_eq!(high.points, 5.0);
        let low = parse_assessment(r#"{"score": -2}"#, &essay(None), None).unwrap();
        assert_eq!(low.points, 0.0);
        assert!(low.feedback.is_none());
    }

    #[test]
    fn test_assessment_inside_code_fence() {
        let reply = "```json\n{\"score\": 3.5, \"feedback\": \"Solid\"}\n```";
        let score = parse_assessment(reply, &essay(Some(10)), Some(10)).unwrap();
        assert_eq!(score.points, 3.5);
        assert_eq!(
            score.feedback.as_deref(),
            Some("Solid (Answer exceeds the 10-word limit.)")
        );
    }

    #[test]
    fn test_unusable_max_points_never_panics() {
        let mut negative = essay(None);
        negative.max_points = -1.0;
        let score = parse_assessment(r#"{"score": 1}"#, &negative, None).unwrap();
        assert_eq!(score.points, 0.0);

        let mut nan = essay(None);
        nan.max_points = f64::NAN;
        let score = parse_assessment(r#"{"score": 1}"#, &nan, None).unwrap();
        assert_eq!(score.points, 0.0);
    }

    #[test]
    fn test_invalid_max_points_is_permanent() {
        let mut bad = essay(None);
        bad.max_points = -1.0;
        let err = check_points(&[essay(None), bad]).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("q9"));
        assert!(check_points(&[essay(None)]).is_ok());
    }

    #[test]
    fn test_malformed_assessment_is_retryable() {
        let err = parse_assessment("I think 4/5", &essay(None), None).unwrap_err();
        assert!(err.is_retryable());
    }
}
