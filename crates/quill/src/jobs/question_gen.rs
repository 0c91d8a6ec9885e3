//! Exercise question generation from an uploaded document.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_core::capability::{
    mime_from_name, GenerationRequest, Generator, ObjectStore, TextExtractor,
};
use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::step::StepContext;

use super::extract_json;
use crate::ports::{NewQuestion, QuestionBank, QuestionKind, QuestionOption};

/// Source text sent to the model is cut to this many characters.
pub const MAX_SOURCE_CHARS: usize = 24_000;
pub const DEFAULT_QUESTION_COUNT: usize = 5;
pub const MAX_QUESTION_COUNT: usize = 20;

const GENERATE_SYSTEM: &str = "You write exercise questions for teachers. \
Reply only with JSON of the form {\"questions\": [{\"kind\": \"short_answer\" | \"fill_blank\" | \
\"multiple_choice\" | \"true_false\" | \"open_ended\", \"prompt\": string, \"options\": [string], \
\"correct\": string | [string] | boolean, \"variants\": [string], \"points\": number, \
\"rubric\": string}]}. For multiple_choice, \"correct\" holds option letters (a, b, ...).";

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionGenInput {
    pub exercise_id: String,
    /// Object storage key of the uploaded document.
    pub source_key: String,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Overrides the type reported by storage.
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default = "default_count")]
    pub count: usize,
    /// Restrict generated questions to these kinds.
    #[serde(default)]
    pub kinds: Vec<QuestionKind>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_count() -> usize {
    DEFAULT_QUESTION_COUNT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionGenReport {
    pub exercise_id: String,
    pub question_ids: Vec<String>,
    pub count: usize,
}

#[derive(Deserialize)]
struct GeneratedSet {
    questions: Vec<GeneratedQuestion>,
}

#[derive(Deserialize)]
struct GeneratedQuestion {
    kind: QuestionKind,
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    correct: Option<Value>,
    #[serde(default)]
    variants: Vec<String>,
    #[serde(default)]
    points: Option<f64>,
    #[serde(default)]
    rubric: Option<String>,
}

fn malformed(why: impl std::fmt::Display) -> QuillError {
    QuillError::retryable("generate-questions", format!("malformed questions: {why}"))
}

fn option_id(index: usize) -> String {
    // More than 26 options never validate, see `validate_question`.
    char::from(b'a' + index as u8).to_string()
}

fn strings_of(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .collect(),
        _ => Vec::new(),
    }
}

fn validate_question(index: usize, raw: GeneratedQuestion) -> Result<NewQuestion> {
    let at = |why: &str| malformed(format!("question {index}: {why}"));

    let prompt = raw.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(at("empty prompt"));
    }
    let max_points = raw.points.unwrap_or(1.0);
    if !max_points.is_finite() || max_points <= 0.0 {
        return Err(at("points must be positive"));
    }

    let mut question = NewQuestion {
        kind: raw.kind,
        prompt,
        options: Vec::new(),
        correct_answer: None,
        accepted_variants: Vec::new(),
        correct_options: Vec::new(),
        max_points,
        rubric: raw.rubric.filter(|r| !r.trim().is_empty()),
    };

    match raw.kind {
        QuestionKind::MultipleChoice => {
            if raw.options.len() < 2 || raw.options.len() > 26 {
                return Err(at("multiple choice needs 2 to 26 options"));
            }
            question.options = raw
                .options
                .iter()
                .enumerate()
                .map(|(i, text)| QuestionOption {
                    id: option_id(i),
                    text: text.trim().to_string(),
                })
                .collect();

            let wanted = raw.correct.as_ref().map(strings_of).unwrap_or_default();
            for answer in wanted {
                let found = question.options.iter().find(|o| {
                    o.id.eq_ignore_ascii_case(&answer) || o.text == answer
                });
                match found {
                    Some(option) if !question.correct_options.contains(&option.id) => {
                        question.correct_options.push(option.id.clone())
                    }
                    Some(_) => {}
                    None => return Err(at(&format!("unknown option '{answer}'"))),
                }
            }
            if question.correct_options.is_empty() {
                return Err(at("no correct option"));
            }
        }
        QuestionKind::TrueFalse => {
            let answer = match &raw.correct {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return Err(at("true/false answer must be a boolean")),
                },
                _ => return Err(at("true/false answer must be a boolean")),
            };
            question.correct_answer = Some(answer.to_string());
        }
        QuestionKind::ShortAnswer | QuestionKind::FillBlank => {
            let answer = raw
                .correct
                .as_ref()
                .map(strings_of)
                .and_then(|s| s.into_iter().find(|a| !a.is_empty()))
                .ok_or_else(|| at("missing answer"))?;
            question.correct_answer = Some(answer);
            question.accepted_variants = raw
                .variants
                .into_iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
        }
        QuestionKind::OpenEnded => {}
    }
    Ok(question)
}

/// Parse a model reply into at most `count` questions. Any malformed
/// question rejects the whole reply so the step is retried.
pub fn parse_questions(
    reply: &str,
    count: usize,
    kinds: &[QuestionKind],
) -> Result<Vec<NewQuestion>> {
    let set: GeneratedSet = serde_json::from_str(extract_json(reply)).map_err(malformed)?;
    if set.questions.is_empty() {
        return Err(malformed("no questions"));
    }

    let mut out = Vec::with_capacity(count.min(set.questions.len()));
    for (i, raw) in set.questions.into_iter().take(count).enumerate() {
        if !kinds.is_empty() && !kinds.contains(&raw.kind) {
            return Err(malformed(format!("question {i}: kind not requested")));
        }
        out.push(validate_question(i, raw)?);
    }
    Ok(out)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn kind_name(kind: QuestionKind) -> &'static str {
    match kind {
        QuestionKind::ShortAnswer => "short_answer",
        QuestionKind::FillBlank => "fill_blank",
        QuestionKind::MultipleChoice => "multiple_choice",
        QuestionKind::TrueFalse => "true_false",
        QuestionKind::OpenEnded => "open_ended",
    }
}

fn build_prompt(input: &QuestionGenInput, count: usize, text: &str) -> String {
    let mut prompt = format!("Write {count} questions based on the document below.\n");
    if let Some(topic) = &input.topic {
        prompt.push_str(&format!("Focus on: {topic}\n"));
    }
    if !input.kinds.is_empty() {
        let kinds: Vec<&str> = input.kinds.iter().map(|k| kind_name(*k)).collect();
        prompt.push_str(&format!("Allowed kinds: {}\n", kinds.join(", ")));
    }
    if let Some(language) = &input.language {
        prompt.push_str(&format!("Write the questions in {language}.\n"));
    }
    prompt.push_str("Document:\n");
    prompt.push_str(text);
    prompt
}

/// Generates exercise questions from an uploaded document.
pub struct QuestionGeneration {
    storage: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    generator: Arc<dyn Generator>,
    questions: Arc<dyn QuestionBank>,
}

impl QuestionGeneration {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        generator: Arc<dyn Generator>,
        questions: Arc<dyn QuestionBank>,
    ) -> Self {
        Self {
            storage,
            extractor,
            generator,
            questions,
        }
    }

    async fn extract_text(&self, input: &QuestionGenInput) -> Result<String> {
        let object = self.storage.fetch(&input.source_key).await?;

        let mime = input
            .mime_type
            .clone()
            .or(object
                .content_type
                .clone()
                .filter(|t| t != "application/octet-stream"))
            .unwrap_or_else(|| {
                mime_from_name(input.file_name.as_deref().unwrap_or(&input.source_key))
                    .to_string()
            });

        let text = self
            .extractor
            .extract(&object.bytes, &mime)
            .await
            .map_err(|e| e.into_step("extract-text"))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(QuillError::permanent(
                "extract-text",
                format!("no text in '{}'", input.source_key),
            ));
        }
        Ok(truncate_chars(text, MAX_SOURCE_CHARS).to_string())
    }

    async fn generate(
        &self,
        input: &QuestionGenInput,
        count: usize,
        text: &str,
    ) -> Result<Vec<NewQuestion>> {
        let request = GenerationRequest::new(build_prompt(input, count, text))
            .with_system(GENERATE_SYSTEM)
            .json();
        let reply = self.generator.generate(request).await?;
        parse_questions(&reply, count, &input.kinds)
    }
}

impl QuillFunction for QuestionGeneration {
    type Input = QuestionGenInput;
    type Output = QuestionGenReport;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("question-generation", "exercises/questions.requested")
            .named("Generate exercise questions")
            .concurrency(2, Some("/exercise_id"))
            .retry(RetryConfig::attempts(4))
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: QuestionGenInput,
    ) -> BoxFuture<'a, Result<QuestionGenReport>> {
        Box::pin(async move {
            let count = input.count.clamp(1, MAX_QUESTION_COUNT);

            let text: String = ctx
                .step("extract-text", || self.extract_text(&input))
                .run()
                .await?;

            let generated: Vec<NewQuestion> = ctx
                .step("generate-questions", || self.generate(&input, count, &text))
                .run()
                .await?;

            let run_id = ctx.run_id();
            let question_ids: Vec<String> = ctx
                .step("persist-questions", || {
                    self.questions
                        .save_generated(&input.exercise_id, run_id, &generated)
                })
                .run()
                .await?;

            tracing::info!(
                exercise_id = %input.exercise_id,
                count = question_ids.len(),
                "Questions generated"
            );

            Ok(QuestionGenReport {
                exercise_id: input.exercise_id,
                count: question_ids.len(),
                question_ids,
            })
        })
    }
}
