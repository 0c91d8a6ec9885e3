//! Deterministic answer matching for objective questions.

use std::collections::BTreeSet;

use crate::ports::{Answer, Question, QuestionKind, QuestionScore, ScoreMethod};

/// Trim, collapse whitespace runs to one space and, unless
/// `case_sensitive`, lower-case.
pub fn normalize(s: &str, case_sensitive: bool) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_sensitive {
        collapsed
    } else {
        collapsed.to_lowercase()
    }
}

/// Whether `student` equals `correct` or one of `variants` after
/// normalization.
pub fn matches_answer(student: &str, correct: &str, variants: &[String], case_sensitive: bool) -> bool {
    let student = normalize(student, case_sensitive);
    std::iter::once(correct)
        .chain(variants.iter().map(String::as_str))
        .any(|accepted| normalize(accepted, case_sensitive) == student)
}

/// Whether `text` stays within `limit` whitespace-separated words.
///
/// Blank text always passes.
pub fn check_word_limit(text: &str, limit: usize) -> bool {
    text.split_whitespace().count() <= limit
}

fn parse_bool(s: &str) -> Option<bool> {
    match normalize(s, false).as_str() {
        "true" | "t" | "yes" => Some(true),
        "false" | "f" | "no" => Some(false),
        _ => None,
    }
}

fn is_correct(question: &Question, answer: &Answer) -> bool {
    match question.kind {
        QuestionKind::ShortAnswer | QuestionKind::FillBlank => {
            match (&answer.text, &question.correct_answer) {
                (Some(text), Some(correct)) => matches_answer(
                    text,
                    correct,
                    &question.accepted_variants,
                    question.case_sensitive,
                ),
                _ => false,
            }
        }
        QuestionKind::MultipleChoice => {
            let selected: BTreeSet<&str> = answer.selected.iter().map(String::as_str).collect();
            let correct: BTreeSet<&str> =
                question.correct_options.iter().map(String::as_str).collect();
            !correct.is_empty() && selected == correct
        }
        QuestionKind::TrueFalse => {
            let given = answer.text.as_deref().and_then(parse_bool);
            let expected = question.correct_answer.as_deref().and_then(parse_bool);
            given.is_some() && given == expected
        }
        QuestionKind::OpenEnded => false,
    }
}

/// Whether the student gave any answer at all.
pub fn is_answered(answer: Option<&Answer>) -> bool {
    answer.is_some_and(|a| {
        a.text.as_deref().is_some_and(|t| !t.trim().is_empty()) || !a.selected.is_empty()
    })
}

/// Score an objective question: all or nothing. `None` for open-ended ones.
pub fn score_objective(question: &Question, answer: Option<&Answer>) -> Option<QuestionScore> {
    if !question.kind.is_objective() {
        return None;
    }
    let (correct, method) = match answer {
        Some(answer) if is_answered(Some(answer)) => {
            (is_correct(question, answer), ScoreMethod::Matching)
        }
        _ => (false, ScoreMethod::Unanswered),
    };
    Some(QuestionScore {
        question_id: question.id.clone(),
        points: if correct { question.max_points } else { 0.0 },
        max_points: question.max_points,
        method,
        correct: Some(correct),
        feedback: None,
    })
}
