//! Turn loosely-shaped candidate JSON into fully populated records.
//!
//! Every rule here is total: a candidate either normalizes or is rejected for
//! lacking its required text field, nothing panics.

use crate::content::{
    ExpectedShape, GeneratedItem, GeneratedLesson, GeneratedQuestion, GeneratedUnit, QuestionOption,
    QuestionType,
};
use serde_json::Value;

const PLACEHOLDER_LETTERS: [&str; 4] = ["A", "B", "C", "D"];

/// Synthesized ids are `{prefix}_{stamp}_{path}`; one stamp per parse call
/// keeps them unique within that call.
#[derive(Debug, Clone, Copy)]
pub struct IdSeed {
    pub stamp: i64,
}

impl IdSeed {
    pub fn now() -> Self {
        IdSeed {
            stamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn make(&self, prefix: &str, path: &[usize]) -> String {
        let path: Vec<String> = path.iter().map(|i| i.to_string()).collect();
        format!("{}_{}_{}", prefix, self.stamp, path.join("_"))
    }
}

pub fn normalize_candidate(
    shape: ExpectedShape,
    value: &Value,
    seed: IdSeed,
    index: usize,
) -> Option<GeneratedItem> {
    match shape {
        ExpectedShape::Questions => {
            normalize_question(value, seed.make("q", &[index])).map(GeneratedItem::Question)
        }
        ExpectedShape::Units => normalize_unit(value, seed, index).map(GeneratedItem::Unit),
    }
}

/// Whether `value` carries the minimum a record of `shape` needs.
pub fn has_required_fields(shape: ExpectedShape, value: &Value) -> bool {
    match shape {
        ExpectedShape::Questions => question_text(value).is_some(),
        ExpectedShape::Units => non_empty_str(value, &["title"]).is_some(),
    }
}

pub fn normalize_question(value: &Value, fallback_id: String) -> Option<GeneratedQuestion> {
    let question_text = question_text(value)?;
    let id = id_of(value).unwrap_or(fallback_id);
    let raw_answer = value
        .get("correctAnswer")
        .or_else(|| value.get("correct_answer"))
        .or_else(|| value.get("answer"))
        .map(answer_text)
        .unwrap_or_default();

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(QuestionType::parse)
        .or_else(|| infer_choice_type(&raw_answer))
        .unwrap_or(QuestionType::SingleChoice);

    let mut options = value.get("options").and_then(coerce_options).unwrap_or_default();
    let mut correct_answer = raw_answer;

    match kind {
        QuestionType::TrueFalse => {
            if options.len() != 2 {
                options = true_false_options();
                correct_answer = true_false_answer(&correct_answer);
            }
        }
        QuestionType::SingleChoice | QuestionType::MultipleChoice => {
            if options.is_empty() {
                options = PLACEHOLDER_LETTERS
                    .iter()
                    .map(|l| QuestionOption::new(*l, format!("Option {}", l)))
                    .collect();
            }
            if kind == QuestionType::MultipleChoice {
                if let Some(letters) = answer_letters(&correct_answer) {
                    correct_answer = letters.join(",");
                }
            }
        }
        QuestionType::FillBlank => {}
    }

    Some(GeneratedQuestion {
        id,
        kind,
        question_text,
        options,
        correct_answer,
        explanation: non_empty_str(value, &["explanation"]),
        image_url: non_empty_str(value, &["imageUrl", "image_url"]),
    })
}

pub fn normalize_unit(value: &Value, seed: IdSeed, index: usize) -> Option<GeneratedUnit> {
    let title = non_empty_str(value, &["title"])?;
    let id = id_of(value).unwrap_or_else(|| seed.make("unit", &[index]));

    let lessons = value
        .get("lessons")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter(|l| l.is_object())
                .enumerate()
                .map(|(li, lesson)| normalize_lesson(lesson, seed, index, li))
                .collect()
        })
        .unwrap_or_default();

    Some(GeneratedUnit {
        id,
        title,
        description: non_empty_str(value, &["description"]),
        lessons,
    })
}

fn normalize_lesson(value: &Value, seed: IdSeed, unit: usize, index: usize) -> GeneratedLesson {
    let questions = value
        .get("questions")
        .or_else(|| value.get("items"))
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .enumerate()
                .filter_map(|(qi, q)| normalize_question(q, seed.make("q", &[unit, index, qi])))
                .collect()
        })
        .unwrap_or_default();

    GeneratedLesson {
        id: id_of(value).unwrap_or_else(|| seed.make("lesson", &[unit, index])),
        title: non_empty_str(value, &["title"]).unwrap_or_else(|| format!("Lesson {}", index + 1)),
        description: non_empty_str(value, &["description"]),
        questions,
        completed: false,
        starred: false,
        locked: index != 0,
    }
}

/// Guess single vs multiple choice from the shape of an answer string. Only
/// consulted when the provider gave no recognizable `type`.
///
/// Rules, in order (input is trimmed and upper-cased first):
/// 1. Letters split by `,` `，` `、` `;` or whitespace: multiple choice when two or
///    more distinct letters, otherwise single choice.
/// 2. Two or more distinct letters from `A`..=`H` run together (`"AC"`, `"BD"`):
///    multiple choice. `"AB"` is read as two options, never as one code.
/// 3. One letter: single choice.
/// 4. Anything else (repeated letters like `"AA"`, words, numbers): no opinion.
pub fn infer_choice_type(answer: &str) -> Option<QuestionType> {
    let letters = answer_letters(answer)?;
    if letters.len() >= 2 {
        Some(QuestionType::MultipleChoice)
    } else {
        Some(QuestionType::SingleChoice)
    }
}

/// Distinct option letters named by an answer, in the order given.
fn answer_letters(answer: &str) -> Option<Vec<String>> {
    let upper = answer.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    let is_sep = |c: char| matches!(c, ',' | '，' | '、' | ';') || c.is_whitespace();
    if upper.chars().any(is_sep) {
        let tokens: Vec<&str> = upper.split(is_sep).filter(|t| !t.is_empty()).collect();
        let all_letters = !tokens.is_empty()
            && tokens
                .iter()
                .all(|t| t.len() == 1 && t.chars().all(|c| c.is_ascii_uppercase()));
        if !all_letters {
            return None;
        }
        let mut out: Vec<String> = Vec::new();
        for t in tokens {
            if !out.iter().any(|o| o == t) {
                out.push(t.to_string());
            }
        }
        return Some(out);
    }

    let chars: Vec<char> = upper.chars().collect();
    if chars.len() == 1 {
        return chars[0]
            .is_ascii_uppercase()
            .then(|| vec![chars[0].to_string()]);
    }

    let in_range = chars.iter().all(|c| ('A'..='H').contains(c));
    let mut seen = chars.clone();
    seen.sort_unstable();
    seen.dedup();
    if in_range && seen.len() == chars.len() {
        Some(chars.iter().map(|c| c.to_string()).collect())
    } else {
        None
    }
}

fn true_false_options() -> Vec<QuestionOption> {
    vec![
        QuestionOption::new("A", "Correct"),
        QuestionOption::new("B", "Incorrect"),
    ]
}

fn true_false_answer(answer: &str) -> String {
    match answer.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "correct" | "正確" | "正确" | "對" | "对" => "A".to_string(),
        "false" | "f" | "no" | "incorrect" | "錯誤" | "错误" | "錯" | "错" => "B".to_string(),
        _ => answer.to_string(),
    }
}

pub fn option_letter(index: usize) -> String {
    if index < 26 {
        ((b'A' + index as u8) as char).to_string()
    } else {
        format!("O{}", index + 1)
    }
}

/// Accepts a list of strings, a list of `{id, text}` objects (ids filled in
/// when missing), or an object keyed by letter.
fn coerce_options(value: &Value) -> Option<Vec<QuestionOption>> {
    let options: Vec<QuestionOption> = match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(_) => QuestionOption {
                    id: id_of(item).unwrap_or_else(|| option_letter(i)),
                    text: non_empty_str(item, &["text", "content", "label", "value"])
                        .unwrap_or_else(|| scalar_text(item)),
                },
                other => QuestionOption::new(option_letter(i), scalar_text(other)),
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| QuestionOption::new(k.clone(), scalar_text(v)))
            .collect(),
        _ => return None,
    };
    Some(options)
}

fn question_text(value: &Value) -> Option<String> {
    if !value.is_object() {
        return None;
    }
    non_empty_str(value, &["question", "questionText"])
}

fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Bool(true) => "A".to_string(),
        Value::Bool(false) => "B".to_string(),
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(","),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
