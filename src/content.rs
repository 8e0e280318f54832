//! Generated learning records. They only live inside a task's result; persisting
//! them into the course catalog is up to the caller.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
    FillBlank,
}

impl QuestionType {
    /// Lenient parse of a provider-supplied type label.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match key.as_str() {
            "SINGLE_CHOICE" | "SINGLE" | "SINGLECHOICE" => Some(QuestionType::SingleChoice),
            "MULTIPLE_CHOICE" | "MULTIPLE" | "MULTI_CHOICE" | "MULTIPLECHOICE" => {
                Some(QuestionType::MultipleChoice)
            }
            "TRUE_FALSE" | "TRUEFALSE" | "TRUE_OR_FALSE" | "BOOLEAN" => Some(QuestionType::TrueFalse),
            "FILL_BLANK" | "FILL_IN_THE_BLANK" | "FILL_IN_BLANK" | "FILLBLANK" => {
                Some(QuestionType::FillBlank)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

impl QuestionOption {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        QuestionOption {
            id: id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
    /// Option id, comma-joined option ids, or free text.
    pub correct_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedLesson {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub questions: Vec<GeneratedQuestion>,
    pub completed: bool,
    pub starred: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedUnit {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub lessons: Vec<GeneratedLesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeneratedItem {
    Question(GeneratedQuestion),
    Unit(GeneratedUnit),
}

impl GeneratedItem {
    pub fn id(&self) -> &str {
        match self {
            GeneratedItem::Question(q) => &q.id,
            GeneratedItem::Unit(u) => &u.id,
        }
    }

    pub fn as_question(&self) -> Option<&GeneratedQuestion> {
        match self {
            GeneratedItem::Question(q) => Some(q),
            GeneratedItem::Unit(_) => None,
        }
    }

    pub fn as_unit(&self) -> Option<&GeneratedUnit> {
        match self {
            GeneratedItem::Unit(u) => Some(u),
            GeneratedItem::Question(_) => None,
        }
    }
}

/// A record the parser recognized but could not validate. Diagnostic only;
/// never treated as content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescueFragment {
    /// The `question` / `title` text that could still be read.
    pub partial_text: String,
    pub reason: String,
    /// Bounded preview of the raw span.
    pub raw_preview: String,
}

/// Record shape the parser looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedShape {
    Questions,
    Units,
}

impl ExpectedShape {
    /// Keys whose presence marks an object as a plausible record.
    pub fn anchor_keys(&self) -> &'static [&'static str] {
        match self {
            ExpectedShape::Questions => &["question", "questionText"],
            ExpectedShape::Units => &["title"],
        }
    }
}
