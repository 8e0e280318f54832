//! Resilient parsing of provider output.
//!
//! [`parse`] first tries the payload as one JSON document: an array, an object
//! under a known wrapper key, or a single record. When that fails (typically
//! because the model ran out of output tokens mid-array, or wrapped the records
//! under a key we do not know) it scans the raw text for objects that look like
//! one record each, parses those one by one, and keeps whatever survives. Objects that are too broken to parse but still
//! expose their `question`/`title` text become [`RescueFragment`]s.
//!
//! Nothing in here returns an error or panics on any input.

use crate::content::{ExpectedShape, GeneratedItem, RescueFragment};
use crate::normalize::{has_required_fields, normalize_candidate, IdSeed};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;

/// Upper bound on the raw text kept per fragment.
pub const FRAGMENT_PREVIEW_CHARS: usize = 240;

/// Keys under which a provider sometimes wraps the record array.
const WRAPPER_KEYS: [&str; 5] = ["questions", "units", "items", "data", "results"];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseOutcome {
    pub items: Vec<GeneratedItem>,
    pub fragments: Vec<RescueFragment>,
    /// True when the whole-document parse failed and span recovery ran.
    pub recovered: bool,
    /// Structurally plausible record spans considered during recovery.
    pub spans_found: usize,
}

impl ParseOutcome {
    /// Valid items salvaged by span recovery (zero when the document parsed whole).
    pub fn rescued_count(&self) -> usize {
        if self.recovered {
            self.items.len()
        } else {
            0
        }
    }

    /// Records recognized but not recoverable.
    pub fn invalid_count(&self) -> usize {
        self.fragments.len()
    }
}

pub fn parse(payload: &str, shape: ExpectedShape) -> ParseOutcome {
    let seed = IdSeed::now();
    match whole_document_candidates(payload, shape) {
        Some(candidates) => ParseOutcome {
            items: candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| has_required_fields(shape, c))
                .filter_map(|(i, c)| normalize_candidate(shape, c, seed, i))
                .collect(),
            fragments: Vec::new(),
            recovered: false,
            spans_found: 0,
        },
        None => recover_spans(payload, shape, seed),
    }
}

fn whole_document_candidates(payload: &str, shape: ExpectedShape) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(payload.trim()).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(items)) = map.get(key) {
                    return Some(items.clone());
                }
            }
            let single = Value::Object(map);
            // unknown or nested wrappers: let the span scan find the records
            has_required_fields(shape, &single).then(|| vec![single])
        }
        _ => None,
    }
}

fn recover_spans(payload: &str, shape: ExpectedShape, seed: IdSeed) -> ParseOutcome {
    let spans = select_spans(scan_objects(payload), shape);
    let mut outcome = ParseOutcome {
        recovered: true,
        spans_found: spans.len(),
        ..Default::default()
    };

    for (i, span) in spans.iter().enumerate() {
        let text = &payload[span.start..span.end];
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                if !has_required_fields(shape, &value) {
                    continue;
                }
                if let Some(item) = normalize_candidate(shape, &value, seed, i) {
                    outcome.items.push(item);
                }
            }
            Err(err) => {
                if let Some(partial_text) = anchor_text(text, shape) {
                    outcome.fragments.push(RescueFragment {
                        partial_text,
                        reason: format!("unparseable record: {}", err),
                        raw_preview: preview(text, FRAGMENT_PREVIEW_CHARS),
                    });
                }
            }
        }
    }

    outcome
}

/// An object literal found in the raw text, possibly cut off at the end.
#[derive(Debug, Clone, PartialEq)]
struct ObjectSpan {
    start: usize,
    end: usize,
    closed: bool,
    /// Keys that belong to this object directly, not to nested ones.
    keys: Vec<String>,
}

impl ObjectSpan {
    fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    fn has_any_key(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.has_key(k))
    }

    fn contains(&self, other: &ObjectSpan) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

struct Frame {
    start: usize,
    is_object: bool,
    keys: Vec<String>,
}

/// Walk the text once, string-aware, and report every object literal together
/// with its direct keys. Objects still open at the end of input are reported
/// as unclosed spans running to the end.
fn scan_objects(text: &str) -> Vec<ObjectSpan> {
    let bytes = text.as_bytes();
    let mut stack: Vec<Frame> = Vec::new();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' if !stack.is_empty() => {
                let start = i + 1;
                let mut j = start;
                let mut escaped = false;
                while j < bytes.len() {
                    match bytes[j] {
                        _ if escaped => escaped = false,
                        b'\\' => escaped = true,
                        b'"' => break,
                        _ => {}
                    }
                    j += 1;
                }
                if j >= bytes.len() {
                    break;
                }
                let mut k = j + 1;
                while k < bytes.len() && bytes[k].is_ascii_whitespace() {
                    k += 1;
                }
                if k < bytes.len() && bytes[k] == b':' {
                    if let Some(frame) = stack.last_mut().filter(|f| f.is_object) {
                        frame.keys.push(text[start..j].to_string());
                    }
                }
                i = j + 1;
                continue;
            }
            b'{' | b'[' => stack.push(Frame {
                start: i,
                is_object: bytes[i] == b'{',
                keys: Vec::new(),
            }),
            b'}' | b']' => {
                if let Some(frame) = stack.pop() {
                    if frame.is_object {
                        spans.push(ObjectSpan {
                            start: frame.start,
                            end: i + 1,
                            closed: true,
                            keys: frame.keys,
                        });
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    for frame in stack.into_iter().filter(|f| f.is_object) {
        spans.push(ObjectSpan {
            start: frame.start,
            end: bytes.len(),
            closed: false,
            keys: frame.keys,
        });
    }

    spans.sort_by_key(|s| s.start);
    spans
}

/// Keep the spans that plausibly hold one record, outermost only.
fn select_spans(spans: Vec<ObjectSpan>, shape: ExpectedShape) -> Vec<ObjectSpan> {
    let matching: Vec<ObjectSpan> = match shape {
        ExpectedShape::Questions => spans
            .into_iter()
            .filter(|s| s.has_any_key(shape.anchor_keys()))
            .collect(),
        ExpectedShape::Units => {
            let (full, partial): (Vec<_>, Vec<_>) = spans
                .into_iter()
                .filter(|s| s.has_any_key(shape.anchor_keys()))
                .partition(|s| s.has_key("lessons"));
            // badly truncated units may not have reached their lessons key yet
            if full.is_empty() {
                partial
            } else {
                full
            }
        }
    };

    let mut kept: Vec<ObjectSpan> = Vec::new();
    for span in matching {
        if kept.iter().any(|k| k.contains(&span)) {
            continue;
        }
        kept.push(span);
    }
    kept
}

fn anchor_regex(shape: ExpectedShape) -> &'static Regex {
    static QUESTION: OnceLock<Regex> = OnceLock::new();
    static TITLE: OnceLock<Regex> = OnceLock::new();
    match shape {
        ExpectedShape::Questions => QUESTION.get_or_init(|| {
            Regex::new(r#""question(?:Text)?"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid question regex")
        }),
        ExpectedShape::Units => TITLE.get_or_init(|| {
            Regex::new(r#""title"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid title regex")
        }),
    }
}

/// Read the record's anchor string straight out of broken JSON.
fn anchor_text(raw: &str, shape: ExpectedShape) -> Option<String> {
    let captured = anchor_regex(shape).captures(raw)?.get(1)?.as_str();
    let text = serde_json::from_str::<String>(&format!("\"{}\"", captured))
        .unwrap_or_else(|_| captured.to_string());
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn preview(raw: &str, max_chars: usize) -> String {
    let mut chars = raw.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{QuestionOption, QuestionType};
    use crate::extract::extract;

    fn questions(outcome: &ParseOutcome) -> Vec<&crate::content::GeneratedQuestion> {
        outcome.items.iter().filter_map(|i| i.as_question()).collect()
    }

    #[test]
    fn test_whole_array_with_string_options() {
        let payload = r#"[{"question":"Q1","type":"SINGLE_CHOICE","options":["x","y"],"correctAnswer":"A","explanation":"e"}]"#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert!(!outcome.recovered);
        assert!(outcome.fragments.is_empty());
        let qs = questions(&outcome);
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].options, vec![QuestionOption::new("A", "x"), QuestionOption::new("B", "y")]);
        assert_eq!(qs[0].correct_answer, "A");
        assert_eq!(qs[0].explanation.as_deref(), Some("e"));
        assert_eq!(outcome.rescued_count(), 0);
        assert_eq!(outcome.invalid_count(), 0);
    }

    #[test]
    fn test_fenced_payload_defaults_type_and_options() {
        let raw = "Here is your quiz.\n```json\n[{\"question\":\"Q\"}]\n```\nEnjoy!";
        let payload = extract(raw);
        assert_eq!(payload, "[{\"question\":\"Q\"}]");

        let outcome = parse(&payload, ExpectedShape::Questions);
        let qs = questions(&outcome);
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].kind, QuestionType::SingleChoice);
        let ids: Vec<_> = qs[0].options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_truncated_array_yields_item_and_fragment() {
        let payload = r#"[{"question":"Q1","type":"TRUE_FALSE"},{"question":"Q2","type""#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert!(outcome.recovered);

        let qs = questions(&outcome);
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].question_text, "Q1");
        assert_eq!(qs[0].kind, QuestionType::TrueFalse);
        assert_eq!(
            qs[0].options,
            vec![QuestionOption::new("A", "Correct"), QuestionOption::new("B", "Incorrect")]
        );

        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].partial_text, "Q2");
        assert!(outcome.fragments[0].reason.starts_with("unparseable record"));
        assert_eq!(outcome.rescued_count(), 1);
        assert_eq!(outcome.invalid_count(), 1);
    }

    #[test]
    fn test_truncated_inside_string_is_dropped() {
        let payload = r#"[{"question":"Q1"},{"question":"Q2 is cut"#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert_eq!(outcome.items.len(), 1);
        // anchor string never closed, nothing to rescue
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_nested_option_objects_are_not_records() {
        let payload = r#"[{"question":"Q1","options":[{"id":"A","text":"a"},{"id":"B","text":"b"}]},{"question":"Q2","options":[{"id":"A""#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert_eq!(outcome.spans_found, 2);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].partial_text, "Q2");
    }

    #[test]
    fn test_objects_without_anchor_are_ignored() {
        let payload = r#"[{"foo":1},{"question":"Q"}, {"bar""#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert_eq!(outcome.spans_found, 1);
        assert_eq!(outcome.items.len(), 1);
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_whole_document_drops_invalid_without_fragments() {
        let payload = r#"[{"question":"Q"},{"nope":true},"stray"]"#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert_eq!(outcome.items.len(), 1);
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_wrapper_object_is_unwrapped() {
        let payload = r#"{"questions":[{"question":"A?"},{"question":"B?"}]}"#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert!(!outcome.recovered);
        assert_eq!(outcome.items.len(), 2);
    }

    #[test]
    fn test_unknown_wrapper_key_falls_back_to_span_scan() {
        let payload = extract("Here is the quiz: {\"quiz\": [{\"question\":\"Q1\"},{\"question\":\"Q2\"}]}");
        let outcome = parse(&payload, ExpectedShape::Questions);
        assert!(outcome.recovered);
        assert_eq!(outcome.items.len(), 2);
        assert!(outcome.fragments.is_empty());
        assert_eq!(questions(&outcome)[1].question_text, "Q2");
    }

    #[test]
    fn test_nested_wrapper_questions() {
        let outcome = parse(r#"{"data":{"questions":[{"question":"Q"}]}}"#, ExpectedShape::Questions);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(questions(&outcome)[0].question_text, "Q");
    }

    #[test]
    fn test_nested_wrapper_units() {
        let outcome = parse(
            r#"{"course":{"units":[{"title":"U1","lessons":[]},{"title":"U2","lessons":[{"title":"L1"}]}]}}"#,
            ExpectedShape::Units,
        );
        let titles: Vec<_> = outcome.items.iter().map(|i| i.as_unit().unwrap().title.as_str()).collect();
        assert_eq!(titles, vec!["U1", "U2"]);
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_question_text_key_anchors_spans() {
        let outcome = parse(r#"[{"questionText":"Q1"},{"questionText":"Q2""#, ExpectedShape::Questions);
        assert!(outcome.recovered);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(questions(&outcome)[0].question_text, "Q1");
        assert_eq!(outcome.fragments.len(), 1);
    }

    #[test]
    fn test_object_without_records_is_empty() {
        let outcome = parse(r#"{"message":"nothing to generate"}"#, ExpectedShape::Questions);
        assert!(outcome.items.is_empty());
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_single_object_document() {
        let outcome = parse(r#"{"title":"Only unit","lessons":[]}"#, ExpectedShape::Units);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].as_unit().unwrap().title, "Only unit");
    }

    #[test]
    fn test_ids_are_unique_within_a_call() {
        let payload = r#"[{"question":"a"},{"question":"b"},{"question":"c"}]"#;
        let outcome = parse(payload, ExpectedShape::Questions);
        let mut ids: Vec<_> = outcome.items.iter().map(|i| i.id().to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_truncated_units_recover_complete_units() {
        let payload = r#"[{"title":"U1","lessons":[{"title":"L1","questions":[{"question":"q"}]},{"title":"L2"}]},{"title":"U2","lessons":[{"title":"L"#;
        let outcome = parse(payload, ExpectedShape::Units);
        assert!(outcome.recovered);
        assert_eq!(outcome.items.len(), 1);
        let unit = outcome.items[0].as_unit().unwrap();
        assert_eq!(unit.title, "U1");
        assert_eq!(unit.lessons.len(), 2);
        assert!(!unit.lessons[0].locked);
        assert!(unit.lessons[1].locked);

        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].partial_text, "U2");
    }

    #[test]
    fn test_units_relaxed_to_title_only() {
        let payload = r#"[{"title":"U1","description":"d"},{"title":"U2","desc"#;
        let outcome = parse(payload, ExpectedShape::Units);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].partial_text, "U2");
    }

    #[test]
    fn test_fragment_preview_is_bounded() {
        let long = "x".repeat(5000);
        let payload = format!(r#"[{{"question":"Q","filler":"{}","type""#, long);
        let outcome = parse(&payload, ExpectedShape::Questions);
        assert_eq!(outcome.fragments.len(), 1);
        assert!(outcome.fragments[0].raw_preview.chars().count() <= FRAGMENT_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_escaped_anchor_text_is_unescaped() {
        let payload = r#"[{"question":"Say \"hi\"","type""#;
        let outcome = parse(payload, ExpectedShape::Questions);
        assert_eq!(outcome.fragments[0].partial_text, "Say \"hi\"");
    }

    #[test]
    fn test_garbage_never_panics() {
        let inputs = [
            "",
            "}}}]]]",
            "{{{{",
            "\"unterminated",
            "[\"question\": ",
            "not json at all",
            "{\"question\":",
            "[{\"question\":\"\\",
            "課程 {\"question\":\"中文問題\",",
        ];
        for input in inputs {
            for shape in [ExpectedShape::Questions, ExpectedShape::Units] {
                let outcome = parse(input, shape);
                assert!(outcome.items.len() + outcome.fragments.len() <= outcome.spans_found.max(outcome.items.len()));
            }
        }
    }

    #[test]
    fn test_unicode_fragment_recovery() {
        let outcome = parse("課程 {\"question\":\"中文問題\",", ExpectedShape::Questions);
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].partial_text, "中文問題");
    }

    #[test]
    fn test_scan_reports_direct_keys_only() {
        let spans = scan_objects(r#"{"a":{"b":1},"c":[{"d":2}]}"#);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].keys, vec!["a", "c"]);
        assert!(spans[0].closed);
        assert_eq!(spans[1].keys, vec!["b"]);
        assert_eq!(spans[2].keys, vec!["d"]);
    }
}
