//! Pull the JSON payload out of a raw provider reply.
//!
//! Models wrap their output in prose and markdown fences more often than not.
//! [`extract`] applies, first match wins:
//! 1. a fence labeled `json` (an unterminated one runs to the end of the text)
//! 2. any other fence
//! 3. the first top-level `[...]` span
//! 4. the first top-level `{...}` span
//! 5. the trimmed input

use regex::Regex;
use std::sync::OnceLock;

fn json_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*(?i:json)[^\n]*\n(.*?)(?:```|\z)").expect("valid json fence regex")
    })
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("valid fence regex"))
}

/// Never fails. The worst case hands unparseable text to the salvage parser.
pub fn extract(raw: &str) -> String {
    if let Some(body) = json_fence().captures(raw).and_then(|c| c.get(1)) {
        return body.as_str().trim().to_string();
    }
    if let Some(body) = any_fence().captures(raw).and_then(|c| c.get(1)) {
        return body.as_str().trim().to_string();
    }
    if let Some((start, end)) = top_level_span(raw, b'[') {
        return raw[start..end].to_string();
    }
    if let Some((start, end)) = top_level_span(raw, b'{') {
        return raw[start..end].to_string();
    }
    raw.trim().to_string()
}

/// Byte range of the first balanced top-level container opened by `open`.
/// Arrays that hold at least one object are preferred over bare ones like `[1]`
/// that show up in prose.
fn top_level_span(text: &str, open: u8) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut fallback = None;
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == open {
            match match_container(bytes, pos) {
                Some(end) => {
                    let inner = &bytes[pos + 1..end - 1];
                    if open == b'{' || inner.contains(&b'{') {
                        return Some((pos, end));
                    }
                    fallback.get_or_insert((pos, end));
                    pos = end;
                    continue;
                }
                None => return fallback,
            }
        }
        if bytes[pos] == b'{' || bytes[pos] == b'[' {
            // a container of the other kind; skip it whole so we stay at top level
            match match_container(bytes, pos) {
                Some(end) => {
                    pos = end;
                    continue;
                }
                None => return fallback,
            }
        }
        pos += 1;
    }

    fallback
}

/// Given `bytes[start]` is `{` or `[`, return the index one past its matching
/// closer. Quotes only count inside a container, so prose apostrophes and quotes
/// outside JSON never desynchronize the scan.
pub(crate) fn match_container(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
