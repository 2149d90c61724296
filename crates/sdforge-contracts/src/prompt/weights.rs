use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

/// Weight change applied by one press of the adjustment shortcut.
pub const WEIGHT_STEP: f64 = 0.5;

const IMPLICIT_WEIGHT: f64 = 1.0;
const WEIGHT_PATTERN: &str = r"[+-]?(?:\d+(?:\.\d*)?|\.\d+)";

/// A `(tag:weight)` annotation found in a buffer. `span` covers the exact
/// bytes to overwrite, parentheses included when present.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedToken {
    pub tag: String,
    pub weight: f64,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightEdit {
    pub span: Range<usize>,
    pub replacement: String,
}

impl WeightEdit {
    /// Returns the rewritten buffer and the span of the new token, which the
    /// editor re-selects so the shortcut can be pressed again.
    pub fn apply(&self, buffer: &str) -> Option<(String, Range<usize>)> {
        buffer.get(self.span.clone())?;
        let mut updated = String::with_capacity(buffer.len() + self.replacement.len());
        updated.push_str(&buffer[..self.span.start]);
        updated.push_str(&self.replacement);
        updated.push_str(&buffer[self.span.end..]);
        let start = self.span.start;
        Some((updated, start..start + self.replacement.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDirection {
    Increase,
    Decrease,
}

impl WeightDirection {
    pub fn delta(self) -> f64 {
        match self {
            Self::Increase => WEIGHT_STEP,
            Self::Decrease => -WEIGHT_STEP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorKey {
    Up,
    Down,
    Other,
}

/// Up/Down only adjust weights for a plain keypress over a non-empty
/// selection; everything else is left to normal text editing.
pub fn shortcut_direction(
    key: EditorKey,
    modifiers_held: bool,
    selection: &Range<usize>,
) -> Option<WeightDirection> {
    if modifiers_held || selection.start >= selection.end {
        return None;
    }
    match key {
        EditorKey::Up => Some(WeightDirection::Increase),
        EditorKey::Down => Some(WeightDirection::Decrease),
        EditorKey::Other => None,
    }
}

fn parenthesized_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"^\((.+):({WEIGHT_PATTERN})\)$"))
            .expect("parenthesized weight pattern compiles")
    })
}

fn bare_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"^([^()]+):({WEIGHT_PATTERN})$"))
            .expect("bare weight pattern compiles")
    })
}

fn capture_weighted(pattern: &Regex, text: &str) -> Option<(String, f64)> {
    let captures = pattern.captures(text)?;
    let tag = captures.get(1)?.as_str().trim();
    if tag.is_empty() {
        return None;
    }
    let weight = captures.get(2)?.as_str().parse::<f64>().ok()?;
    Some((tag.to_string(), weight))
}

/// Recognises the annotation under `selection`, trying in order:
/// `(tag:weight)`, `tag:weight`, the `( ... )` group already wrapping the
/// selection, and finally the selection itself as a weight 1.0 tag.
pub fn parse(buffer: &str, selection: Range<usize>) -> Option<WeightedToken> {
    if selection.start >= selection.end {
        return None;
    }
    let selected = buffer.get(selection.clone())?;
    if selected.contains(['\n', '\r']) {
        return None;
    }
    let trimmed = selected.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = selection.start + (selected.len() - selected.trim_start().len());
    let span = start..start + trimmed.len();

    if let Some((tag, weight)) = capture_weighted(parenthesized_pattern(), trimmed) {
        return Some(WeightedToken { tag, weight, span });
    }
    if let Some((tag, weight)) = capture_weighted(bare_pattern(), trimmed) {
        let span = widen_to_parens(buffer, span);
        return Some(WeightedToken { tag, weight, span });
    }
    match enclosing_group(buffer, &span) {
        Enclosing::Token(token) => return Some(token),
        Enclosing::Unterminated => return None,
        Enclosing::Absent => {}
    }
    // A whole `(tag)` group selected directly, parens included.
    if let Some(content) = trimmed.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
        let content = content.trim();
        if content.is_empty() || content.contains([',', '(', ')']) {
            return None;
        }
        return Some(WeightedToken {
            tag: content.to_string(),
            weight: IMPLICIT_WEIGHT,
            span,
        });
    }
    if trimmed.contains([',', '(', ')']) {
        return None;
    }
    Some(WeightedToken {
        tag: trimmed.to_string(),
        weight: IMPLICIT_WEIGHT,
        span,
    })
}

/// Rewrites the annotation under `selection` with its weight shifted by
/// `delta`, clamped at zero. Always renders `(tag:weight)`.
pub fn adjust(buffer: &str, selection: Range<usize>, delta: f64) -> Option<WeightEdit> {
    let token = parse(buffer, selection)?;
    let weight = clamp_weight(token.weight + delta);
    Some(WeightEdit {
        span: token.span,
        replacement: render(&token.tag, weight),
    })
}

pub fn render(tag: &str, weight: f64) -> String {
    format!("({tag}:{})", format_weight(weight))
}

/// Integral weights keep one decimal (`1.0`); others drop trailing zeros.
/// Rounding to ten places only removes float noise such as `1.8000000000000003`.
pub fn format_weight(weight: f64) -> String {
    let text = format!("{weight:.10}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.contains('.') {
        trimmed.to_string()
    } else {
        format!("{trimmed}.0")
    }
}

fn clamp_weight(weight: f64) -> f64 {
    if weight > 0.0 {
        weight
    } else {
        0.0
    }
}

// `tag:weight` selected inside `(tag:weight)` rewrites the whole group.
fn widen_to_parens(buffer: &str, span: Range<usize>) -> Range<usize> {
    if buffer[..span.start].ends_with('(') && buffer[span.end..].starts_with(')') {
        return span.start - 1..span.end + 1;
    }
    span
}

enum Enclosing {
    Token(WeightedToken),
    Unterminated,
    Absent,
}

fn enclosing_group(buffer: &str, span: &Range<usize>) -> Enclosing {
    if !buffer[..span.start].ends_with('(') {
        return Enclosing::Absent;
    }
    let open = span.start - 1;
    let tail = &buffer[span.end..];
    let Some(close_offset) = tail.find([')', '(', '\n', '\r']) else {
        return Enclosing::Unterminated;
    };
    if !tail[close_offset..].starts_with(')') {
        return Enclosing::Unterminated;
    }
    let close = span.end + close_offset;
    let group = &buffer[open..=close];
    let group_span = open..close + 1;

    if let Some((tag, weight)) = capture_weighted(parenthesized_pattern(), group) {
        return Enclosing::Token(WeightedToken {
            tag,
            weight,
            span: group_span,
        });
    }
    let content = buffer[open + 1..close].trim();
    if content.is_empty() || content.contains(',') {
        return Enclosing::Absent;
    }
    Enclosing::Token(WeightedToken {
        tag: content.to_string(),
        weight: IMPLICIT_WEIGHT,
        span: group_span,
    })
}
