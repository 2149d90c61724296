use std::ops::Range;

/// Typed prefixes shorter than this do not open the suggestion popup.
pub const DEFAULT_MIN_COMPLETION_LENGTH: usize = 2;

const SEPARATORS: [char; 3] = [',', '\r', '\n'];

/// The token being typed: `[replace_start, replace_start + prefix.len())`.
///
/// Offsets are byte offsets into the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionContext {
    pub replace_start: usize,
    pub prefix: String,
}

impl CompletionContext {
    pub fn span(&self) -> Range<usize> {
        self.replace_start..self.replace_start + self.prefix.len()
    }

    /// Overwrites the span with `completion` and returns the new buffer with
    /// the cursor placed after the inserted text.
    pub fn apply(&self, buffer: &str, completion: &str) -> Option<(String, usize)> {
        let span = self.span();
        buffer.get(span.clone())?;
        let mut updated = String::with_capacity(buffer.len() + completion.len());
        updated.push_str(&buffer[..span.start]);
        updated.push_str(completion);
        updated.push_str(&buffer[span.end..]);
        Some((updated, span.start + completion.len()))
    }
}

/// Finds the comma/line delimited token ending at `cursor`, minus its leading
/// whitespace.
pub fn resolve(buffer: &str, cursor: usize) -> Option<CompletionContext> {
    if buffer.is_empty() || cursor == 0 {
        return None;
    }
    let head = buffer.get(..cursor)?;
    let start = head
        .rfind(SEPARATORS)
        .map(|index| index + 1)
        .unwrap_or(0);
    let candidate = &head[start..];
    let prefix = candidate.trim_start();
    if prefix.is_empty() {
        return None;
    }
    Some(CompletionContext {
        replace_start: start + (candidate.len() - prefix.len()),
        prefix: prefix.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTrigger {
    pub min_length: usize,
}

impl Default for CompletionTrigger {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_COMPLETION_LENGTH,
        }
    }
}

impl CompletionTrigger {
    /// Decides whether the popup should be shown for this keystroke.
    ///
    /// A forced request always yields a context; with nothing typed it is the
    /// empty prefix at the cursor so the whole vocabulary can be browsed.
    pub fn context(&self, buffer: &str, cursor: usize, forced: bool) -> Option<CompletionContext> {
        match resolve(buffer, cursor) {
            Some(context) if forced || context.prefix.chars().count() >= self.min_length => {
                Some(context)
            }
            None if forced => Some(CompletionContext {
                replace_start: cursor.min(buffer.len()),
                prefix: String::new(),
            }),
            _ => None,
        }
    }
}

/// Case-insensitive prefix matches first, then substring matches, each in
/// vocabulary order.
pub fn suggest<'a>(tags: &'a [String], prefix: &str, limit: usize) -> Vec<&'a str> {
    let needle = prefix.trim().to_lowercase();
    if needle.is_empty() {
        return tags.iter().take(limit).map(String::as_str).collect();
    }
    let mut leading = Vec::new();
    let mut inner = Vec::new();
    for tag in tags {
        let lowered = tag.to_lowercase();
        if lowered.starts_with(&needle) {
            leading.push(tag.as_str());
        } else if lowered.contains(&needle) {
            inner.push(tag.as_str());
        }
    }
    leading.extend(inner);
    leading.truncate(limit);
    leading
}
