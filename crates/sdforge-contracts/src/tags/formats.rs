use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::Value;

const CSV_HEADER_TOKENS: [&str; 4] = ["tag", "name", "alias", "aliases"];

/// Raw (not yet normalized) tags contributed by one vocabulary file.
/// Unknown extensions contribute nothing.
pub(crate) fn load_file(path: &Path) -> Result<Vec<String>> {
    let extension = lowercase_extension(path);
    match extension.as_deref() {
        Some("txt") => Ok(parse_txt(&read_text(path)?)),
        Some("csv") => Ok(parse_csv(&read_text(path)?)),
        Some("json") => parse_json(&read_text(path)?)
            .with_context(|| format!("invalid JSON in {}", path.display())),
        Some("gz") => load_compressed(path),
        _ => Ok(Vec::new()),
    }
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_compressed(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut text = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut text)
        .with_context(|| format!("failed to decompress {}", path.display()))?;

    // `tags.csv.gz` -> `csv`
    let inner = path
        .file_stem()
        .map(Path::new)
        .and_then(lowercase_extension);
    match inner.as_deref() {
        Some("csv") => Ok(parse_csv(&text)),
        Some("json") => {
            parse_json(&text).with_context(|| format!("invalid JSON in {}", path.display()))
        }
        _ => Ok(parse_lines(&text)),
    }
}

fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// One tag per line; anything after the first comma (post counts) is dropped.
pub(crate) fn parse_txt(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(',') {
            Some((head, _)) => head.trim().to_string(),
            None => line.to_string(),
        })
        .collect()
}

pub(crate) fn parse_json(text: &str) -> Result<Vec<String>> {
    let data: Value = serde_json::from_str(text)?;
    let mut tags = Vec::new();
    match data {
        Value::Object(entries) => {
            for (key, value) in entries {
                tags.push(key);
                match value {
                    Value::String(text) => tags.push(text),
                    Value::Array(items) => tags.extend(string_items(items)),
                    _ => {}
                }
            }
        }
        Value::Array(items) => tags.extend(string_items(items)),
        Value::String(text) => tags.push(text),
        _ => {}
    }
    Ok(tags)
}

fn string_items(items: Vec<Value>) -> impl Iterator<Item = String> {
    items.into_iter().filter_map(|item| match item {
        Value::String(text) => Some(text),
        _ => None,
    })
}

/// Tag-autocomplete CSV exports. A header naming `tag`/`name` and
/// `alias`/`aliases` selects the columns; without one, column 0 is the tag
/// and the first row is data.
pub(crate) fn parse_csv(text: &str) -> Vec<String> {
    let mut rows = csv_records(text).into_iter();
    let Some(first) = rows.next() else {
        return Vec::new();
    };
    let headers = first
        .iter()
        .map(|cell| cell.trim().to_lowercase())
        .collect::<Vec<String>>();
    let has_header = headers
        .iter()
        .any(|header| CSV_HEADER_TOKENS.contains(&header.as_str()));

    let mut tags = Vec::new();
    let mut tag_index = 0;
    let mut alias_index = None;
    if has_header {
        for (index, header) in headers.iter().enumerate() {
            match header.as_str() {
                "tag" | "name" => tag_index = index,
                "alias" | "aliases" => alias_index = Some(index),
                _ => {}
            }
        }
    } else {
        consume_row(&first, 0, None, &mut tags);
    }
    for row in rows {
        consume_row(&row, tag_index, alias_index, &mut tags);
    }
    tags
}

fn consume_row(row: &[String], tag_index: usize, alias_index: Option<usize>, tags: &mut Vec<String>) {
    if let Some(tag) = row.get(tag_index).map(|cell| cell.trim()) {
        if !tag.is_empty() {
            tags.push(tag.to_string());
        }
    }
    if let Some(aliases) = alias_index.and_then(|index| row.get(index)) {
        tags.extend(split_aliases(aliases));
    }
}

fn split_aliases(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
}

/// Minimal RFC 4180 reader: quoted fields may hold commas, doubled quotes and
/// line breaks. Blank lines come back as empty records.
fn csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut started = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }
        match ch {
            '"' if field.is_empty() => {
                in_quotes = true;
                started = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                started = true;
            }
            '\r' | '\n' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                if started {
                    record.push(std::mem::take(&mut field));
                }
                records.push(std::mem::take(&mut record));
                started = false;
            }
            _ => {
                field.push(ch);
                started = true;
            }
        }
    }
    if started {
        record.push(field);
        records.push(record);
    }
    records
}
