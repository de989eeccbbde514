//! Placeholder grammar
//!
//! A placeholder is `${scope}` or `${scope.path}` where `path` is a dotted
//! sequence of identifiers, each optionally followed by one or more `[index]`
//! suffixes. Nothing else is accepted inside the braces.

use crate::error::{Result, StrataError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").expect("valid placeholder pattern"));

/// Marker that opens a placeholder
pub const OPEN: &str = "${";

/// One step of a reference path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `${scope.path}` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub scope: String,
    pub path: Vec<PathSegment>,
}

impl Reference {
    /// Parse the body of a placeholder (the text between `${` and `}`)
    pub fn parse(body: &str) -> std::result::Result<Self, String> {
        let mut chars = body.chars().peekable();
        let scope = read_identifier(&mut chars)
            .ok_or_else(|| format!("'{body}' must start with a scope name"))?;
        let mut path = Vec::new();

        while let Some(ch) = chars.next() {
            match ch {
                '.' => {
                    let key = read_identifier(&mut chars)
                        .ok_or_else(|| format!("expected a field name after '.' in '{body}'"))?;
                    path.push(PathSegment::Key(key));
                }
                '[' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            Some(other) => {
                                return Err(format!(
                                    "invalid character '{other}' in index of '{body}'"
                                ))
                            }
                            None => return Err(format!("unclosed '[' in '{body}'")),
                        }
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| format!("empty or invalid index in '{body}'"))?;
                    path.push(PathSegment::Index(index));
                }
                other => return Err(format!("unexpected character '{other}' in '{body}'")),
            }
        }

        Ok(Self { scope, path })
    }

    /// First key below the scope, if the path starts with one
    pub fn top_level_key(&self) -> Option<&str> {
        match self.path.first() {
            Some(PathSegment::Key(key)) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope)?;
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

fn read_identifier<I>(chars: &mut std::iter::Peekable<I>) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut ident = String::new();
    match chars.peek() {
        Some(&c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return None,
    }
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    Some(ident)
}

/// Template segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Reference),
}

/// A string split into literal text and placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    /// Parse a template string. Malformed or unterminated placeholders are errors.
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last_end = 0;

        for cap in PLACEHOLDER.captures_iter(input) {
            let (Some(full), Some(body)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            if full.start() > last_end {
                push_literal(&mut segments, &input[last_end..full.start()])?;
            }

            let reference = Reference::parse(body.as_str().trim())
                .map_err(|reason| StrataError::resolution(body.as_str(), reason))?;
            segments.push(Segment::Placeholder(reference));
            last_end = full.end();
        }

        if last_end < input.len() {
            push_literal(&mut segments, &input[last_end..])?;
        }

        Ok(Self { segments })
    }

    /// The single reference when the whole template is exactly one placeholder
    pub fn as_single_reference(&self) -> Option<&Reference> {
        match self.segments.as_slice() {
            [Segment::Placeholder(reference)] => Some(reference),
            _ => None,
        }
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(reference) => Some(reference),
            Segment::Literal(_) => None,
        })
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<()> {
    if let Some(pos) = text.find(OPEN) {
        return Err(StrataError::resolution(
            &text[pos..],
            "unterminated placeholder",
        ));
    }
    segments.push(Segment::Literal(text.to_string()));
    Ok(())
}

/// Whether a string could contain a placeholder
pub fn has_placeholder(input: &str) -> bool {
    input.contains(OPEN)
}

/// Collect every reference in a nested JSON value, failing on malformed ones
pub fn collect_references(value: &serde_json::Value) -> Result<Vec<Reference>> {
    let mut found = Vec::new();
    collect_into(value, &mut found)?;
    Ok(found)
}

fn collect_into(value: &serde_json::Value, found: &mut Vec<Reference>) -> Result<()> {
    use serde_json::Value;
    match value {
        Value::String(s) if has_placeholder(s) => {
            found.extend(Template::parse(s)?.references().cloned());
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}
