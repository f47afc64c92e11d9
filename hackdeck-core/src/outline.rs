//! Slide outline model and the parser for language-model answers.
//!
//! The parser is strict about shape and lenient about packaging: code fences and prose
//! around the JSON body are tolerated, a missing title or non-string bullet is not.
//! Count mismatches are repaired by [`conform`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Title of the first padding slide.
pub const SUMMARY_TITLE: &str = "Summary";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    pub title: String,
    pub content: Vec<String>,
}

impl Slide {
    pub fn new(title: impl Into<String>, content: Vec<String>) -> Self {
        Self {
            title: title.into(),
            content,
        }
    }
}

/// Ordered slides. Once produced by the content generator its length equals the
/// requested slide count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideOutline {
    slides: Vec<Slide>,
}

impl SlideOutline {
    #[must_use]
    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slides.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }

    /// Markdown body sent to the deck service: one `#` heading per slide, bullets below.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        self.slides
            .iter()
            .map(|slide| {
                let mut block = format!("# {}\n", slide.title);
                for bullet in &slide.content {
                    block.push_str("- ");
                    block.push_str(bullet);
                    block.push('\n');
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse a raw model answer into slides, without adjusting their number.
pub fn parse_outline(raw: &str) -> Result<Vec<Slide>> {
    let body = extract_json(raw)?;
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PipelineError::malformed(format!("response is not valid JSON: {e}")))?;

    let slides = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("slides") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(PipelineError::malformed("'slides' is not an array")),
            None => return Err(PipelineError::malformed("object has no 'slides' field")),
        },
        _ => return Err(PipelineError::malformed("expected a JSON object or array")),
    };
    if slides.is_empty() {
        return Err(PipelineError::malformed("slide list is empty"));
    }

    slides
        .into_iter()
        .enumerate()
        .map(|(i, item)| parse_slide(i + 1, item))
        .collect()
}

fn parse_slide(number: usize, item: Value) -> Result<Slide> {
    let Value::Object(mut map) = item else {
        return Err(PipelineError::malformed(format!("slide {number} is not an object")));
    };
    let title = match map.remove("title") {
        Some(Value::String(t)) if !t.trim().is_empty() => t.trim().to_string(),
        _ => {
            return Err(PipelineError::malformed(format!(
                "slide {number} has no title"
            )))
        }
    };
    let content = match map.remove("content") {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(PipelineError::malformed(format!(
                    "slide {number} has non-string content: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) | None => {
            return Err(PipelineError::malformed(format!(
                "slide {number} has no content"
            )))
        }
        Some(other) => {
            return Err(PipelineError::malformed(format!(
                "slide {number} content must be a list of strings, got {other}"
            )))
        }
    };
    Ok(Slide { title, content })
}

/// Strip Markdown fences and any prose around the outermost JSON value.
fn extract_json(raw: &str) -> Result<&str> {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_start();
        if let Some(end) = body.rfind("```") {
            body = &body[..end];
        }
        body = body.trim();
    }
    let start = body
        .find(['{', '['])
        .ok_or_else(|| PipelineError::malformed("no JSON value found in response"))?;
    let end = body
        .rfind(['}', ']'])
        .filter(|&end| end >= start)
        .ok_or_else(|| PipelineError::malformed("no JSON value found in response"))?;
    Ok(&body[start..=end])
}

/// Force `slides` to exactly `count` entries: drop excess from the tail, pad with summary slides.
#[must_use]
pub fn conform(mut slides: Vec<Slide>, count: usize) -> SlideOutline {
    if slides.len() > count {
        tracing::warn!(got = slides.len(), wanted = count, "Model returned too many slides, dropping tail");
        slides.truncate(count);
    } else if slides.len() < count {
        tracing::warn!(got = slides.len(), wanted = count, "Model returned too few slides, padding");
        let covered: Vec<String> = slides.iter().map(|s| s.title.clone()).collect();
        let mut n = 0;
        while slides.len() < count {
            let title = if n == 0 {
                SUMMARY_TITLE.to_string()
            } else {
                format!("{SUMMARY_TITLE} (continued {n})")
            };
            let content = if n == 0 { covered.clone() } else { Vec::new() };
            slides.push(Slide { title, content });
            n += 1;
        }
    }
    SlideOutline { slides }
}
