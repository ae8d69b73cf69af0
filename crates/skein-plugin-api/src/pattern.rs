//! Route patterns: anchoring, priority and capture extraction.

use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::error::{PluginError, PluginResult};

/// Priority of a pattern without any metacharacter.
pub const PRIORITY_LITERAL: usize = usize::MAX;

/// At most this many capture groups are considered for handler arguments.
pub const MAX_CAPTURES: usize = 7;

const METACHARS: &[char] = &['(', ')', '[', ']', '.', '*', '?', '+', '$'];

/// A compiled, start-anchored route pattern.
#[derive(Clone)]
pub struct RoutePattern {
    text: String,
    regex: Regex,
    priority: usize,
}

impl RoutePattern {
    /// Prefix `^` unless the pattern already starts with it.
    pub fn anchor(pattern: &str) -> String {
        if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{}", pattern)
        }
    }

    /// Offset of the first metacharacter in an anchored pattern. Lower values
    /// are tried first; literal patterns get [`PRIORITY_LITERAL`].
    pub fn priority_of(anchored: &str) -> usize {
        match anchored.find(METACHARS) {
            Some(0) | None => PRIORITY_LITERAL,
            Some(offset) => offset,
        }
    }

    /// Anchor and compile a pattern. Matching is case-insensitive.
    pub fn compile(pattern: &str) -> PluginResult<Self> {
        let text = Self::anchor(pattern);
        let regex = RegexBuilder::new(&text)
            .case_insensitive(true)
            .build()
            .map_err(|e| PluginError::InvalidPattern {
                pattern: text.clone(),
                message: e.to_string(),
            })?;
        let priority = Self::priority_of(&text);
        Ok(Self {
            text,
            regex,
            priority,
        })
    }

    /// The anchored pattern text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    /// Match `location` and return the text of every participating capture
    /// group among the first [`MAX_CAPTURES`], in group order.
    pub fn captures(&self, location: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(location)?;
        Some(
            caps.iter()
                .skip(1)
                .take(MAX_CAPTURES)
                .flatten()
                .map(|m| m.as_str().to_string())
                .collect(),
        )
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePattern")
            .field("text", &self.text)
            .field("priority", &self.priority)
            .finish()
    }
}
