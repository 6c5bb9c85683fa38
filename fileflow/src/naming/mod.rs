//! Filename generation from user patterns.
//!
//! A pattern is free text with `{name}` or `{name:spec}` tokens. Recognised
//! tokens are substituted from the [`NamingContext`]; anything else,
//! including unclosed braces, is copied through verbatim. The rendered stem
//! is sanitized and the extension always comes from the extracted
//! attributes, never from the pattern.

pub mod placeholder;
pub mod presets;

use chrono::{DateTime, Local};

use crate::domain::{JobAttributes, UserProfile};
use crate::utils::filename::{fit_filename, sanitize_filename};
use crate::{Error, Result};

pub use placeholder::{Placeholder, Value};
pub use presets::{PRESETS, PatternPreset, find_preset};

/// Pattern used when the user has none.
pub const DEFAULT_PATTERN: &str = "{original}";

/// Longest accepted pattern text, in bytes.
pub const MAX_PATTERN_LEN: usize = 200;

/// Everything a pattern can refer to.
#[derive(Debug, Clone)]
pub struct NamingContext<'a> {
    pub attributes: &'a JobAttributes,
    pub user: &'a UserProfile,
    /// Per-user counter value reserved for this job.
    pub counter: u64,
    /// Name the file arrived with, extension included.
    pub original_name: &'a str,
    pub now: DateTime<Local>,
}

impl NamingContext<'_> {
    /// Original name without its final extension.
    pub fn original_stem(&self) -> &str {
        match self.original_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => self.original_name,
        }
    }
}

/// One segment of a parsed pattern.
#[derive(Debug, Clone, PartialEq)]
enum Segment<'p> {
    Literal(&'p str),
    Token {
        placeholder: Placeholder,
        spec: Option<&'p str>,
    },
}

/// Split a pattern into literal text and recognised tokens.
fn parse(pattern: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(['}', '{']) else {
            break;
        };
        if after.as_bytes()[close] == b'{' {
            // `{ ... {` - the first brace cannot start a token.
            segments.push(Segment::Literal(&rest[..open + 1 + close]));
            rest = &after[close..];
            continue;
        }

        let body = &after[..close];
        let (name, spec) = match body.split_once(':') {
            Some((name, spec)) => (name, Some(spec)),
            None => (body, None),
        };

        match Placeholder::parse(name.trim()) {
            Some(placeholder) => {
                if open > 0 {
                    segments.push(Segment::Literal(&rest[..open]));
                }
                segments.push(Segment::Token { placeholder, spec });
            }
            None => segments.push(Segment::Literal(&rest[..open + close + 2])),
        }
        rest = &after[close + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

/// Whether rendering `pattern` needs a counter value.
pub fn uses_counter(pattern: &str) -> bool {
    parse(pattern).iter().any(|segment| {
        matches!(
            segment,
            Segment::Token {
                placeholder: Placeholder::Counter,
                ..
            }
        )
    })
}

/// Reject patterns that cannot be stored.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(Error::validation("pattern must not be empty"));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(Error::validation(format!(
            "pattern is longer than {MAX_PATTERN_LEN} bytes"
        )));
    }
    if pattern.chars().any(char::is_control) {
        return Err(Error::validation("pattern contains control characters"));
    }

    let mut depth = 0i32;
    for c in pattern.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(Error::validation("pattern has unbalanced braces"));
        }
    }
    if depth != 0 {
        return Err(Error::validation("pattern has an unclosed brace"));
    }
    Ok(())
}

/// Renders patterns into safe filenames.
#[derive(Debug, Clone)]
pub struct NamingEngine {
    /// Zero-padded width of `{counter}` when the token has no spec.
    counter_width: usize,
    /// Byte limit of the final name, extension included.
    max_filename_len: usize,
}

impl Default for NamingEngine {
    fn default() -> Self {
        Self {
            counter_width: 2,
            max_filename_len: 255,
        }
    }
}

impl NamingEngine {
    pub fn new(counter_width: usize, max_filename_len: usize) -> Self {
        Self {
            counter_width,
            max_filename_len: max_filename_len.max(8),
        }
    }

    /// Substitute tokens without sanitizing or appending an extension.
    pub fn expand(&self, pattern: &str, ctx: &NamingContext<'_>) -> String {
        let mut out = String::with_capacity(pattern.len() + 32);
        for segment in parse(pattern) {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token { placeholder, spec } => {
                    let width = match placeholder {
                        Placeholder::Counter => self.counter_width,
                        _ => 0,
                    };
                    out.push_str(&placeholder.resolve(ctx).render(spec, width));
                }
            }
        }
        out
    }

    /// Render `pattern` into a complete filename.
    ///
    /// A trailing extension typed into the pattern is dropped when it names
    /// a known format, so `{counter}.mkv` does not become `01.mkv.mp4`.
    pub fn render(&self, pattern: &str, ctx: &NamingContext<'_>) -> String {
        let expanded = self.expand(pattern, ctx);
        let stem = match expanded.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && media_types::is_known_extension(ext) => stem,
            _ => expanded.as_str(),
        };
        let stem = sanitize_filename(stem);
        fit_filename(
            &stem,
            ctx.attributes.output_extension(),
            self.max_filename_len,
        )
    }

    /// Name used when the user has no pattern configured.
    pub fn default_name(&self, ctx: &NamingContext<'_>) -> String {
        self.render(DEFAULT_PATTERN, ctx)
    }
}
