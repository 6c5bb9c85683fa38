//! Filename sanitization for destination filesystems.
//!
//! Invalid characters are replaced rather than dropped so that the shape of a
//! user's pattern stays recognisable; valid Unicode (CJK, emoji) is kept.

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Name used when nothing usable is left after sanitizing.
pub const FALLBACK_NAME: &str = "unnamed";

/// Sanitize a string for use as a file name on all platforms.
///
/// 1. Control characters and Windows-invalid characters become `_`
/// 2. Runs of `_` (including ones already in the input) collapse to one
/// 3. Leading/trailing spaces, dots and underscores are trimmed
/// 4. Windows reserved device names get a `_` prefix
/// 5. An empty result becomes [`FALLBACK_NAME`]
///
/// ```
/// use fileflow::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("hello?world"), "hello_world");
/// assert_eq!(sanitize_filename("a__b"), "a_b");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// assert_eq!(sanitize_filename("CON"), "_CON");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_underscore = false;

    for c in input.chars() {
        let c = if c.is_control() || WINDOWS_INVALID_CHARS.contains(&c) {
            '_'
        } else {
            c
        };
        if c == '_' {
            if !last_was_underscore {
                result.push('_');
            }
            last_was_underscore = true;
        } else {
            result.push(c);
            last_was_underscore = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.' || c == '_');

    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{}.", reserved)) {
            return format!("_{}", trimmed);
        }
    }

    trimmed.to_string()
}

/// Truncate `s` to at most `max_bytes` bytes without splitting a character.
pub fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Join a stem and extension, shortening the stem so that the whole name
/// fits in `max_bytes`.
pub fn fit_filename(stem: &str, ext: &str, max_bytes: usize) -> String {
    let suffix_len = if ext.is_empty() { 0 } else { ext.len() + 1 };
    let budget = max_bytes.saturating_sub(suffix_len).max(1);
    let stem = truncate_to_bytes(stem, budget).trim_end_matches([' ', '.']);
    let stem = if stem.is_empty() { FALLBACK_NAME } else { stem };
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}
