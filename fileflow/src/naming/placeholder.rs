//! The closed set of pattern placeholders and the values they resolve to.

use chrono::{Datelike, Timelike};

use super::NamingContext;

/// A recognised `{name}` or `{name:spec}` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Counter,
    Date,
    Time,
    DateTime,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Timestamp,
    User,
    Username,
    UserId,
    Original,
    OriginalFull,
    Ext,
    Size,
    SizeMb,
    Kind,
    Mime,
    Duration,
    Width,
    Height,
    Resolution,
    Codec,
    AudioCodec,
    Bitrate,
    Hash,
    Hash8,
    Random,
    Uuid,
}

impl Placeholder {
    pub fn parse(name: &str) -> Option<Self> {
        let p = match name.to_ascii_lowercase().as_str() {
            "counter" => Self::Counter,
            "date" => Self::Date,
            "time" => Self::Time,
            "datetime" => Self::DateTime,
            "year" => Self::Year,
            "month" => Self::Month,
            "day" => Self::Day,
            "hour" => Self::Hour,
            "minute" => Self::Minute,
            "second" => Self::Second,
            "timestamp" => Self::Timestamp,
            "user" => Self::User,
            "username" => Self::Username,
            "user_id" => Self::UserId,
            "original" => Self::Original,
            "original_full" => Self::OriginalFull,
            "ext" => Self::Ext,
            "size" => Self::Size,
            "size_mb" => Self::SizeMb,
            "kind" | "type" => Self::Kind,
            "mime" => Self::Mime,
            "duration" => Self::Duration,
            "width" => Self::Width,
            "height" => Self::Height,
            "resolution" => Self::Resolution,
            "codec" => Self::Codec,
            "audio_codec" => Self::AudioCodec,
            "bitrate" => Self::Bitrate,
            "hash" => Self::Hash,
            "hash8" => Self::Hash8,
            "random" => Self::Random,
            "uuid" => Self::Uuid,
            _ => return None,
        };
        Some(p)
    }

    /// Resolve against a context. Absent attributes yield [`Value::Absent`].
    pub fn resolve(&self, ctx: &NamingContext<'_>) -> Value {
        let attrs = ctx.attributes;
        let now = ctx.now;
        match self {
            Self::Counter => Value::Integer(ctx.counter),
            Self::Date => Value::Text(now.format("%Y-%m-%d").to_string()),
            Self::Time => Value::Text(now.format("%H-%M-%S").to_string()),
            Self::DateTime => Value::Text(now.format("%Y-%m-%d_%H-%M-%S").to_string()),
            Self::Year => Value::Integer(now.year().max(0) as u64),
            Self::Month => Value::Padded(u64::from(now.month()), 2),
            Self::Day => Value::Padded(u64::from(now.day()), 2),
            Self::Hour => Value::Padded(u64::from(now.hour()), 2),
            Self::Minute => Value::Padded(u64::from(now.minute()), 2),
            Self::Second => Value::Padded(u64::from(now.second()), 2),
            Self::Timestamp => Value::Integer(now.timestamp().max(0) as u64),
            Self::User => Value::Text(ctx.user.display()),
            Self::Username => ctx.user.username.clone().into(),
            Self::UserId => Value::Text(ctx.user.user_id.to_string()),
            Self::Original => Value::Text(ctx.original_stem().to_string()),
            Self::OriginalFull => Value::Text(ctx.original_name.to_string()),
            Self::Ext => Value::Text(attrs.output_extension().to_string()),
            Self::Size => Value::Integer(attrs.size_bytes),
            Self::SizeMb => Value::Decimal(attrs.size_mb()),
            Self::Kind => Value::Text(attrs.kind.to_string()),
            Self::Mime => Value::Text(attrs.mime.replace('/', "-")),
            Self::Duration => attrs
                .duration_secs
                .map(|d| Value::Integer(d.round().max(0.0) as u64))
                .unwrap_or(Value::Absent),
            Self::Width => attrs
                .resolution
                .map(|r| Value::Integer(u64::from(r.width)))
                .unwrap_or(Value::Absent),
            Self::Height => attrs
                .resolution
                .map(|r| Value::Integer(u64::from(r.height)))
                .unwrap_or(Value::Absent),
            Self::Resolution => attrs
                .resolution
                .map(|r| Value::Text(r.to_string()))
                .unwrap_or(Value::Absent),
            Self::Codec => attrs.video_codec.clone().into(),
            Self::AudioCodec => attrs.audio_codec.clone().into(),
            Self::Bitrate => attrs.bitrate.map(Value::Integer).unwrap_or(Value::Absent),
            Self::Hash => attrs.sha256.clone().into(),
            Self::Hash8 => attrs
                .sha256
                .as_deref()
                .map(|h| Value::Text(h.chars().take(8).collect()))
                .unwrap_or(Value::Absent),
            Self::Random => Value::Random,
            Self::Uuid => Value::Text(uuid::Uuid::new_v4().simple().to_string()),
        }
    }
}

/// Tagged value a placeholder resolves to. The format spec is applied per
/// variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(u64),
    /// Integer with a minimum zero-padded width unless the spec overrides it.
    Padded(u64, usize),
    Decimal(f64),
    /// Random alphanumeric string, length taken from the spec.
    Random,
    Absent,
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map(Value::Text).unwrap_or(Value::Absent)
    }
}

const DEFAULT_RANDOM_LEN: usize = 6;
const MAX_RANDOM_LEN: usize = 32;
const MAX_PAD_WIDTH: usize = 20;

/// Parse a width out of specs like `3`, `03`, `03d`.
fn spec_width(spec: Option<&str>) -> Option<usize> {
    let digits: String = spec?
        .trim()
        .trim_end_matches('d')
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

impl Value {
    /// Render with an optional spec. `default_width` applies to integers
    /// that carry no width of their own (the counter).
    pub fn render(&self, spec: Option<&str>, default_width: usize) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Integer(n) => {
                let width = spec_width(spec).unwrap_or(default_width).min(MAX_PAD_WIDTH);
                format!("{n:0width$}")
            }
            Self::Padded(n, w) => {
                let width = spec_width(spec).unwrap_or(*w).min(MAX_PAD_WIDTH);
                format!("{n:0width$}")
            }
            Self::Decimal(x) => {
                let precision = spec
                    .and_then(|s| s.trim().trim_start_matches('.').parse::<usize>().ok())
                    .unwrap_or(2)
                    .min(6);
                format!("{x:.precision$}")
            }
            Self::Random => {
                let len = spec_width(spec)
                    .unwrap_or(DEFAULT_RANDOM_LEN)
                    .clamp(1, MAX_RANDOM_LEN);
                random_alphanumeric(len)
            }
            Self::Absent => String::new(),
        }
    }
}

fn random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARSET[rand::random::<u32>() as usize % CHARSET.len()] as char)
        .collect()
}
