//! System prompt templating
//!
//! The first system message may reference `{{Now}}` and `{{Model}}` (the
//! `{{.Now}}` spelling is accepted too). Substitution is a single pass over
//! the original text, so values are never themselves re-templated.

use std::sync::OnceLock;

use chrono::{DateTime, TimeZone};
use regex::Regex;

use crate::llm::{Message, Role};

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// Format used for `{{Now}}`, e.g. `Monday 2024-07-01T09:30:00 +02:00`
pub fn format_now<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%A %Y-%m-%dT%H:%M:%S %Z").to_string()
}

/// Substitute known keys in `text`; unknown keys are left untouched.
pub fn render(text: &str, now: &str, model: &str) -> String {
    placeholder()
        .replace_all(text, |caps: &regex::Captures<'_>| match &caps[1] {
            "Now" => now.to_string(),
            "Model" => model.to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Returns `messages` with the leading system message templated.
///
/// Histories that do not start with a system message are returned as is.
pub fn apply(messages: &[Message], model: &str) -> Vec<Message> {
    let mut out = messages.to_vec();
    if let Some(first) = out.first_mut() {
        if first.role == Role::System {
            let now = format_now(&chrono::Local::now());
            first.content = render(&first.content, &now, model);
        }
    }
    out
}
