//! Minimal INI reader for rudimentary configuration files.
//!
//! Supports flat keys and `[section]`-nested keys. Keys and values are
//! strings and may be double-quoted; inside quotes the escapes `\"`, `\\`,
//! `\n` and `\r` are understood. Lines starting with `;` are comments.
//! Bare or quoted all-digit values are coerced to integers so that
//! `port = 5432` reads back as a number like it would from JSON or YAML.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::{Error, Result};

fn assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^=]+?)\s*=\s*(.+)$").expect("static regex"))
}

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([^\n=\]]+)\]$").expect("static regex"))
}

/// Parses INI text into a JSON-shaped mapping.
///
/// Top-level assignments land in the root object; assignments under a
/// `[section]` header land in an object keyed by the section name.
pub fn load(text: &str) -> Result<Value> {
    let mut root = Map::new();
    let mut section: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if let Some(caps) = section_re().captures(line) {
            let name = caps[1].trim().to_string();
            let slot = root
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            // A top-level key with the same name gets shadowed by the section.
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            section = Some(name);
            continue;
        }

        if let Some(caps) = assign_re().captures(line) {
            let key = match parse_token(&caps[1]) {
                Value::String(s) => s,
                other => other.to_string(),
            };
            let value = parse_token(&caps[2]);

            match &section {
                Some(name) => {
                    // The header handler above guarantees this is an object.
                    if let Some(Value::Object(map)) = root.get_mut(name) {
                        map.insert(key, value);
                    }
                }
                None => {
                    root.insert(key, value);
                }
            }
            continue;
        }

        return Err(Error::IniSyntax {
            line: idx + 1,
            message: format!("unexpected token: {line:?}"),
        });
    }

    Ok(Value::Object(root))
}

/// Unquotes a token if it is double-quoted, then coerces all-digit strings
/// to integers.
fn parse_token(token: &str) -> Value {
    let token = token.trim();

    let unquoted = if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        let inner = &token[1..token.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        out
    } else {
        token.to_string()
    };

    if !unquoted.is_empty() && unquoted.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = unquoted.parse::<i64>() {
            return Value::Number(n.into());
        }
    }

    Value::String(unquoted)
}
