/*
 * Copyright (C) 2026 The Milpa Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Structured logging for the controllers. Every line is a flat record
//! of `(key, value)` fields rendered either as `key=value` text or as
//! one JSON object, so the same call sites feed both humans and log
//! shippers. Controllers log under a stable component name and attach
//! the object they acted on as metadata.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

const SERVICE_NAME: &str = "milpa";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

fn current_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Levels order by severity so a single atomic holds the emission
/// threshold.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parses the spelling accepted on the command line.
    pub fn parse(input: &str) -> Option<LogLevel> {
        match input.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> LogLevel {
        match value {
            0 => LogLevel::Debug,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Lowest level that still reaches the output.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn min_level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Flattens one log call into its ordered field list. The fixed fields
/// lead so text lines stay grep-stable; caller metadata follows in the
/// order given.
fn record_fields(
    level: LogLevel,
    component: &str,
    message: &str,
    metadata: &[(&str, &str)],
) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(6 + metadata.len());
    fields.push((
        "ts".to_string(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    ));
    fields.push(("level".to_string(), level.as_str().to_string()));
    fields.push(("service".to_string(), SERVICE_NAME.to_string()));
    fields.push(("component".to_string(), component.to_string()));
    fields.push(("pid".to_string(), std::process::id().to_string()));
    fields.push(("msg".to_string(), message.to_string()));
    for (key, value) in metadata {
        if !key.is_empty() {
            fields.push(((*key).to_string(), (*value).to_string()));
        }
    }
    fields
}

fn render_text(fields: &[(String, String)]) -> String {
    let mut line = String::new();
    for (key, value) in fields {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(key);
        line.push('=');
        let bare = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':'));
        if bare {
            line.push_str(value);
        } else {
            // Debug formatting supplies the quoting and escaping.
            line.push_str(&format!("{value:?}"));
        }
    }
    line
}

fn render_json(fields: &[(String, String)]) -> String {
    let mut payload = Map::new();
    for (key, value) in fields {
        payload.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(payload).to_string()
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if level < min_level() {
        return;
    }
    let fields = record_fields(level, component, message, metadata);
    let line = match current_format() {
        LogFormat::Text => render_text(&fields),
        LogFormat::Json => render_json(&fields),
    };
    // Warnings and errors go to stderr so plain-text operators see them
    // even when stdout is piped away. A failed write has nowhere better
    // to go.
    if level >= LogLevel::Warn {
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    } else {
        let _ = writeln!(std::io::stdout().lock(), "{line}");
    }
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_quotes_only_what_needs_it() {
        let fields = record_fields(
            LogLevel::Info,
            "pod-controller",
            "pod bound",
            &[("pod", "p1"), ("node", "cell-04aa"), ("reason", "no node available")],
        );
        let line = render_text(&fields);
        assert!(line.contains("component=pod-controller"), "{line}");
        assert!(line.contains("msg=\"pod bound\""), "{line}");
        assert!(line.contains("node=cell-04aa"), "{line}");
        assert!(line.contains("reason=\"no node available\""), "{line}");
    }

    #[test]
    fn text_escapes_embedded_quotes() {
        let fields = record_fields(
            LogLevel::Error,
            "node-controller",
            "boot failed",
            &[("error", "image \"img-1\" missing")],
        );
        let line = render_text(&fields);
        assert!(line.contains(r#"error="image \"img-1\" missing""#), "{line}");
    }

    #[test]
    fn json_records_parse_back() {
        let fields = record_fields(
            LogLevel::Warn,
            "garbage-controller",
            "orphan reaped",
            &[("instance", "i-42"), ("", "dropped")],
        );
        let payload: Value = serde_json::from_str(&render_json(&fields)).expect("valid json");
        assert_eq!(payload["service"], "milpa");
        assert_eq!(payload["level"], "WARN");
        assert_eq!(payload["component"], "garbage-controller");
        assert_eq!(payload["instance"], "i-42");
        // Empty metadata keys are dropped, not serialized.
        assert!(payload.get("").is_none());
    }

    #[test]
    fn levels_order_and_parse() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::from_u8(LogLevel::Error as u8), LogLevel::Error);
    }
}
