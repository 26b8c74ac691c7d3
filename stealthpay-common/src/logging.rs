//! Logging for StealthPay
//!
//! Messages are tagged with the part of the send path they come from and
//! their structured parameters are sanitized before they reach the logger:
//! strings (addresses, labels, txids) keep only their edges, numbers pass
//! through. Secrets are never handed to these functions in the first place.
//!
//! ```
//! use stealthpay_common::logging::{self, LogConfig, LogLevel};
//! use serde_json::json;
//!
//! logging::init(&LogConfig::default()).expect("Failed to initialize logging");
//! logging::log_transaction(LogLevel::Info, "transaction committed", Some(json!({ "outputs": 2 })));
//! ```

use chrono::Local;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::OnceLock;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Where in the send path a message comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContext {
    /// Key agreement, narration encryption, key reservation
    Security,
    /// Balance polling, event publishing
    Core,
    /// Transaction creation, fee confirmation, commit
    Transaction,
    /// Address book and wallet records
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr
    pub log_file: Option<String>,
    pub include_timestamps: bool,
    pub include_source_location: bool,
    /// One JSON object per line
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            include_timestamps: true,
            include_source_location: true,
            json_format: false,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

static LOGGING_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Install the process-wide logger
///
/// Only the first call configures anything. Every later call returns the
/// first call's result, whatever configuration it is given.
pub fn init(config: &LogConfig) -> Result<(), String> {
    LOGGING_INIT.get_or_init(|| install(config)).clone()
}

fn install(config: &LogConfig) -> Result<(), String> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level.into());

    let include_timestamps = config.include_timestamps;
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;

    builder.format(move |buf, record| {
        let timestamp = if include_timestamps {
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            String::new()
        };
        let location = if include_source_location {
            format!(" [{}:{}]", record.file().unwrap_or("unknown"), record.line().unwrap_or(0))
        } else {
            String::new()
        };

        if json_format {
            let line = json!({
                "timestamp": timestamp,
                "level": record.level().to_string(),
                "target": record.target(),
                "location": location,
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        } else {
            if include_timestamps {
                write!(buf, "{} ", timestamp)?;
            }
            let mut style = buf.style();
            style.set_bold(true);
            writeln!(buf, "[{}{}] {}", style.value(record.level()), location, record.args())
        }
    });

    if let Some(path) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("Failed to open log file {}: {}", path, e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // Another logger (a test harness, an embedding app) is not an error
    if builder.try_init().is_err() {
        log::debug!("Logger already installed, keeping it");
    }
    Ok(())
}

/// Mask a value that may identify the user
///
/// Keeps the first and last four characters of long values and masks short
/// values completely.
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "*****".to_string();
    }

    let first: String = chars[..4].iter().collect();
    let last: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", first, last)
}

// Numbers and booleans carry no identifying data
fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => json!(sanitize_for_logging(s)),
        Value::Number(_) | Value::Bool(_) | Value::Null => value.clone(),
        other => json!(sanitize_for_logging(&other.to_string())),
    }
}

fn log_with_context(level: LogLevel, context: LogContext, message: &str, params: Option<Value>) {
    let params = params.map(|params| match params {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let value = sanitize_value(&value);
                    (key, value)
                })
                .collect(),
        ),
        other => sanitize_value(&other),
    });

    match params {
        Some(params) => log::log!(level.into(), "[{:?}] {} - {}", context, message, params),
        None => log::log!(level.into(), "[{:?}] {}", context, message),
    }
}

pub fn log_security(level: LogLevel, message: &str, params: Option<Value>) {
    log_with_context(level, LogContext::Security, message, params);
}

pub fn log_core(level: LogLevel, message: &str, params: Option<Value>) {
    log_with_context(level, LogContext::Core, message, params);
}

pub fn log_transaction(level: LogLevel, message: &str, params: Option<Value>) {
    log_with_context(level, LogContext::Transaction, message, params);
}

pub fn log_storage(level: LogLevel, message: &str, params: Option<Value>) {
    log_with_context(level, LogContext::Storage, message, params);
}
