//! Output capture pipeline
//!
//! Drains a child's standard output into up to three sinks: the optional
//! `output_file` (every byte), a mode-capped in-memory buffer, and the spill
//! log `logs/<Step>.stdout`. The spill log is written while streaming and
//! removed afterwards unless the buffer overflowed or JSON parsing failed,
//! so the full stream is always on disk exactly when `truncated` or a parse
//! error is recorded.

use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{EXIT_INVALID, ErrorKind, StepError};

/// How captured stdout is parsed into the step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Text,
    Lines,
    Json,
}

/// Text mode retains exactly this many bytes in memory.
pub const TEXT_CAP_BYTES: usize = 8 * 1024;
/// Lines mode retains exactly this many entries.
pub const LINES_CAP: usize = 10_000;
/// Byte backstop for the lines buffer, so a stream of pathologically long
/// lines stays bounded in memory as well.
pub const LINES_BYTE_CAP: usize = 1024 * 1024;
/// Json mode parses streams up to exactly this many bytes.
pub const JSON_CAP_BYTES: usize = 1024 * 1024;

/// Capture configuration for one step execution.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    /// Absolute path receiving every byte of stdout, if declared.
    pub output_file: Option<PathBuf>,
    /// Absolute `logs/<Step>.stdout` spill path.
    pub spill_path: PathBuf,
    pub allow_parse_error: bool,
    /// Dotted paths that must resolve in parsed JSON (version >= 1.3).
    pub output_require: Vec<String>,
    /// Minimal structural schema for parsed JSON (version >= 1.3).
    pub output_schema: Option<Value>,
}

/// What the pipeline observed for one stream.
#[derive(Debug, Default)]
pub struct CaptureOutcome {
    pub output: Option<String>,
    pub lines: Option<Vec<String>>,
    pub json: Option<Value>,
    pub truncated: bool,
    /// Set when the spill log was kept on disk.
    pub spilled: bool,
    pub total_bytes: u64,
    /// `invalid` or `overflow`; json mode only.
    pub json_parse_error: Option<String>,
    /// Set when `output_require`/`output_schema` rejected parsed output.
    pub contract_error: Option<String>,
}

impl CaptureOutcome {
    /// Last ~10 lines of whatever was captured, for error records.
    pub fn stdout_tail(&self) -> Vec<String> {
        match (&self.output, &self.lines) {
            (Some(text), _) => tail_lines(text, 10),
            (None, Some(lines)) => lines.iter().rev().take(10).rev().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The capture error this outcome implies, if any, honoring
    /// `allow_parse_error` downgrade semantics handled by the caller.
    pub fn capture_error(&self) -> Option<StepError> {
        if let Some(ref reason) = self.json_parse_error {
            return Some(
                StepError::new(
                    ErrorKind::Capture,
                    format!("JSON output could not be parsed ({reason})"),
                    EXIT_INVALID,
                )
                .with_context(json!({ "json_parse_error": { "reason": reason } })),
            );
        }
        if let Some(ref message) = self.contract_error {
            return Some(
                StepError::new(ErrorKind::Capture, message.clone(), EXIT_INVALID)
                    .with_context(json!({ "output_contract": message })),
            );
        }
        None
    }
}

/// Drain `reader` to completion, feeding all sinks. Returns once the stream
/// closes (child exit or kill).
pub async fn capture_stream<R>(mut reader: R, config: &CaptureConfig) -> std::io::Result<CaptureOutcome>
where
    R: AsyncRead + Unpin,
{
    if let Some(parent) = config.spill_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut spill = tokio::fs::File::create(&config.spill_path).await?;

    let mut output_file = match config.output_file {
        Some(ref path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            Some(tokio::fs::File::create(path).await?)
        }
        None => None,
    };

    let mut buffer: Vec<u8> = Vec::new();
    let mut total_bytes: u64 = 0;
    let mut newlines: usize = 0;
    let mut buffer_closed = false;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let bytes = &chunk[..n];
        total_bytes += n as u64;

        spill.write_all(bytes).await?;
        if let Some(ref mut file) = output_file {
            file.write_all(bytes).await?;
        }

        // Retain a bounded window of the stream head (+1 over each cap so
        // overflow is provable); the spill log always holds the full stream.
        if !buffer_closed {
            match config.mode {
                CaptureMode::Text => {
                    buffer_closed = extend_capped(&mut buffer, bytes, TEXT_CAP_BYTES + 1);
                }
                CaptureMode::Json => {
                    buffer_closed = extend_capped(&mut buffer, bytes, JSON_CAP_BYTES + 1);
                }
                CaptureMode::Lines => {
                    // The cap is an entry count: keep one byte past the
                    // LINES_CAP-th newline, with a byte backstop against
                    // streams made of very long lines.
                    for &byte in bytes {
                        if newlines >= LINES_CAP || buffer.len() >= LINES_BYTE_CAP {
                            buffer.push(byte);
                            buffer_closed = true;
                            break;
                        }
                        buffer.push(byte);
                        if byte == b'\n' {
                            newlines += 1;
                        }
                    }
                }
            }
        }
    }

    spill.flush().await?;
    if let Some(ref mut file) = output_file {
        file.flush().await?;
    }

    let mut outcome = finish(buffer, total_bytes, config);

    if outcome.truncated || outcome.json_parse_error.is_some() {
        outcome.spilled = true;
        debug!(spill = %config.spill_path.display(), total_bytes, "retaining stdout spill log");
    } else {
        drop(spill);
        if let Err(e) = tokio::fs::remove_file(&config.spill_path).await {
            warn!(spill = %config.spill_path.display(), error = %e, "failed to remove unused spill log");
        }
    }

    Ok(outcome)
}

/// Extend `buffer` with `bytes` up to `cap` total. Returns true once full.
fn extend_capped(buffer: &mut Vec<u8>, bytes: &[u8], cap: usize) -> bool {
    if buffer.len() < cap {
        let room = cap - buffer.len();
        buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
    buffer.len() >= cap
}

/// Parse the buffered head of the stream according to the capture mode.
fn finish(buffer: Vec<u8>, total_bytes: u64, config: &CaptureConfig) -> CaptureOutcome {
    let mut outcome = CaptureOutcome {
        total_bytes,
        ..CaptureOutcome::default()
    };

    match config.mode {
        CaptureMode::Text => {
            outcome.truncated = total_bytes > TEXT_CAP_BYTES as u64;
            let keep = buffer.len().min(TEXT_CAP_BYTES);
            outcome.output = Some(String::from_utf8_lossy(&buffer[..keep]).into_owned());
        }
        CaptureMode::Lines => {
            let text = normalize_crlf(&String::from_utf8_lossy(&buffer));
            let mut lines: Vec<String> = split_lines(&text);
            if lines.len() > LINES_CAP {
                outcome.truncated = true;
                lines.truncate(LINES_CAP);
            }
            // The in-memory window stopped before the stream did: bytes were
            // dropped from memory, never from the spill log.
            if total_bytes > buffer.len() as u64 {
                outcome.truncated = true;
            }
            outcome.lines = Some(lines);
        }
        CaptureMode::Json => {
            if total_bytes > JSON_CAP_BYTES as u64 {
                outcome.truncated = true;
                outcome.json_parse_error = Some("overflow".to_string());
                if config.allow_parse_error {
                    let keep = buffer.len().min(TEXT_CAP_BYTES);
                    outcome.output = Some(String::from_utf8_lossy(&buffer[..keep]).into_owned());
                }
            } else {
                match serde_json::from_slice::<Value>(&buffer) {
                    Ok(value) => {
                        if let Some(message) = check_output_contract(&value, config) {
                            outcome.contract_error = Some(message);
                        }
                        outcome.json = Some(value);
                    }
                    Err(e) => {
                        debug!(error = %e, "json capture parse failed");
                        outcome.json_parse_error = Some("invalid".to_string());
                        if config.allow_parse_error {
                            let keep = buffer.len().min(TEXT_CAP_BYTES);
                            outcome.output =
                                Some(String::from_utf8_lossy(&buffer[..keep]).into_owned());
                        }
                    }
                }
            }
        }
    }

    outcome
}

/// Validate `output_require` dotted paths and the minimal `output_schema`
/// contract against parsed output.
fn check_output_contract(value: &Value, config: &CaptureConfig) -> Option<String> {
    for path in &config.output_require {
        if walk_dotted(value, path).is_none() {
            return Some(format!("output_require path '{path}' did not resolve"));
        }
    }

    if let Some(ref schema) = config.output_schema {
        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            let actual = json_type_name(value);
            if expected != actual {
                return Some(format!(
                    "output_schema expected type '{expected}', found '{actual}'"
                ));
            }
        }
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if value.get(key).is_none() {
                    return Some(format!("output_schema required key '{key}' is missing"));
                }
            }
        }
    }

    None
}

fn walk_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `\r\n` is normalized to `\n` before splitting; entries never contain CRLF.
fn normalize_crlf(text: &str) -> String {
    text.replace("\r\n", "\n")
}

fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    // A trailing newline yields an empty final segment, not an extra line.
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// Last `n` lines of a text blob, for error tails.
pub fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines
        .iter()
        .rev()
        .take(n)
        .rev()
        .map(|s| s.to_string())
        .collect()
}
