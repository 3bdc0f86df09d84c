//! Injection composer
//!
//! Builds the in-memory prompt delivered to a provider: the `input_file`
//! contents byte-for-byte (never substituted, never mutated on disk) plus an
//! optional injection block describing resolved dependencies. Content-mode
//! injection is capped; the cap is enforced mid-file so the budget is never
//! exceeded by the last file.

use serde_json::{Value, json};
use std::path::Path;
use tracing::debug;

use crate::deps::ResolvedDeps;
use crate::domain::workflow::{InjectMode, InjectPolicy, InjectPosition};
use crate::error::{EXIT_INVALID, ErrorKind, StepError};

/// Cumulative cap on injected file content.
pub const INJECT_CAP_BYTES: usize = 256 * 1024;

/// A composed prompt plus any truncation bookkeeping for the debug block.
#[derive(Debug, Default)]
pub struct ComposedPrompt {
    pub text: String,
    /// `truncation_details` for `debug.injection` when the cap was hit.
    pub truncation: Option<Value>,
}

/// Compose the prompt for one step. `input_file` is the absolute, already
/// path-gated location, or `None` when the step has no base prompt file.
pub fn compose_prompt(
    workspace: &Path,
    input_file: Option<&Path>,
    policy: Option<&InjectPolicy>,
    deps: &ResolvedDeps,
) -> Result<ComposedPrompt, StepError> {
    let base = match input_file {
        Some(path) => read_text(path, "input_file")?,
        None => String::new(),
    };

    let Some(policy) = policy else {
        return Ok(ComposedPrompt {
            text: base,
            truncation: None,
        });
    };

    let (block, truncation) = match policy.mode {
        InjectMode::None => (None, None),
        InjectMode::List => (Some(list_block(policy, deps)), None),
        InjectMode::Content => {
            let (block, truncation) = content_block(workspace, policy, deps)?;
            (Some(block), truncation)
        }
    };

    let text = match block {
        None => base,
        Some(block) => match policy.position {
            InjectPosition::Prepend => join_parts(&block, &base),
            InjectPosition::Append => join_parts(&base, &block),
        },
    };

    Ok(ComposedPrompt { text, truncation })
}

fn join_parts(first: &str, second: &str) -> String {
    if first.is_empty() {
        return second.to_string();
    }
    if second.is_empty() {
        return first.to_string();
    }
    format!("{first}\n\n{second}")
}

fn list_block(policy: &InjectPolicy, deps: &ResolvedDeps) -> String {
    let mut block = policy.instruction.clone();

    block.push_str("\n\nRequired:\n");
    for path in &deps.required {
        block.push_str("- ");
        block.push_str(path);
        block.push('\n');
    }

    if !deps.optional.is_empty() {
        block.push_str("\nOptional (if available):\n");
        for path in &deps.optional {
            block.push_str("- ");
            block.push_str(path);
            block.push('\n');
        }
    }

    block.trim_end().to_string()
}

fn content_block(
    workspace: &Path,
    policy: &InjectPolicy,
    deps: &ResolvedDeps,
) -> Result<(String, Option<Value>), StepError> {
    let mut block = policy.instruction.clone();
    block.push('\n');

    let files = deps.all();
    let mut budget = INJECT_CAP_BYTES;
    let mut total_size: u64 = 0;
    let mut shown_size: u64 = 0;
    let mut files_shown = 0u32;
    let mut files_truncated = 0u32;
    let mut files_omitted = 0u32;

    for relative in &files {
        let content = read_text(&workspace.join(relative), relative)?;
        let total = content.len();
        total_size += total as u64;

        if budget == 0 {
            files_omitted += 1;
            continue;
        }

        let shown = total.min(budget);
        let mut end = shown;
        // Never split inside a UTF-8 sequence.
        while end > 0 && !content.is_char_boundary(end) {
            end -= 1;
        }

        block.push_str(&format!("\n=== File: {relative} ({end}/{total}) ===\n"));
        block.push_str(&content[..end]);
        if !block.ends_with('\n') {
            block.push('\n');
        }

        shown_size += end as u64;
        budget -= end;
        files_shown += 1;
        if end < total {
            files_truncated += 1;
            debug!(file = %relative, shown = end, total, "injection cap hit mid-file");
        }
    }

    let truncation = if files_truncated > 0 || files_omitted > 0 {
        Some(json!({
            "total_size": total_size,
            "shown_size": shown_size,
            "files_shown": files_shown,
            "files_truncated": files_truncated,
            "files_omitted": files_omitted,
        }))
    } else {
        None
    };

    Ok((block.trim_end().to_string(), truncation))
}

fn read_text(path: &Path, label: &str) -> Result<String, StepError> {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| {
            StepError::new(
                ErrorKind::Dependency,
                format!("cannot read {label}: {e}"),
                EXIT_INVALID,
            )
        })
}
