//! Provider invocation assembly
//!
//! Turns a provider template plus step parameters into concrete argv and
//! stdin for the runner: parameter merge (step wins over template defaults),
//! variable substitution inside parameter values, then token substitution
//! over each argv element. `${PROMPT}` is only legal in argv mode; any
//! placeholder left after substitution fails the step.

use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::workflow::{InputMode, ProviderTemplate};
use crate::error::StepError;
use crate::vars::{Scope, coerce_to_string, substitute_in_value, substitute_with};

/// Assembled child invocation for a provider step.
#[derive(Debug, Clone)]
pub struct ProviderInvocation {
    pub argv: Vec<String>,
    /// The composed prompt when the template takes stdin input.
    pub stdin: Option<String>,
}

/// Build the invocation. `prompt` is the composed prompt from the injection
/// composer; `params` are the step's `provider_params`.
pub fn build_invocation(
    template: &ProviderTemplate,
    params: &Map<String, Value>,
    scope: &Scope,
    prompt: &str,
) -> Result<ProviderInvocation, StepError> {
    // Template defaults overlaid by step params; the step wins.
    let mut merged = template.defaults.clone();
    for (key, value) in params {
        merged.insert(key.clone(), value.clone());
    }

    // Variables inside parameter values (strings only; arrays/objects are
    // walked recursively).
    let (merged, mut unresolved) = substitute_in_value(&Value::Object(merged), scope);
    let merged = merged.as_object().cloned().unwrap_or_default();

    let mut invalid_prompt = false;
    let mut argv = Vec::with_capacity(template.argv.len());
    for token in &template.argv {
        let substituted = substitute_with(token, |key| {
            if key == "PROMPT" {
                return match template.input_mode {
                    InputMode::Argv => Some(prompt.to_string()),
                    InputMode::Stdin => {
                        invalid_prompt = true;
                        // Leave the token in place; the error below wins.
                        None
                    }
                };
            }
            if let Some(value) = merged.get(key) {
                return Some(coerce_to_string(value));
            }
            scope.resolve(key).map(|v| coerce_to_string(&v))
        });
        if invalid_prompt {
            return Err(StepError::invalid_prompt_placeholder());
        }
        unresolved.extend(
            substituted
                .unresolved
                .into_iter()
                .filter(|key| key != "PROMPT"),
        );
        argv.push(substituted.text);
    }

    if !unresolved.is_empty() {
        unresolved.dedup();
        debug!(?unresolved, "provider invocation has unresolved placeholders");
        return Err(StepError::missing_placeholders(unresolved));
    }

    Ok(ProviderInvocation {
        stdin: match template.input_mode {
            InputMode::Stdin => Some(prompt.to_string()),
            InputMode::Argv => None,
        },
        argv,
    })
}
