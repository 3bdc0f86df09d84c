//! Workflow loading and strict validation
//!
//! Reads the YAML document, digests the raw bytes for the workflow checksum,
//! then walks the raw tree applying every cross-field rule: mutual
//! exclusivity of step kinds, per-scope name uniqueness, goto target
//! resolution, version gates, deprecated fields, the `${env.*}` ban, and the
//! path safety gate over declared paths. The output is the immutable
//! [`Workflow`].

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

use crate::capture::CaptureMode;
use crate::domain::workflow::{
    Condition, DEFAULT_LOOP_ALIAS, DependsOn, ForEachSpec, GOTO_END, Handlers, InjectMode,
    InjectPolicy, InjectPosition, InputMode, ItemsPointer, Lifecycle, LifecycleAction,
    ProviderTemplate, QueueDefaults, RetryPolicy, Step, StepKind, WAIT_DEFAULT_MIN_COUNT,
    WAIT_DEFAULT_POLL_MS, WAIT_DEFAULT_TIMEOUT_SEC, WaitSpec, Workflow,
};
use crate::dsl::schema::{
    RawCaptureMode, RawForEach, RawInject, RawInjectMode, RawInjectPosition, RawInputMode, RawStep,
    RawWhen, RawWorkflow,
};
use crate::dsl::version::Version;
use crate::error::ValidationError;
use crate::paths;
use crate::vars;

/// Hex SHA-256 of the workflow file bytes.
pub fn checksum_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Load and validate a workflow file.
pub fn load_workflow(path: &Path, workspace: &Path) -> Result<Workflow, ValidationError> {
    debug!(path = %path.display(), "loading workflow");
    let bytes = std::fs::read(path)?;
    let checksum = checksum_hex(&bytes);
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let mut workflow = load_workflow_str(&text, checksum, workspace)?;
    workflow.source_path = paths::workspace_relative(workspace, path);
    info!(name = %workflow.name, version = %workflow.version, steps = workflow.steps.len(), "workflow loaded");
    Ok(workflow)
}

/// Validate workflow text that was already read (and digested) by the caller.
pub fn load_workflow_str(
    text: &str,
    checksum: String,
    workspace: &Path,
) -> Result<Workflow, ValidationError> {
    let raw: RawWorkflow = serde_yaml::from_str(text)?;

    let version: Version = raw
        .version
        .parse()
        .map_err(|_| ValidationError::UnsupportedVersion {
            version: raw.version.clone(),
        })?;
    if !version.is_supported() {
        return Err(ValidationError::UnsupportedVersion {
            version: raw.version.clone(),
        });
    }

    if raw.steps.is_empty() {
        return Err(ValidationError::Workflow(format!(
            "workflow '{}' must declare at least one step",
            raw.name
        )));
    }

    let providers = convert_providers(&raw)?;

    let queues = convert_queues(&raw, workspace)?;

    for (key, value) in &raw.context {
        check_env_refs_value(value, &format!("context.{key}"))?;
    }

    let cx = StepContext {
        version,
        providers: &providers,
        workspace,
    };
    let steps = convert_steps(raw.steps, "top-level steps", &[], &cx)?;

    Ok(Workflow {
        version,
        name: raw.name,
        strict_flow: raw.strict_flow.unwrap_or(true),
        providers,
        queues,
        context: raw.context,
        steps,
        checksum,
        source_path: "workflow.yaml".to_string(),
    })
}

struct StepContext<'a> {
    version: Version,
    providers: &'a BTreeMap<String, ProviderTemplate>,
    workspace: &'a Path,
}

fn convert_providers(raw: &RawWorkflow) -> Result<BTreeMap<String, ProviderTemplate>, ValidationError> {
    let mut providers = BTreeMap::new();
    for (name, provider) in &raw.providers {
        let input_mode = match provider.input_mode {
            Some(RawInputMode::Stdin) => InputMode::Stdin,
            Some(RawInputMode::Argv) | None => InputMode::Argv,
        };

        if input_mode == InputMode::Stdin && template_mentions_prompt(&provider.template) {
            return Err(ValidationError::PromptInStdinTemplate {
                provider: name.clone(),
            });
        }
        for (i, token) in provider.template.iter().enumerate() {
            check_env_refs(token, &format!("providers.{name}.template[{i}]"))?;
        }
        check_env_refs_value(
            &Value::Object(provider.defaults.clone()),
            &format!("providers.{name}.defaults"),
        )?;

        providers.insert(
            name.clone(),
            ProviderTemplate {
                argv: provider.template.clone(),
                input_mode,
                defaults: provider.defaults.clone(),
            },
        );
    }
    Ok(providers)
}

fn convert_queues(raw: &RawWorkflow, workspace: &Path) -> Result<QueueDefaults, ValidationError> {
    let mut queues = QueueDefaults::default();
    if let Some(ref declared) = raw.queues {
        if let Some(ref inbox) = declared.inbox {
            queues.inbox = inbox.clone();
        }
        if let Some(ref processed) = declared.processed {
            queues.processed = processed.clone();
        }
        if let Some(ref failed) = declared.failed {
            queues.failed = failed.clone();
        }
    }
    check_path("queues.inbox", &queues.inbox, workspace)?;
    check_path("queues.processed", &queues.processed, workspace)?;
    check_path("queues.failed", &queues.failed, workspace)?;
    Ok(queues)
}

/// Recursively convert and validate a step list. `outer_names` carries the
/// step names of enclosing scopes so a nested goto may target them.
fn convert_steps(
    raw_steps: Vec<RawStep>,
    scope: &str,
    outer_names: &[BTreeSet<String>],
    cx: &StepContext<'_>,
) -> Result<Vec<Step>, ValidationError> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for raw in &raw_steps {
        if raw.name.trim().is_empty() {
            return Err(ValidationError::Workflow(format!(
                "{scope}: step names must be non-empty"
            )));
        }
        if !names.insert(raw.name.clone()) {
            return Err(ValidationError::DuplicateStep {
                step: raw.name.clone(),
                scope: scope.to_string(),
            });
        }
    }

    let mut goto_targets: BTreeSet<String> = names.clone();
    for outer in outer_names {
        goto_targets.extend(outer.iter().cloned());
    }
    goto_targets.insert(GOTO_END.to_string());

    let mut chain: Vec<BTreeSet<String>> = outer_names.to_vec();
    chain.push(names);

    raw_steps
        .into_iter()
        .map(|raw| convert_step(raw, &goto_targets, &chain, cx))
        .collect()
}

fn convert_step(
    raw: RawStep,
    goto_targets: &BTreeSet<String>,
    scope_chain: &[BTreeSet<String>],
    cx: &StepContext<'_>,
) -> Result<Step, ValidationError> {
    let name = raw.name.clone();

    if raw.command_override.is_some() {
        return Err(ValidationError::Deprecated {
            step: name,
            field: "command_override".to_string(),
        });
    }

    let kind_count = [
        raw.provider.is_some(),
        raw.command.is_some(),
        raw.wait_for.is_some(),
        raw.for_each.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if kind_count != 1 {
        return Err(ValidationError::StepKind { step: name });
    }

    if raw.provider_params.is_some() && raw.provider.is_none() {
        return Err(ValidationError::Step {
            step: name,
            message: "provider_params requires provider".to_string(),
        });
    }

    // Version gates
    if let Some(ref depends) = raw.depends_on
        && depends.inject.is_some()
        && cx.version < Version::V1_1_1
    {
        return Err(ValidationError::VersionGated {
            step: name,
            field: "depends_on.inject".to_string(),
            required: Version::V1_1_1.to_string(),
        });
    }
    if let Some(ref for_each) = raw.for_each
        && for_each.on_item_complete.is_some()
        && cx.version < Version::V1_2
    {
        return Err(ValidationError::VersionGated {
            step: name,
            field: "for_each.on_item_complete".to_string(),
            required: Version::V1_2.to_string(),
        });
    }
    if (raw.output_schema.is_some() || raw.output_require.is_some()) && cx.version < Version::V1_3 {
        return Err(ValidationError::VersionGated {
            step: name,
            field: "output_schema/output_require".to_string(),
            required: Version::V1_3.to_string(),
        });
    }
    if raw.allow_parse_error.unwrap_or(false)
        && (raw.output_schema.is_some() || raw.output_require.is_some())
    {
        return Err(ValidationError::Step {
            step: name,
            message: "allow_parse_error is incompatible with output_schema/output_require".to_string(),
        });
    }

    // Branch targets
    let handlers = match raw.on {
        Some(on) => {
            let mut handlers = Handlers::default();
            for (label, handler) in [
                ("success", on.success),
                ("failure", on.failure),
                ("always", on.always),
            ] {
                if let Some(handler) = handler {
                    if !goto_targets.contains(&handler.goto) {
                        return Err(ValidationError::UnknownGoto {
                            step: name,
                            target: handler.goto,
                        });
                    }
                    match label {
                        "success" => handlers.success = Some(handler.goto),
                        "failure" => handlers.failure = Some(handler.goto),
                        _ => handlers.always = Some(handler.goto),
                    }
                }
            }
            handlers
        }
        None => Handlers::default(),
    };

    let when = convert_when(raw.when, &name)?;

    // env namespace ban and path gate over declared strings
    if let Some(ref command) = raw.command {
        check_env_refs(command, &format!("step '{name}' command"))?;
    }
    if let Some(ref input_file) = raw.input_file {
        check_env_refs(input_file, &format!("step '{name}' input_file"))?;
        check_path(&format!("step '{name}' input_file"), input_file, cx.workspace)?;
    }
    if let Some(ref output_file) = raw.output_file {
        check_env_refs(output_file, &format!("step '{name}' output_file"))?;
        check_path(&format!("step '{name}' output_file"), output_file, cx.workspace)?;
    }
    if let Some(ref env) = raw.env {
        for (key, value) in env {
            check_env_refs(value, &format!("step '{name}' env.{key}"))?;
        }
    }
    if let Some(ref params) = raw.provider_params {
        check_env_refs_value(
            &Value::Object(params.clone()),
            &format!("step '{name}' provider_params"),
        )?;
    }

    let depends_on = convert_depends_on(raw.depends_on, &name)?;
    for (which, patterns) in [
        ("required", &depends_on.required),
        ("optional", &depends_on.optional),
    ] {
        for pattern in patterns {
            check_env_refs(pattern, &format!("step '{name}' depends_on.{which}"))?;
            paths::check_lexical(pattern).map_err(|e| ValidationError::UnsafePath {
                location: format!("step '{name}' depends_on.{which}"),
                path: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    let kind = if let Some(command) = raw.command {
        StepKind::Command { command }
    } else if let Some(provider) = raw.provider {
        if !cx.providers.contains_key(&provider) {
            return Err(ValidationError::UnknownProvider { step: name, provider });
        }
        StepKind::Provider {
            provider,
            params: raw.provider_params.unwrap_or_default(),
        }
    } else if let Some(wait) = raw.wait_for {
        check_env_refs(&wait.glob, &format!("step '{name}' wait_for.glob"))?;
        paths::check_lexical(&wait.glob).map_err(|e| ValidationError::UnsafePath {
            location: format!("step '{name}' wait_for.glob"),
            path: wait.glob.clone(),
            reason: e.to_string(),
        })?;
        StepKind::Wait(WaitSpec {
            glob: wait.glob,
            timeout_sec: wait.timeout_sec.unwrap_or(WAIT_DEFAULT_TIMEOUT_SEC),
            poll_ms: wait.poll_ms.unwrap_or(WAIT_DEFAULT_POLL_MS),
            min_count: wait.min_count.unwrap_or(WAIT_DEFAULT_MIN_COUNT),
        })
    } else {
        let for_each = raw.for_each.expect("kind count checked");
        StepKind::ForEach(convert_for_each(for_each, &name, scope_chain, cx)?)
    };

    Ok(Step {
        name,
        kind,
        input_file: raw.input_file,
        output_file: raw.output_file,
        capture: match raw.output_capture {
            Some(RawCaptureMode::Lines) => CaptureMode::Lines,
            Some(RawCaptureMode::Json) => CaptureMode::Json,
            Some(RawCaptureMode::Text) | None => CaptureMode::Text,
        },
        allow_parse_error: raw.allow_parse_error.unwrap_or(false),
        output_require: raw.output_require.unwrap_or_default(),
        output_schema: raw.output_schema,
        env: raw.env.unwrap_or_default(),
        secrets: raw.secrets.unwrap_or_default(),
        depends_on,
        timeout_sec: raw.timeout_sec,
        retries: raw.retries.map(|r| RetryPolicy {
            max: r.max,
            delay_ms: r.delay_ms,
        }),
        when,
        handlers,
    })
}

fn convert_when(raw: Option<RawWhen>, step: &str) -> Result<Option<Condition>, ValidationError> {
    let Some(when) = raw else { return Ok(None) };

    let variants = [
        when.equals.is_some(),
        when.exists.is_some(),
        when.not_exists.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if variants != 1 {
        return Err(ValidationError::Step {
            step: step.to_string(),
            message: "when must set exactly one of equals, exists, not_exists".to_string(),
        });
    }

    if let Some(equals) = when.equals {
        check_env_refs(&equals.left, &format!("step '{step}' when.equals.left"))?;
        check_env_refs(&equals.right, &format!("step '{step}' when.equals.right"))?;
        return Ok(Some(Condition::Equals {
            left: equals.left,
            right: equals.right,
        }));
    }
    if let Some(glob) = when.exists {
        check_env_refs(&glob, &format!("step '{step}' when.exists"))?;
        return Ok(Some(Condition::Exists { glob }));
    }
    let glob = when.not_exists.expect("variant count checked");
    check_env_refs(&glob, &format!("step '{step}' when.not_exists"))?;
    Ok(Some(Condition::NotExists { glob }))
}

fn convert_depends_on(
    raw: Option<crate::dsl::schema::RawDependsOn>,
    step: &str,
) -> Result<DependsOn, ValidationError> {
    let Some(depends) = raw else {
        return Ok(DependsOn::default());
    };

    let inject = match depends.inject {
        None | Some(RawInject::Flag(false)) => None,
        Some(RawInject::Flag(true)) => Some(InjectPolicy::shorthand()),
        Some(RawInject::Policy(policy)) => {
            let mode = match policy.mode {
                Some(RawInjectMode::Content) => InjectMode::Content,
                Some(RawInjectMode::None) => InjectMode::None,
                Some(RawInjectMode::List) | None => InjectMode::List,
            };
            let position = match policy.position {
                Some(RawInjectPosition::Append) => InjectPosition::Append,
                Some(RawInjectPosition::Prepend) | None => InjectPosition::Prepend,
            };
            let shorthand = InjectPolicy::shorthand();
            check_env_refs(
                policy.instruction.as_deref().unwrap_or_default(),
                &format!("step '{step}' depends_on.inject.instruction"),
            )?;
            Some(InjectPolicy {
                mode,
                position,
                instruction: policy.instruction.unwrap_or(shorthand.instruction),
            })
        }
    };

    Ok(DependsOn {
        required: depends.required,
        optional: depends.optional,
        inject,
    })
}

fn convert_for_each(
    raw: RawForEach,
    step: &str,
    scope_chain: &[BTreeSet<String>],
    cx: &StepContext<'_>,
) -> Result<ForEachSpec, ValidationError> {
    match (&raw.items, &raw.items_from) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(ValidationError::Step {
                step: step.to_string(),
                message: "for_each must set exactly one of items, items_from".to_string(),
            });
        }
        _ => {}
    }

    let items_from = raw
        .items_from
        .as_deref()
        .map(ItemsPointer::parse)
        .transpose()
        .map_err(|message| ValidationError::Step {
            step: step.to_string(),
            message: format!("items_from: {message}"),
        })?;

    if raw.steps.is_empty() {
        return Err(ValidationError::Step {
            step: step.to_string(),
            message: "for_each must declare at least one child step".to_string(),
        });
    }

    let lifecycle = match raw.on_item_complete {
        None => None,
        Some(lifecycle) => {
            let mut convert = |action: Option<crate::dsl::schema::RawLifecycleAction>,
                               arm: &str|
             -> Result<Option<LifecycleAction>, ValidationError> {
                match action {
                    None => Ok(None),
                    Some(action) => {
                        let location = format!("step '{step}' on_item_complete.{arm}.move_to");
                        check_env_refs(&action.move_to, &location)?;
                        paths::check_lexical(&action.move_to).map_err(|e| {
                            ValidationError::UnsafePath {
                                location,
                                path: action.move_to.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                        Ok(Some(LifecycleAction {
                            move_to: action.move_to,
                        }))
                    }
                }
            };
            Some(Lifecycle {
                success: convert(lifecycle.success, "success")?,
                failure: convert(lifecycle.failure, "failure")?,
            })
        }
    };

    let children = convert_steps(raw.steps, &format!("for_each '{step}'"), scope_chain, cx)?;

    Ok(ForEachSpec {
        items: raw.items,
        items_from,
        alias: raw.alias.unwrap_or_else(|| DEFAULT_LOOP_ALIAS.to_string()),
        steps: children,
        lifecycle,
    })
}

fn template_mentions_prompt(argv: &[String]) -> bool {
    argv.iter().any(|token| {
        let mut found = false;
        vars::substitute_with(token, |key| {
            if key == "PROMPT" {
                found = true;
            }
            None
        });
        found
    })
}

/// Reject any `${env.*}` reference, respecting `$$` escapes.
fn check_env_refs(text: &str, location: &str) -> Result<(), ValidationError> {
    let mut bad: Option<String> = None;
    vars::substitute_with(text, |key| {
        if (key == "env" || key.starts_with("env.")) && bad.is_none() {
            bad = Some(format!("${{{key}}}"));
        }
        None
    });
    match bad {
        Some(token) => Err(ValidationError::EnvReference {
            token,
            location: location.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_env_refs_value(value: &Value, location: &str) -> Result<(), ValidationError> {
    match value {
        Value::String(s) => check_env_refs(s, location),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_env_refs_value(item, &format!("{location}[{i}]"))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_env_refs_value(item, &format!("{location}.{key}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Path gate at load time. Declared paths still holding placeholders get the
/// lexical checks only; literal paths get full symlink resolution.
fn check_path(location: &str, value: &str, workspace: &Path) -> Result<(), ValidationError> {
    let result = if value.contains("${") {
        paths::check_lexical(value)
    } else {
        paths::safe_join(workspace, value).map(|_| ())
    };
    result.map_err(|e| ValidationError::UnsafePath {
        location: location.to_string(),
        path: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load(yaml: &str) -> Result<Workflow, ValidationError> {
        let temp = tempdir().unwrap();
        load_workflow_str(yaml, checksum_hex(yaml.as_bytes()), temp.path())
    }

    const MINIMAL: &str = r#"
version: "1.1"
name: smoke
steps:
  - name: Hello
    command: echo hello
"#;

    #[test]
    fn test_minimal_loads() {
        let workflow = load(MINIMAL).unwrap();
        assert_eq!(workflow.name, "smoke");
        assert!(workflow.strict_flow);
        assert_eq!(workflow.steps.len(), 1);
        assert!(matches!(workflow.steps[0].kind, StepKind::Command { .. }));
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum_hex(b"abc"), checksum_hex(b"abc"));
        assert_ne!(checksum_hex(b"abc"), checksum_hex(b"abd"));
        assert_eq!(checksum_hex(b"abc").len(), 64);
    }

    #[test]
    fn test_rejects_two_kinds() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Both
    command: echo hi
    wait_for:
      glob: "inbox/*.task"
"#;
        assert!(matches!(load(yaml), Err(ValidationError::StepKind { .. })));
    }

    #[test]
    fn test_rejects_no_kind() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Nothing
    timeout_sec: 5
"#;
        assert!(matches!(load(yaml), Err(ValidationError::StepKind { .. })));
    }

    #[test]
    fn test_rejects_deprecated_command_override() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Old
    command: echo hi
    command_override: echo bye
"#;
        assert!(matches!(load(yaml), Err(ValidationError::Deprecated { .. })));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Same
    command: echo one
  - name: Same
    command: echo two
"#;
        assert!(matches!(load(yaml), Err(ValidationError::DuplicateStep { .. })));
    }

    #[test]
    fn test_goto_targets_resolved() {
        let yaml = r#"
version: "1.1"
name: flow
steps:
  - name: First
    command: echo one
    on:
      failure:
        goto: Recover
  - name: Recover
    command: echo two
    on:
      success:
        goto: _end
"#;
        let workflow = load(yaml).unwrap();
        assert_eq!(workflow.steps[0].handlers.failure.as_deref(), Some("Recover"));
    }

    #[test]
    fn test_rejects_unknown_goto() {
        let yaml = r#"
version: "1.1"
name: flow
steps:
  - name: First
    command: echo one
    on:
      failure:
        goto: Nowhere
"#;
        assert!(matches!(load(yaml), Err(ValidationError::UnknownGoto { .. })));
    }

    #[test]
    fn test_inject_gated_below_1_1_1() {
        let yaml = r#"
version: "1.1"
name: gated
steps:
  - name: Build
    command: echo hi
    depends_on:
      required: ["data/*.csv"]
      inject: true
"#;
        assert!(matches!(load(yaml), Err(ValidationError::VersionGated { .. })));
    }

    #[test]
    fn test_inject_allowed_at_1_1_1() {
        let yaml = r#"
version: "1.1.1"
name: gated
steps:
  - name: Build
    command: echo hi
    depends_on:
      required: ["data/*.csv"]
      inject: true
"#;
        let workflow = load(yaml).unwrap();
        let inject = workflow.steps[0].depends_on.inject.as_ref().unwrap();
        assert_eq!(*inject, InjectPolicy::shorthand());
    }

    #[test]
    fn test_on_item_complete_gated_below_1_2() {
        let yaml = r#"
version: "1.1.1"
name: gated
steps:
  - name: Process
    for_each:
      items: ["a", "b"]
      steps:
        - name: Impl
          command: echo x
      on_item_complete:
        success:
          move_to: processed
"#;
        assert!(matches!(load(yaml), Err(ValidationError::VersionGated { .. })));
    }

    #[test]
    fn test_output_schema_gated_below_1_3() {
        let yaml = r#"
version: "1.2"
name: gated
steps:
  - name: Scan
    command: echo '{}'
    output_capture: json
    output_require: ["approved"]
"#;
        assert!(matches!(load(yaml), Err(ValidationError::VersionGated { .. })));
    }

    #[test]
    fn test_output_require_incompatible_with_allow_parse_error() {
        let yaml = r#"
version: "1.3"
name: bad
steps:
  - name: Scan
    command: echo '{}'
    output_capture: json
    allow_parse_error: true
    output_require: ["approved"]
"#;
        assert!(matches!(load(yaml), Err(ValidationError::Step { .. })));
    }

    #[test]
    fn test_rejects_env_namespace() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Leak
    command: echo ${env.HOME}
"#;
        assert!(matches!(load(yaml), Err(ValidationError::EnvReference { .. })));
    }

    #[test]
    fn test_escaped_env_reference_is_fine() {
        let yaml = r#"
version: "1.1"
name: ok
steps:
  - name: Literal
    command: echo $${env.HOME}
"#;
        assert!(load(yaml).is_ok());
    }

    #[test]
    fn test_rejects_parent_escape_input_file() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Read
    command: cat
    input_file: "../outside.txt"
"#;
        let err = load(yaml).unwrap_err();
        match err {
            ValidationError::UnsafePath { location, .. } => {
                assert!(location.contains("input_file"));
            }
            other => panic!("expected UnsafePath, got {other}"),
        }
    }

    #[test]
    fn test_rejects_prompt_in_stdin_template() {
        let yaml = r#"
version: "1.1"
name: bad
providers:
  llm:
    template: ["llm", "${PROMPT}"]
    input_mode: stdin
steps:
  - name: Ask
    provider: llm
"#;
        assert!(matches!(
            load(yaml),
            Err(ValidationError::PromptInStdinTemplate { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Ask
    provider: nonexistent
"#;
        assert!(matches!(load(yaml), Err(ValidationError::UnknownProvider { .. })));
    }

    #[test]
    fn test_nested_goto_may_target_outer() {
        let yaml = r#"
version: "1.2"
name: loops
steps:
  - name: Process
    for_each:
      items: ["a"]
      steps:
        - name: Impl
          command: echo x
          on:
            failure:
              goto: Cleanup
  - name: Cleanup
    command: echo done
"#;
        assert!(load(yaml).is_ok());
    }

    #[test]
    fn test_sibling_scopes_may_reuse_names() {
        let yaml = r#"
version: "1.2"
name: loops
steps:
  - name: First
    for_each:
      items: ["a"]
      steps:
        - name: Impl
          command: echo x
  - name: Second
    for_each:
      items: ["b"]
      steps:
        - name: Impl
          command: echo y
"#;
        assert!(load(yaml).is_ok());
    }

    #[test]
    fn test_for_each_requires_one_source() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Process
    for_each:
      items: ["a"]
      items_from: "steps.List.lines"
      steps:
        - name: Impl
          command: echo x
"#;
        assert!(matches!(load(yaml), Err(ValidationError::Step { .. })));
    }

    #[test]
    fn test_when_requires_single_variant() {
        let yaml = r#"
version: "1.1"
name: bad
steps:
  - name: Guarded
    command: echo x
    when:
      exists: "a/*.txt"
      not_exists: "b/*.txt"
"#;
        assert!(matches!(load(yaml), Err(ValidationError::Step { .. })));
    }

    #[test]
    fn test_wait_defaults_applied() {
        let yaml = r#"
version: "1.1"
name: waits
steps:
  - name: Wait
    wait_for:
      glob: "inbox/qa/*.json"
"#;
        let workflow = load(yaml).unwrap();
        match &workflow.steps[0].kind {
            StepKind::Wait(spec) => {
                assert_eq!(spec.timeout_sec, 300);
                assert_eq!(spec.poll_ms, 500);
                assert_eq!(spec.min_count, 1);
            }
            other => panic!("expected wait, got {}", other.label()),
        }
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = r#"
version: "2.0"
name: future
steps:
  - name: Hello
    command: echo hi
"#;
        assert!(matches!(
            load(yaml),
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }
}
