//! For-each engine
//!
//! Resolves the iteration source, runs child steps in an isolated scope per
//! index, persists iteration results in index order, and applies the v1.2
//! per-item lifecycle action idempotently.

use eyre::Result;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::domain::run::{LifecycleRecord, LoopState, StepEntry, StepResult, StepStatus};
use crate::domain::workflow::{ForEachSpec, ItemsPointer, Lifecycle, PointerKind, Step};
use crate::dsl::version::Version;
use crate::error::{EXIT_CANCELLED, StepError};
use crate::paths;
use crate::vars::{Scope, coerce_to_string, substitute};

use super::{Disposition, Frames, Interpreter, SeqResult, sink_map_mut, step_label};

impl<'a> Interpreter<'a> {
    /// Execute a `for_each` step. Completed iterations (from a previous run)
    /// are skipped; results land at `steps.<Loop>[i].<Child>` in index
    /// order.
    pub(crate) async fn run_for_each(
        &mut self,
        step: &'a Step,
        spec: &'a ForEachSpec,
        frames: &Frames,
        base: &Scope,
    ) -> Result<Disposition> {
        let label = step_label(frames, &step.name);
        let loop_key = loop_state_key(frames, &step.name);

        // Items: recorded state wins on resume, then literals, then pointer.
        let recorded = self.state.doc.loops.get(&loop_key).cloned();
        let items: Vec<Value> = match (&recorded, &spec.items, &spec.items_from) {
            (Some(state), _, _) => state.items.clone(),
            (None, Some(literal), _) => literal.clone(),
            (None, None, Some(pointer)) => {
                match resolve_items_pointer(&self.sink_view(frames), pointer) {
                    Ok(items) => items,
                    Err(error) => {
                        let mut result = StepResult::pending();
                        result.start();
                        let exit_code = error.exit_code;
                        result.fail(error);
                        self.write_single(frames, &step.name, result)?;
                        return Ok(Disposition::Failure { exit_code });
                    }
                }
            }
            (None, None, None) => unreachable!("loader enforces an items source"),
        };

        let total = items.len();
        let mut loop_state = recorded.unwrap_or_else(|| LoopState {
            items: items.clone(),
            completed_indices: Vec::new(),
            current_index: 0,
        });
        info!(
            step = %label,
            total,
            completed = loop_state.completed_indices.len(),
            "for_each starting"
        );

        // The loop entry and its bookkeeping are visible even for an empty
        // items list.
        sink_map_mut(&mut self.state.doc.steps, frames)
            .entry(step.name.clone())
            .or_insert_with(|| StepEntry::Loop(Vec::new()));
        self.state
            .doc
            .loops
            .insert(loop_key.clone(), loop_state.clone());
        self.state.persist()?;

        for index in 0..total {
            if loop_state.completed_indices.contains(&index) {
                debug!(step = %label, index, "iteration already complete, skipping");
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(Disposition::Halt {
                    exit_code: EXIT_CANCELLED,
                });
            }

            loop_state.current_index = index;
            self.state
                .doc
                .loops
                .insert(loop_key.clone(), loop_state.clone());
            self.state.persist()?;

            // Loop scope: alias, index, total; merged over any outer loop.
            let mut loop_vars = Map::new();
            loop_vars.insert(spec.alias.clone(), items[index].clone());
            loop_vars.insert("index".to_string(), json!(index));
            loop_vars.insert("total".to_string(), json!(total));
            let iter_base = base.with_loop(loop_vars);

            let mut child_frames = frames.clone();
            child_frames.push((step.name.clone(), index));
            // Materialize the iteration slot so index order is stable even
            // for iterations whose first step fails early.
            sink_map_mut(&mut self.state.doc.steps, &child_frames);
            self.state.persist()?;

            let seq = self
                .run_sequence(&spec.steps, child_frames.clone(), iter_base.clone())
                .await?;

            if let SeqResult::Halt { exit_code } = seq {
                self.state.persist()?;
                return Ok(Disposition::Halt { exit_code });
            }

            let escaped = !matches!(seq, SeqResult::Finished);
            let iteration_success = !escaped && self.iteration_succeeded(&child_frames);

            if self.workflow.version >= Version::V1_2
                && let Some(ref lifecycle) = spec.lifecycle
            {
                let record = self.apply_lifecycle(
                    lifecycle,
                    iteration_success,
                    &items[index],
                    &iter_base,
                    &child_frames,
                );
                self.write_lifecycle(&child_frames, record)?;
            }

            match seq {
                SeqResult::Finished => {
                    loop_state.completed_indices.push(index);
                    self.state
                        .doc
                        .loops
                        .insert(loop_key.clone(), loop_state.clone());
                    self.state.persist()?;
                }
                SeqResult::EndRun => {
                    debug!(step = %label, index, "goto _end escaped the loop");
                    return Ok(Disposition::EndRun);
                }
                SeqResult::Escape { target } => {
                    debug!(step = %label, index, %target, "goto escaped the loop");
                    return Ok(Disposition::Escape { target });
                }
                SeqResult::Halt { .. } => unreachable!("handled above"),
            }
        }

        info!(step = %label, total, "for_each finished");
        Ok(Disposition::Success)
    }

    /// An iteration succeeded iff every executed child in its subtree ended
    /// with exit 0 (skipped steps count as 0).
    fn iteration_succeeded(&self, frames: &Frames) -> bool {
        fn all_zero(steps: &std::collections::BTreeMap<String, StepEntry>) -> bool {
            steps.values().all(|entry| match entry {
                StepEntry::Single(result) => {
                    matches!(result.status, StepStatus::Completed | StepStatus::Skipped)
                }
                StepEntry::Loop(iterations) => {
                    iterations.iter().all(|iteration| all_zero(&iteration.steps))
                }
            })
        }

        let mut current = &self.state.doc.steps;
        for (name, index) in frames {
            match current.get(name) {
                Some(StepEntry::Loop(iterations)) if *index < iterations.len() => {
                    current = &iterations[*index].steps;
                }
                _ => return false,
            }
        }
        all_zero(current)
    }

    /// Apply the matching lifecycle arm: substitute `move_to`, gate it, and
    /// relocate the originating task file. Already-applied actions (resume)
    /// are not repeated; a missing source records an error without changing
    /// the iteration outcome.
    fn apply_lifecycle(
        &mut self,
        lifecycle: &Lifecycle,
        success: bool,
        item: &Value,
        scope: &Scope,
        frames: &Frames,
    ) -> LifecycleRecord {
        let outcome = if success { "success" } else { "failure" };
        let action = if success {
            lifecycle.success.as_ref()
        } else {
            lifecycle.failure.as_ref()
        };

        let mut record = LifecycleRecord {
            outcome: outcome.to_string(),
            action_applied: false,
            moved_to: None,
            error: None,
        };

        let Some(action) = action else {
            return record;
        };

        if let Some(existing) = self.read_lifecycle(frames)
            && existing.action_applied
        {
            debug!("lifecycle action already applied, not repeating");
            return existing;
        }

        let destination = substitute(&action.move_to, scope);
        if !destination.unresolved.is_empty() {
            record.error = Some(format!(
                "move_to has undefined variables: {}",
                destination.unresolved.join(", ")
            ));
            return record;
        }

        let workspace = self.settings.workspace.clone();
        let dest_dir = match paths::safe_join(&workspace, &destination.text) {
            Ok(dir) => dir,
            Err(e) => {
                record.error = Some(format!("unsafe move_to '{}': {e}", destination.text));
                return record;
            }
        };

        let source_rel = coerce_to_string(item);
        let source = match paths::safe_join(&workspace, &source_rel) {
            Ok(path) => path,
            Err(e) => {
                record.error = Some(format!("unsafe item path '{source_rel}': {e}"));
                return record;
            }
        };

        if !source.exists() {
            warn!(source = %source_rel, "lifecycle source missing");
            record.error = Some(format!("source '{source_rel}' does not exist"));
            return record;
        }

        let file_name = match source.file_name() {
            Some(name) => name.to_os_string(),
            None => {
                record.error = Some(format!("item '{source_rel}' has no file name"));
                return record;
            }
        };
        let target = dest_dir.join(file_name);

        let moved = std::fs::create_dir_all(&dest_dir)
            .and_then(|_| std::fs::rename(&source, &target));
        match moved {
            Ok(()) => {
                let moved_to = paths::workspace_relative(&workspace, &target);
                info!(source = %source_rel, dest = %moved_to, "lifecycle moved task file");
                record.action_applied = true;
                record.moved_to = Some(moved_to);
            }
            Err(e) => {
                record.error = Some(format!("failed to move '{source_rel}': {e}"));
            }
        }
        record
    }

    fn read_lifecycle(&self, frames: &Frames) -> Option<LifecycleRecord> {
        let (last, prefix) = frames.split_last()?;
        let mut current = &self.state.doc.steps;
        for (name, index) in prefix {
            match current.get(name) {
                Some(StepEntry::Loop(iterations)) if *index < iterations.len() => {
                    current = &iterations[*index].steps;
                }
                _ => return None,
            }
        }
        match current.get(&last.0) {
            Some(StepEntry::Loop(iterations)) => {
                iterations.get(last.1).and_then(|i| i.lifecycle.clone())
            }
            _ => None,
        }
    }

    fn write_lifecycle(&mut self, frames: &Frames, record: LifecycleRecord) -> Result<()> {
        let Some((last, prefix)) = frames.split_last() else {
            return Ok(());
        };
        let parent = sink_map_mut(&mut self.state.doc.steps, prefix);
        if let Some(StepEntry::Loop(iterations)) = parent.get_mut(&last.0)
            && let Some(iteration) = iterations.get_mut(last.1)
        {
            iteration.lifecycle = Some(record);
        }
        self.state.persist()
    }
}

/// Dereference an `items_from` pointer against the scope's steps view. The
/// resolved value must be an array.
fn resolve_items_pointer(view: &Value, pointer: &ItemsPointer) -> Result<Vec<Value>, StepError> {
    let step_value = view.get(&pointer.step).ok_or_else(|| {
        StepError::invalid_reference(pointer.reference(), "step has no recorded result")
    })?;

    let mut current = match pointer.kind {
        PointerKind::Lines => step_value.get("lines"),
        PointerKind::Json => step_value.get("json"),
    }
    .ok_or_else(|| {
        StepError::invalid_reference(
            pointer.reference(),
            "step result has no value for this capture mode",
        )
    })?;

    for segment in &pointer.segments {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| {
            StepError::invalid_reference(
                pointer.reference(),
                format!("path segment '{segment}' did not resolve"),
            )
        })?;
    }

    match current {
        Value::Array(items) => Ok(items.clone()),
        other => Err(StepError::invalid_reference(
            pointer.reference(),
            format!("expected an array, found {}", type_label(other)),
        )),
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key for the run document's `loops` map; nested loops qualify with their
/// enclosing iteration path.
fn loop_state_key(frames: &[(String, usize)], name: &str) -> String {
    let mut key = String::new();
    for (frame_name, index) in frames {
        key.push_str(frame_name);
        key.push('.');
        key.push_str(&index.to_string());
        key.push('.');
    }
    key.push_str(name);
    key
}
