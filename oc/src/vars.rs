//! Variable evaluator
//!
//! Single-pass `${key.path}` substitution over four namespaces: `run`,
//! `context`, `loop`, `steps`. Escapes are applied in the same pass: `$$`
//! yields a literal `$` and therefore `$${` yields a literal `${` that is
//! never treated as a placeholder. Undefined references are left in place and
//! reported; callers decide whether unresolved is fatal.

use serde_json::{Map, Value};
use tracing::debug;

/// Immutable variable scope. Loop and step layers are added with the
/// `with_*` builders, which return a new scope; parent scopes are never
/// mutated from inside a loop.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    run: Map<String, Value>,
    context: Map<String, Value>,
    loop_vars: Option<Map<String, Value>>,
    steps: Option<Value>,
}

impl Scope {
    /// Base scope: `run.*` metadata plus the frozen `context.*` map.
    pub fn new(run: Map<String, Value>, context: Map<String, Value>) -> Self {
        Self {
            run,
            context,
            loop_vars: None,
            steps: None,
        }
    }

    /// Layer loop variables (alias, `index`, `total`) onto this scope. For
    /// nested loops the inner variables are merged over the outer ones, so a
    /// differently-named outer alias stays visible while `index`/`total`
    /// shadow.
    pub fn with_loop(&self, loop_vars: Map<String, Value>) -> Self {
        let mut scope = self.clone();
        let mut merged = scope.loop_vars.take().unwrap_or_default();
        merged.extend(loop_vars);
        scope.loop_vars = Some(merged);
        scope
    }

    /// Layer the `steps.*` view (a JSON object of step results) onto this
    /// scope.
    pub fn with_steps(&self, steps: Value) -> Self {
        let mut scope = self.clone();
        scope.steps = Some(steps);
        scope
    }

    /// Resolve a dotted key like `steps.Review.json.approved`. The first
    /// segment names the namespace; the rest walks objects by field and
    /// arrays by integer index. Returns `None` for undefined references,
    /// including anything outside the four namespaces.
    pub fn resolve(&self, key: &str) -> Option<Value> {
        let (namespace, rest) = match key.split_once('.') {
            Some((ns, rest)) => (ns, Some(rest)),
            None => (key, None),
        };

        let root = match namespace {
            "run" => Value::Object(self.run.clone()),
            "context" => Value::Object(self.context.clone()),
            "loop" => Value::Object(self.loop_vars.clone()?),
            "steps" => self.steps.clone()?,
            _ => return None,
        };

        match rest {
            None => Some(root),
            Some(path) => walk_path(&root, path),
        }
    }
}

/// Result of substituting one string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substituted {
    pub text: String,
    /// Bare keys of placeholders that did not resolve, in encounter order.
    pub unresolved: Vec<String>,
}

impl Substituted {
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Substitute `${...}` tokens in `input` against `scope`, left to right in a
/// single pass. Unterminated `${` is copied through literally.
pub fn substitute(input: &str, scope: &Scope) -> Substituted {
    substitute_with(input, |key| scope.resolve(key).map(|v| coerce_to_string(&v)))
}

/// Substitution with a custom resolver. The runner uses this to overlay
/// provider parameters and `${PROMPT}` on top of the scope namespaces.
pub fn substitute_with<F>(input: &str, mut resolve: F) -> Substituted
where
    F: FnMut(&str) -> Option<String>,
{
    let mut text = String::with_capacity(input.len());
    let mut unresolved = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$$") {
            // Escape: $$ -> $. A following '{' is copied literally on the
            // next round, so $${ never opens a placeholder.
            text.push('$');
            rest = after;
        } else if let Some(after) = rest.strip_prefix("${") {
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match resolve(key) {
                        Some(value) => text.push_str(&value),
                        None => {
                            debug!(key, "placeholder did not resolve");
                            text.push_str("${");
                            text.push_str(key);
                            text.push('}');
                            unresolved.push(key.to_string());
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    text.push_str(rest);
                    break;
                }
            }
        } else {
            let ch = rest.chars().next().expect("non-empty");
            text.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }

    Substituted { text, unresolved }
}

/// Recursively substitute string leaves of a JSON value. Arrays and objects
/// are walked; other scalars pass through unchanged.
pub fn substitute_in_value(value: &Value, scope: &Scope) -> (Value, Vec<String>) {
    let mut unresolved = Vec::new();
    let out = substitute_value_inner(value, scope, &mut unresolved);
    (out, unresolved)
}

fn substitute_value_inner(value: &Value, scope: &Scope, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => {
            let result = substitute(s, scope);
            unresolved.extend(result.unresolved);
            Value::String(result.text)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value_inner(item, scope, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value_inner(v, scope, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// String coercion used both for substitution output and for `when.equals`
/// comparison: scalars render in their display form (`true`, `42`),
/// compound values as compact JSON.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        compound => serde_json::to_string(compound).unwrap_or_default(),
    }
}

fn walk_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
