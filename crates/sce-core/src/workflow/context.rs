//! Variable lookup, prompt interpolation and node input construction.
//!
//! These helpers read the instance variable set without mutating it. The
//! variable set itself lives in `ExecutionContext` (sce-types), owned by the
//! running instance.

use serde_json::Value;

use sce_types::execution::Variables;
use sce_types::workflow::WorkflowNode;

/// Resolve a dotted path (`order.customer.email`) against the variables.
///
/// Array elements can be addressed by numeric segments (`items.0.sku`).
pub fn lookup_path<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = variables.get(first.trim())?;
    for segment in segments {
        let segment = segment.trim();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replace `{{name}}` and `{{ dotted.path }}` markers with variable values.
///
/// Strings are inserted without quotes, everything else as compact JSON.
/// Unknown references are left as-is (not an error).
pub fn interpolate(template: &str, variables: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        out.push_str(&rest[..open]);

        let key = rest[open + 2..close].trim();
        match lookup_path(variables, key) {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[open..close + 2]),
        }
        rest = &rest[close + 2..];
    }

    out.push_str(rest);
    out
}

/// Build the payload handed to a node's external call.
///
/// With an `input_mapping` object (`{param: variable_path}`) only the mapped
/// variables are passed; without one the whole variable set is passed. A
/// static `input` object, if present, sits underneath: mapped or variable
/// values win on key collision.
pub fn build_node_input(node: &WorkflowNode, variables: &Variables) -> Variables {
    let mut input = match node.config.get("input") {
        Some(Value::Object(fixed)) => fixed.clone(),
        _ => Variables::new(),
    };

    match node.config.get("input_mapping") {
        Some(Value::Object(mapping)) => {
            for (param, source) in mapping {
                let value = match source {
                    Value::String(path) => lookup_path(variables, path).cloned(),
                    other => Some(other.clone()),
                };
                if let Some(value) = value {
                    input.insert(param.clone(), value);
                }
            }
        }
        _ => {
            for (key, value) in variables {
                input.insert(key.clone(), value.clone());
            }
        }
    }

    input
}

/// Wrap a non-object output under `result` so it can merge into variables.
pub fn output_to_variables(output: Value) -> Variables {
    match output {
        Value::Object(map) => map,
        Value::Null => Variables::new(),
        other => {
            let mut map = Variables::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

/// Convert a JSON value to a display string for template insertion.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
