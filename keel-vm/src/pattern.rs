//! Structural pattern matching
//!
//! Patterns are a closed sum type built by the compiler into the program's
//! pattern table and referenced by index from `MatchPattern`. Matching
//! produces a binding set that the VM commits to the current environment
//! only on full success; a failed match never leaks partial bindings.
//! Case selection is first-match-wins and guards are ordinary bytecode
//! emitted after the match instruction, so neither appears here.

use keel_core::value::{DictKey, DictValue, UnionState, Value};
use rustc_hash::FxHashMap;

/// One field of a dict pattern: the key that must be present and the name it
/// binds under (the key name itself when no binding is given).
#[derive(Debug, Clone)]
pub struct DictFieldPattern {
    pub key: String,
    pub binding: Option<String>,
}

/// The five pattern shapes.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Equality against a literal value
    Literal(Value),
    /// Always matches; binds unless the wildcard `None`
    Binding(Option<String>),
    /// Arity-checked element-wise match
    List(Vec<Pattern>),
    /// Arity-checked element-wise match over a tuple
    Tuple(Vec<Pattern>),
    /// Field presence match with optional rest collection
    Dict {
        fields: Vec<DictFieldPattern>,
        rest: Option<String>,
    },
    /// Matches the success arm of an error union, binding the payload
    Ok(String),
    /// Matches the error arm, optionally restricted to one error type,
    /// binding the raw error
    Err {
        binding: String,
        error_type: Option<String>,
    },
}

impl Pattern {
    pub fn wildcard() -> Pattern {
        Pattern::Binding(None)
    }

    pub fn binding(name: impl Into<String>) -> Pattern {
        Pattern::Binding(Some(name.into()))
    }
}

/// Match `value` against `pattern`, returning the bindings on success.
pub fn match_value(value: &Value, pattern: &Pattern) -> Option<FxHashMap<String, Value>> {
    let mut bindings = FxHashMap::default();
    if match_into(value, pattern, &mut bindings) {
        Some(bindings)
    } else {
        None
    }
}

fn match_into(value: &Value, pattern: &Pattern, bindings: &mut FxHashMap<String, Value>) -> bool {
    match pattern {
        Pattern::Literal(expected) => expected.loose_eq(value),

        Pattern::Binding(name) => {
            if let Some(name) = name {
                bindings.insert(name.clone(), value.clone());
            }
            true
        }

        Pattern::List(elements) => match value {
            Value::List(items) => {
                let items = items.read().clone();
                match_sequence(&items, elements, bindings)
            }
            _ => false,
        },

        Pattern::Tuple(elements) => match value {
            Value::Tuple(items) => {
                let items = items.read().clone();
                match_sequence(&items, elements, bindings)
            }
            _ => false,
        },

        Pattern::Dict { fields, rest } => match value {
            Value::Dict(dict) => {
                let dict = dict.read().clone();
                for field in fields {
                    let key = DictKey::Str(field.key.clone());
                    match dict.get(&key) {
                        Some(found) => {
                            let name = field.binding.as_ref().unwrap_or(&field.key);
                            bindings.insert(name.clone(), found.clone());
                        }
                        None => return false,
                    }
                }
                if let Some(rest_name) = rest {
                    let mut remainder = DictValue::new();
                    for (key, entry) in &dict.entries {
                        let matched = fields
                            .iter()
                            .any(|f| matches!(key, DictKey::Str(s) if s == &f.key));
                        if !matched {
                            remainder.insert(key.clone(), entry.clone());
                        }
                    }
                    bindings.insert(rest_name.clone(), Value::dict(remainder));
                }
                true
            }
            _ => false,
        },

        Pattern::Ok(name) => match value {
            Value::Union(state) => match &**state {
                UnionState::Ok(payload) => {
                    bindings.insert(name.clone(), payload.clone());
                    true
                }
                UnionState::Err(_) => false,
            },
            _ => false,
        },

        Pattern::Err {
            binding,
            error_type,
        } => {
            let error = match value {
                Value::Union(state) => match &**state {
                    UnionState::Err(e) => e,
                    UnionState::Ok(_) => return false,
                },
                Value::Error(e) => e,
                _ => return false,
            };
            if let Some(expected) = error_type {
                if &error.error_type != expected {
                    return false;
                }
            }
            bindings.insert(binding.clone(), Value::Error(Box::new(error.clone())));
            true
        }
    }
}

fn match_sequence(
    items: &[Value],
    elements: &[Pattern],
    bindings: &mut FxHashMap<String, Value>,
) -> bool {
    if items.len() != elements.len() {
        return false;
    }
    items
        .iter()
        .zip(elements.iter())
        .all(|(item, pattern)| match_into(item, pattern, bindings))
}

#[cfg(test)]
#[path = "pattern_tests.rs"]
mod tests;
