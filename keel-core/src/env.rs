//! Lexical environments
//!
//! An environment is a name-to-value table chained to an optional enclosing
//! scope. Handles are ownership-shared: a scope lives as long as any call
//! frame or closure still referencing it, not as long as its lexical block.
//! Every node is internally synchronized because the global scope is shared
//! across worker tasks; lexical scopes created inside one task simply never
//! see contention.

use crate::value::{Value, ValueError, ValueResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvNode>,
}

struct EnvNode {
    values: Mutex<FxHashMap<String, Value>>,
    enclosing: Option<Environment>,
}

impl Environment {
    /// A root scope with no enclosing environment.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnvNode {
                values: Mutex::new(FxHashMap::default()),
                enclosing: None,
            }),
        }
    }

    /// A child scope of `enclosing`.
    pub fn with_enclosing(enclosing: Environment) -> Self {
        Self {
            inner: Arc::new(EnvNode {
                values: Mutex::new(FxHashMap::default()),
                enclosing: Some(enclosing),
            }),
        }
    }

    pub fn enclosing(&self) -> Option<Environment> {
        self.inner.enclosing.clone()
    }

    /// Insert or overwrite a binding in this scope.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner.values.lock().insert(name.into(), value);
    }

    /// Look a name up, walking outward through enclosing scopes.
    pub fn get(&self, name: &str) -> ValueResult<Value> {
        if let Some(value) = self.inner.values.lock().get(name) {
            return Ok(value.clone());
        }
        match &self.inner.enclosing {
            Some(enclosing) => enclosing.get(name),
            None => Err(ValueError::UndefinedVariable(name.to_string())),
        }
    }

    /// Mutate the first scope that owns `name`, walking outward.
    pub fn assign(&self, name: &str, value: Value) -> ValueResult<()> {
        {
            let mut values = self.inner.values.lock();
            if let Some(slot) = values.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        match &self.inner.enclosing {
            Some(enclosing) => enclosing.assign(name, value),
            None => Err(ValueError::UndefinedVariable(name.to_string())),
        }
    }

    /// Remove a binding from this scope only.
    pub fn remove(&self, name: &str) -> ValueResult<()> {
        match self.inner.values.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(ValueError::UndefinedVariable(name.to_string())),
        }
    }

    /// Whether this scope (not the chain) owns `name`.
    pub fn has_local(&self, name: &str) -> bool {
        self.inner.values.lock().contains_key(name)
    }

    /// Copy of this scope's own bindings.
    pub fn snapshot(&self) -> FxHashMap<String, Value> {
        self.inner.values.lock().clone()
    }

    /// Identity comparison between handles.
    pub fn ptr_eq(a: &Environment, b: &Environment) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("bindings", &self.inner.values.lock().len())
            .field("has_enclosing", &self.inner.enclosing.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
