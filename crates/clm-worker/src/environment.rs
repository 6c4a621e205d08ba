//! The persistent global environment.
//!
//! Variables created during one submission remain visible to later
//! submissions. The record is explicit: a plain name-to-value table owned by
//! the worker and snapshotted into a fresh evaluation scope before each
//! submission, then captured back afterwards. System identities (capability
//! functions, `read_stdin`, `reset`) live on the engine, not in this record,
//! so a `reset` clears user state without touching them.

use rhai::{Dynamic, Scope};

#[derive(Default)]
pub struct Environment {
    vars: Vec<(String, Dynamic)>,
}

impl Environment {
    /// Push every persisted variable into `scope`.
    pub fn restore_into(&self, scope: &mut Scope) {
        for (name, value) in &self.vars {
            scope.push_dynamic(name.clone(), value.clone());
        }
    }

    /// Snapshot the top-level variables of `scope` into a new record.
    pub fn capture(scope: &Scope) -> Self {
        Self {
            vars: scope
                .iter()
                .map(|(name, _constant, value)| (name.to_string(), value))
                .collect(),
        }
    }

    /// Drop every persisted variable.
    pub fn clear(&mut self) {
        self.vars.clear();
    }

    /// Number of persisted variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the record is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Look up one persisted variable by name.
    pub fn get(&self, name: &str) -> Option<&Dynamic> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}
