//! Named scopes.
//!
//! A scope is a reusable, named descriptor transform such as `kept` or
//! `active`. Models declare their scopes as a static table; lookups go
//! through [`ScopeRegistry`], which falls back to the built-in soft-delete
//! scopes for tables with a `discarded_at` column.

use std::fmt;

use super::descriptor::QueryDescriptor;
use crate::error::{RecordError, Result};
use crate::schema::{TableSchema, DISCARDED_AT};

pub type ScopeFn = fn(&QueryDescriptor) -> Result<QueryDescriptor>;

#[derive(Clone, Copy)]
pub struct Scope {
    pub name: &'static str,
    pub apply: ScopeFn,
}

impl Scope {
    pub const fn new(name: &'static str, apply: ScopeFn) -> Self {
        Self { name, apply }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scope").field(&self.name).finish()
    }
}

fn kept(descriptor: &QueryDescriptor) -> Result<QueryDescriptor> {
    descriptor.where_null(DISCARDED_AT)
}

fn discarded(descriptor: &QueryDescriptor) -> Result<QueryDescriptor> {
    descriptor.where_not_null(DISCARDED_AT)
}

/// Scopes available on every discardable table.
pub static SOFT_DELETE_SCOPES: &[Scope] = &[Scope::new("kept", kept), Scope::new("discarded", discarded)];

/// Scope lookup for one table.
#[derive(Debug, Clone, Copy)]
pub struct ScopeRegistry {
    table: &'static TableSchema,
    scopes: &'static [Scope],
}

impl ScopeRegistry {
    pub fn new(table: &'static TableSchema, scopes: &'static [Scope]) -> Self {
        Self { table, scopes }
    }

    pub fn get(&self, name: &str) -> Option<Scope> {
        let declared = self.scopes.iter().find(|s| s.name == name);
        let builtin = || {
            self.table
                .is_discardable()
                .then(|| SOFT_DELETE_SCOPES.iter().find(|s| s.name == name))
                .flatten()
        };
        declared.or_else(builtin).copied()
    }

    /// Names of every scope available on the table.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.scopes.iter().map(|s| s.name).collect();
        if self.table.is_discardable() {
            for scope in SOFT_DELETE_SCOPES {
                if !names.contains(&scope.name) {
                    names.push(scope.name);
                }
            }
        }
        names
    }

    pub fn apply(&self, name: &str, descriptor: &QueryDescriptor) -> Result<QueryDescriptor> {
        let scope = self.get(name).ok_or_else(|| {
            RecordError::invalid_query(format!("{} has no scope named {name:?}", self.table.name))
        })?;
        (scope.apply)(descriptor)
    }
}
