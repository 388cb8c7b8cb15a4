//! Query fingerprints.
//!
//! A fingerprint is the canonical identity of a descriptor and the key under
//! which backend views are shared. It is a readable string so it can be
//! logged as-is:
//!
//! ```text
//! tasks?job_id = s:"J1"&status = i:1|rel:job|ord:position:asc|lim:10|one
//! ```
//!
//! Components equal to their default (no ordering, no limit, ...) are
//! omitted.

use std::fmt;
use std::sync::Arc;

use super::descriptor::QueryDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    pub fn of(descriptor: &QueryDescriptor) -> Self {
        let mut out = String::with_capacity(64);
        out.push_str(descriptor.table().name);

        // Descriptors keep conditions in canonical order already.
        for (i, condition) in descriptor.conditions().iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(&condition.canonical());
        }

        if !descriptor.includes_list().is_empty() {
            out.push_str("|rel:");
            out.push_str(&descriptor.includes_list().join(","));
        }

        if !descriptor.ordering().is_empty() {
            out.push_str("|ord:");
            let clauses: Vec<String> = descriptor
                .ordering()
                .iter()
                .map(|o| format!("{}:{}", o.field, o.direction.as_str()))
                .collect();
            out.push_str(&clauses.join(","));
        }

        if let Some(limit) = descriptor.limit_value() {
            out.push_str(&format!("|lim:{limit}"));
        }
        if let Some(offset) = descriptor.offset_value() {
            out.push_str(&format!("|off:{offset}"));
        }
        if let Some(fields) = descriptor.selected_fields() {
            out.push_str("|sel:");
            out.push_str(&fields.join(","));
        }
        if descriptor.is_distinct() {
            out.push_str("|distinct");
        }
        if descriptor.is_single() {
            out.push_str("|one");
        }

        Self(Arc::from(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
