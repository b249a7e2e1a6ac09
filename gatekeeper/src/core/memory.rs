//! Append-only conversation memory with one-shot directives.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub text: String,
    /// Transient entries are dropped at the start of the next evaluation pass.
    #[serde(default, skip_serializing_if = "is_false")]
    pub transient: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memory {
    entries: Vec<MemoryEntry>,
}

impl Memory {
    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.entries.push(MemoryEntry {
            role,
            text: text.into(),
            transient: false,
        });
    }

    /// Append a one-shot system directive.
    ///
    /// Identical pending directives are not duplicated, so repeated evaluation
    /// of the same turn leaves memory unchanged.
    pub fn push_directive(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self
            .entries
            .iter()
            .any(|entry| entry.transient && entry.text == text)
        {
            return;
        }
        self.entries.push(MemoryEntry {
            role: Role::System,
            text,
            transient: true,
        });
    }

    /// Remove all transient entries, returning how many were dropped.
    pub fn prune_transient(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.transient);
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn directives(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.transient)
            .map(|entry| entry.text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
