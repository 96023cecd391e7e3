//! Main types of the **fact model**.
//!
//! A front-end lowers one parsed file into a [`SourceUnit`]: a flat stream of
//! normalized [`Fact`]s kept in source order. Everything downstream (resolver,
//! trackers, matching engine) consumes that stream and nothing else, so the
//! model is deliberately small and serializable. Pre-extracted units can be
//! written as JSON and fed back to the engine unchanged.

pub mod builder;
pub mod fact;
pub mod scope;
pub mod state;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use builder::UnitBuilder;
pub use fact::{DeclOrigin, Fact, FactKind, Operand, TargetKind};
pub use scope::{NullCheck, ScopeId, ScopeKind};
pub use state::{HandleState, TxKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// Location of a fact inside its unit. Both fields are 1-based.
pub struct Meta {
    pub line: usize,
    pub column: usize,
}

impl Meta {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
/// One compilable file together with its ordered fact stream.
pub struct SourceUnit {
    /// Path of the file the facts were extracted from.
    pub path: String,
    /// Front-end that produced the facts: "java", "facts", ...
    pub language: String,
    pub facts: Vec<Fact>,
    /// Declared types of members known before the stream starts
    /// (fields declared after their first use, for instance).
    #[serde(default)]
    pub symbol_hints: BTreeMap<String, String>,
    /// Lines carrying a suppression comment.
    #[serde(default)]
    pub suppressed: BTreeSet<usize>,
}

impl SourceUnit {
    /// Creates an empty unit for `path`.
    ///
    /// # Example
    /// ```
    /// use ir::SourceUnit;
    /// let unit = SourceUnit::new("Repo.java", "java");
    /// assert!(unit.facts.is_empty());
    /// ```
    pub fn new(path: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            language: language.into(),
            ..Default::default()
        }
    }

    /// Appends a fact, fixing its index to the position in the stream.
    pub fn push(&mut self, mut fact: Fact) {
        fact.index = self.facts.len();
        self.facts.push(fact);
    }

    /// Restores `index` on every fact after deserialization so the stream
    /// order and the indices always agree.
    pub fn reindex(&mut self) {
        for (i, f) in self.facts.iter_mut().enumerate() {
            f.index = i;
        }
    }
}

/// Strips package qualifiers, generic arguments and array markers from a
/// type name: `java.util.List<String>[]` becomes `List`.
///
/// # Example
/// ```
/// assert_eq!(ir::simple_type_name("java.sql.Connection"), "Connection");
/// assert_eq!(ir::simple_type_name("Map<String, List<Long>>"), "Map");
/// ```
pub fn simple_type_name(raw: &str) -> String {
    let base = raw.split('<').next().unwrap_or(raw);
    let base = base.trim().trim_end_matches("[]").trim_end_matches("...");
    let base = base.rsplit('.').next().unwrap_or(base);
    base.trim().to_string()
}

#[cfg(test)]
mod tests;
