//! Control-flow scope boundaries.
//!
//! Structured control flow is encoded as nested `ScopeEnter`/`ScopeExit`
//! pairs. Alternatives of a branch are `Arm` children of a `Branch`; the body
//! of a `Try` is its first `Arm` and every handler is a `Catch` child. A
//! `Finally` scope follows its `Try` as a sibling.

use serde::{Deserialize, Serialize};

pub type ScopeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
/// Refinement for branches guarded by a null comparison.
pub struct NullCheck {
    pub symbol: String,
    /// Whether the symbol is non-null inside the first arm
    /// (`x != null`) or inside the second one (`x == null`).
    pub non_null_in_first: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScopeKind {
    Unit,
    Class {
        name: String,
    },
    Method {
        name: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Block,
    Branch {
        /// All alternatives are listed; there is no implicit fall-through arm.
        #[serde(default)]
        exhaustive: bool,
        #[serde(default)]
        null_check: Option<NullCheck>,
    },
    Arm,
    Loop,
    Lambda,
    Try {
        #[serde(default)]
        has_catch: bool,
        #[serde(default)]
        has_finally: bool,
    },
    Catch,
    Finally,
    /// Scoped acquisition: every listed symbol is released on every exit.
    ResourceGuard {
        guarded: Vec<String>,
    },
}

impl ScopeKind {
    /// Stable name used by rule predicates.
    pub fn name(&self) -> &'static str {
        match self {
            ScopeKind::Unit => "unit",
            ScopeKind::Class { .. } => "class",
            ScopeKind::Method { .. } => "method",
            ScopeKind::Block => "block",
            ScopeKind::Branch { .. } => "branch",
            ScopeKind::Arm => "arm",
            ScopeKind::Loop => "loop",
            ScopeKind::Lambda => "lambda",
            ScopeKind::Try { .. } => "try",
            ScopeKind::Catch => "catch",
            ScopeKind::Finally => "finally",
            ScopeKind::ResourceGuard { .. } => "resource_guard",
        }
    }

    /// Scopes that own a body of code a `return` leaves.
    pub fn is_function(&self) -> bool {
        matches!(self, ScopeKind::Method { .. } | ScopeKind::Lambda)
    }
}
