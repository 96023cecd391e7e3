//! Taint labels attached to string-valued expressions.

use loader::Tri;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Ordered from least to most tainted; joins take the maximum.
pub enum TaintLevel {
    Clean,
    /// Could not be resolved. Propagates like `Tainted`, but questions
    /// about it answer `Unknown`.
    Assumed,
    Tainted,
}

impl TaintLevel {
    pub fn as_tri(self) -> Tri {
        match self {
            TaintLevel::Clean => Tri::False,
            TaintLevel::Assumed => Tri::Unknown,
            TaintLevel::Tainted => Tri::True,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(tag = "label", rename_all = "snake_case")]
pub enum TaintLabel {
    Literal,
    ExternalInput {
        origin: String,
        /// Set when the value is unresolved rather than known to come
        /// from outside.
        assumed: bool,
    },
    Concatenated {
        parents: BTreeSet<String>,
        level: TaintLevel,
    },
    Sanitized,
}

impl TaintLabel {
    pub fn external(origin: impl Into<String>) -> Self {
        TaintLabel::ExternalInput {
            origin: origin.into(),
            assumed: false,
        }
    }

    pub fn assumed(origin: impl Into<String>) -> Self {
        TaintLabel::ExternalInput {
            origin: origin.into(),
            assumed: true,
        }
    }

    pub fn level(&self) -> TaintLevel {
        match self {
            TaintLabel::Literal | TaintLabel::Sanitized => TaintLevel::Clean,
            TaintLabel::ExternalInput { assumed: true, .. } => TaintLevel::Assumed,
            TaintLabel::ExternalInput { .. } => TaintLevel::Tainted,
            TaintLabel::Concatenated { level, .. } => *level,
        }
    }

    pub fn is_tainted(&self) -> Tri {
        self.level().as_tri()
    }

    /// Most tainted of the two; `self` wins ties.
    pub fn join(&self, other: &TaintLabel) -> TaintLabel {
        if other.level() > self.level() {
            other.clone()
        } else {
            self.clone()
        }
    }

    /// Label of a string assembled from `parts`. `names` holds the symbol
    /// each part was read from, if any. A concatenation is tainted iff one
    /// of its parts is; sanitized parts contribute nothing.
    pub fn concat(parts: &[(Option<&str>, TaintLabel)]) -> TaintLabel {
        let parents: BTreeSet<String> = parts
            .iter()
            .filter_map(|(name, _)| name.map(str::to_string))
            .collect();
        if parents.is_empty() && parts.iter().all(|(_, l)| *l == TaintLabel::Literal) {
            return TaintLabel::Literal;
        }
        let level = parts
            .iter()
            .map(|(_, l)| l.level())
            .max()
            .unwrap_or(TaintLevel::Clean);
        TaintLabel::Concatenated { parents, level }
    }
}
