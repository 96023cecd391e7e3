//! Normalized events extracted from a source unit.

use crate::scope::{ScopeId, ScopeKind};
use crate::Meta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
/// Simple value reference used by facts. Front-ends hoist nested
/// expressions into temporaries so operands never nest.
pub enum Operand {
    /// String literal, unquoted.
    Literal { value: String },
    /// Non-string literal: number, boolean, character, class literal.
    Constant { value: String },
    Null,
    Symbol { name: String },
    /// Static reference to a type, e.g. the receiver of `DriverManager.getConnection`.
    TypeRef { name: String },
    /// Expression the front-end could not normalize.
    Opaque { text: String },
}

impl Operand {
    pub fn symbol(name: impl Into<String>) -> Self {
        Operand::Symbol { name: name.into() }
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Operand::Literal {
            value: value.into(),
        }
    }

    pub fn type_ref(name: impl Into<String>) -> Self {
        Operand::TypeRef { name: name.into() }
    }

    /// Name of the referenced symbol, if any.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Operand::Symbol { name } => Some(name),
            _ => None,
        }
    }

    /// True for values written directly in the source.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Operand::Literal { .. } | Operand::Constant { .. } | Operand::Null
        )
    }

    /// Textual rendering used in evidence and pattern matching.
    pub fn text(&self) -> String {
        match self {
            Operand::Literal { value } => format!("\"{value}\""),
            Operand::Constant { value } => value.clone(),
            Operand::Null => "null".into(),
            Operand::Symbol { name } => name.clone(),
            Operand::TypeRef { name } => name.clone(),
            Operand::Opaque { text } => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
/// Where a declared symbol comes from.
pub enum DeclOrigin {
    #[default]
    Local,
    Parameter,
    Field,
    /// Exception variable bound by a catch clause.
    Catch,
    /// Variable declared by a scoped-acquisition construct.
    Resource,
    /// Temporary introduced by the front-end.
    Temp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
/// Kind of element an annotation is attached to.
pub enum TargetKind {
    Class,
    Method,
    Field,
    Parameter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactKind {
    Import {
        path: String,
    },
    Declare {
        symbol: String,
        #[serde(default)]
        declared_type: Option<String>,
        #[serde(default)]
        origin: DeclOrigin,
    },
    Assign {
        symbol: String,
        value: Operand,
    },
    Call {
        #[serde(default)]
        receiver: Option<Operand>,
        method: String,
        #[serde(default)]
        args: Vec<Operand>,
        /// Symbol the call result is bound to.
        #[serde(default)]
        result: Option<String>,
    },
    AnnotationAttach {
        target: String,
        target_kind: TargetKind,
        name: String,
        #[serde(default)]
        args: BTreeMap<String, Operand>,
        /// Modifiers of the annotated element (`private`, `static`, ...).
        #[serde(default)]
        modifiers: Vec<String>,
    },
    StringBuild {
        result: String,
        parts: Vec<Operand>,
    },
    Return {
        #[serde(default)]
        value: Option<Operand>,
    },
    Throw {
        #[serde(default)]
        value: Option<Operand>,
    },
    FieldStore {
        field: String,
        value: Operand,
    },
    ScopeEnter {
        id: ScopeId,
        scope: ScopeKind,
    },
    ScopeExit {
        id: ScopeId,
        scope: ScopeKind,
    },
}

impl FactKind {
    /// Stable name of the variant, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            FactKind::Import { .. } => "import",
            FactKind::Declare { .. } => "declare",
            FactKind::Assign { .. } => "assign",
            FactKind::Call { .. } => "call",
            FactKind::AnnotationAttach { .. } => "annotation_attach",
            FactKind::StringBuild { .. } => "string_build",
            FactKind::Return { .. } => "return",
            FactKind::Throw { .. } => "throw",
            FactKind::FieldStore { .. } => "field_store",
            FactKind::ScopeEnter { .. } => "scope_enter",
            FactKind::ScopeExit { .. } => "scope_exit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A tagged event `{kind, location, operands}`.
pub struct Fact {
    /// Position in the unit's stream.
    #[serde(default)]
    pub index: usize,
    #[serde(flatten)]
    pub kind: FactKind,
    pub meta: Meta,
    /// Source text the fact was lowered from, used as evidence.
    #[serde(default)]
    pub excerpt: String,
}

impl Fact {
    pub fn new(kind: FactKind, meta: Meta) -> Self {
        Self {
            index: 0,
            kind,
            meta,
            excerpt: String::new(),
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = excerpt.into();
        self
    }
}
