//! Type/Taint resolver: a forward, flow-sensitive environment mapping each
//! visible symbol to its approximate type, taint label and constant value.
//!
//! The environment is part of the per-path flow state. It is only ever
//! updated from the fact being processed, so its content after fact *i*
//! depends on facts `1..=i` alone.

use crate::taint::TaintLabel;
use ir::{simple_type_name, DeclOrigin, Operand, ScopeId};
use loader::Vocabulary;
use serde::Serialize;
use std::collections::BTreeMap;

const STRING_TYPES: &[&str] = &[
    "String",
    "CharSequence",
    "StringBuilder",
    "StringBuffer",
    "Object",
];

const SCALAR_TYPES: &[&str] = &[
    "int", "long", "short", "byte", "char", "boolean", "float", "double", "Integer", "Long",
    "Short", "Byte", "Character", "Boolean", "Float", "Double", "BigDecimal", "BigInteger",
    "UUID", "LocalDate", "LocalDateTime", "Instant", "Date", "Timestamp",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    Named(String),
    Unknown,
}

impl DeclaredType {
    /// Normalizes a type as written in a declaration. `var` and missing
    /// types are `Unknown`.
    pub fn from_source(raw: Option<&str>) -> Self {
        match raw.map(simple_type_name) {
            Some(t) if !t.is_empty() && t != "var" => DeclaredType::Named(t),
            _ => DeclaredType::Unknown,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DeclaredType::Named(n) => Some(n),
            DeclaredType::Unknown => None,
        }
    }

    /// Widening used at control-flow merges.
    pub fn join(&self, other: &DeclaredType, vocab: &Vocabulary) -> DeclaredType {
        match (self, other) {
            (DeclaredType::Named(a), DeclaredType::Named(b)) => vocab
                .common_ancestor(a, b)
                .map(DeclaredType::Named)
                .unwrap_or(DeclaredType::Unknown),
            _ => DeclaredType::Unknown,
        }
    }

    pub fn is_stringish(&self) -> bool {
        match self {
            DeclaredType::Named(n) => STRING_TYPES.contains(&n.as_str()),
            DeclaredType::Unknown => true,
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, DeclaredType::Named(n) if SCALAR_TYPES.contains(&n.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// What the resolver knows about one value.
pub struct ValueInfo {
    pub ty: DeclaredType,
    pub taint: TaintLabel,
    /// Compile-time value when the value is a literal or was assigned
    /// one on every path.
    pub constant: Option<String>,
    /// Symbol the value was read from.
    pub symbol: Option<String>,
    /// The symbol could not be resolved at all.
    pub unresolved: bool,
}

impl ValueInfo {
    fn plain(ty: DeclaredType, taint: TaintLabel) -> Self {
        Self {
            ty,
            taint,
            constant: None,
            symbol: None,
            unresolved: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Type from the declaration; stays fixed unless it is `Unknown`.
    pub declared: DeclaredType,
    pub ty: DeclaredType,
    pub taint: TaintLabel,
    pub constant: Option<String>,
    pub origin: DeclOrigin,
    pub scope: ScopeId,
    shadowed: Option<Box<Binding>>,
}

/// Symbol names are compared without a `this.` qualifier.
pub fn normalize_symbol(name: &str) -> &str {
    name.strip_prefix("this.").unwrap_or(name)
}

fn looks_like_constant(name: &str) -> bool {
    name.len() > 1
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolEnv {
    bindings: BTreeMap<String, Binding>,
}

/// Read-only inputs of the resolver for one unit.
pub struct Resolver<'a> {
    pub vocab: &'a Vocabulary,
    pub hints: &'a BTreeMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(vocab: &'a Vocabulary, hints: &'a BTreeMap<String, String>) -> Self {
        Self { vocab, hints }
    }

    fn knows_type(&self, ty: &str) -> bool {
        self.vocab.parents.contains_key(ty)
            || self.vocab.parents.values().any(|ps| ps.iter().any(|p| p == ty))
            || self.vocab.returns.iter().any(|(_, t)| t == ty)
    }

    /// Taint a symbol starts with before any assignment.
    fn initial_taint(&self, symbol: &str, origin: DeclOrigin, ty: &DeclaredType) -> TaintLabel {
        match origin {
            DeclOrigin::Parameter => {
                if ty.is_stringish() {
                    TaintLabel::external(format!("parameter {symbol}"))
                } else if ty.is_scalar() || ty.name().is_some_and(|t| self.knows_type(t)) {
                    TaintLabel::Literal
                } else {
                    TaintLabel::assumed(format!("parameter {symbol}"))
                }
            }
            DeclOrigin::Field if ty.is_stringish() => TaintLabel::assumed(format!("field {symbol}")),
            _ => TaintLabel::Literal,
        }
    }

    /// Resolves an operand against `env`.
    pub fn value(&self, env: &SymbolEnv, op: &Operand) -> ValueInfo {
        match op {
            Operand::Literal { value } => ValueInfo {
                constant: Some(value.clone()),
                ..ValueInfo::plain(DeclaredType::Named("String".into()), TaintLabel::Literal)
            },
            Operand::Constant { value } => ValueInfo {
                constant: Some(value.clone()),
                ..ValueInfo::plain(DeclaredType::Unknown, TaintLabel::Literal)
            },
            Operand::Null => ValueInfo::plain(DeclaredType::Unknown, TaintLabel::Literal),
            Operand::TypeRef { name } => ValueInfo::plain(
                DeclaredType::Named(simple_type_name(name)),
                TaintLabel::Literal,
            ),
            Operand::Opaque { text } => ValueInfo {
                unresolved: true,
                ..ValueInfo::plain(DeclaredType::Unknown, TaintLabel::assumed(text.clone()))
            },
            Operand::Symbol { name } => {
                let name = normalize_symbol(name);
                if let Some(b) = env.bindings.get(name) {
                    return ValueInfo {
                        ty: b.ty.clone(),
                        taint: b.taint.clone(),
                        constant: b.constant.clone(),
                        symbol: Some(name.to_string()),
                        unresolved: false,
                    };
                }
                if let Some(hint) = self.hints.get(name) {
                    let ty = DeclaredType::from_source(Some(hint));
                    let taint = self.initial_taint(name, DeclOrigin::Field, &ty);
                    return ValueInfo {
                        symbol: Some(name.to_string()),
                        ..ValueInfo::plain(ty, taint)
                    };
                }
                if looks_like_constant(name) {
                    return ValueInfo {
                        symbol: Some(name.to_string()),
                        ..ValueInfo::plain(DeclaredType::Unknown, TaintLabel::Literal)
                    };
                }
                ValueInfo {
                    symbol: Some(name.to_string()),
                    unresolved: true,
                    ..ValueInfo::plain(DeclaredType::Unknown, TaintLabel::assumed(name))
                }
            }
        }
    }

    /// Receiver type followed by its ancestors. `None` when the receiver's
    /// type is unknown. A missing receiver or `this` means the enclosing
    /// class.
    pub fn receiver_types(
        &self,
        env: &SymbolEnv,
        receiver: Option<&Operand>,
        this_type: Option<&str>,
    ) -> Option<Vec<String>> {
        let ty = match receiver {
            None => this_type.map(str::to_string),
            Some(Operand::Symbol { name }) if name == "this" => this_type.map(str::to_string),
            Some(Operand::Symbol { name }) => {
                let name = normalize_symbol(name);
                match env.bindings.get(name) {
                    Some(b) => b.ty.name().map(str::to_string),
                    None => self
                        .hints
                        .get(name)
                        .map(|h| simple_type_name(h))
                        .or_else(|| {
                            name.starts_with(|c: char| c.is_ascii_uppercase())
                                .then(|| name.to_string())
                        }),
                }
            }
            Some(Operand::TypeRef { name }) => Some(simple_type_name(name)),
            Some(Operand::Literal { .. }) => Some("String".to_string()),
            Some(_) => None,
        }?;
        Some(self.vocab.ancestors(&ty))
    }

    /// Value produced by a call.
    pub fn call_result(
        &self,
        receiver: Option<&Operand>,
        receiver_value: Option<&ValueInfo>,
        receiver_types: Option<&[String]>,
        method: &str,
        args: &[ValueInfo],
    ) -> ValueInfo {
        let ty = match receiver {
            Some(Operand::TypeRef { name }) if method == "new" => {
                DeclaredType::Named(simple_type_name(name))
            }
            _ => self
                .vocab
                .return_type(receiver_types, method)
                .map(|t| DeclaredType::Named(t.to_string()))
                .unwrap_or(DeclaredType::Unknown),
        };
        let origin = || match receiver_types.and_then(|t| t.first()) {
            Some(t) => format!("{t}.{method}"),
            None => method.to_string(),
        };
        let taint = if self.vocab.is_sanitizer(receiver_types, method) {
            TaintLabel::Sanitized
        } else if self.vocab.is_source(receiver_types, method) {
            TaintLabel::external(origin())
        } else if !ty.is_stringish() {
            TaintLabel::Literal
        } else {
            let mut taint = receiver_value
                .filter(|_| matches!(receiver, Some(Operand::Symbol { .. })))
                .map(|v| v.taint.clone())
                .unwrap_or(TaintLabel::Literal);
            for a in args {
                taint = taint.join(&a.taint);
            }
            taint
        };
        ValueInfo::plain(ty, taint)
    }

    /// Value of a string assembled from `parts`.
    pub fn string_build(&self, parts: &[ValueInfo]) -> ValueInfo {
        let labelled: Vec<(Option<&str>, TaintLabel)> = parts
            .iter()
            .map(|p| (p.symbol.as_deref(), p.taint.clone()))
            .collect();
        let constant = parts
            .iter()
            .map(|p| p.constant.clone())
            .collect::<Option<Vec<_>>>()
            .map(|c| c.concat());
        ValueInfo {
            constant,
            ..ValueInfo::plain(
                DeclaredType::Named("String".into()),
                TaintLabel::concat(&labelled),
            )
        }
    }
}

impl SymbolEnv {
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(normalize_symbol(name))
    }

    pub fn declare(
        &mut self,
        r: &Resolver<'_>,
        symbol: &str,
        raw_type: Option<&str>,
        origin: DeclOrigin,
        scope: ScopeId,
    ) {
        let symbol = normalize_symbol(symbol);
        let declared = DeclaredType::from_source(raw_type);
        let taint = r.initial_taint(symbol, origin, &declared);
        let shadowed = self
            .bindings
            .remove(symbol)
            .filter(|b| b.scope != scope)
            .map(Box::new);
        self.bindings.insert(
            symbol.to_string(),
            Binding {
                ty: declared.clone(),
                declared,
                taint,
                constant: None,
                origin,
                scope,
                shadowed,
            },
        );
    }

    /// Strong update of `symbol`. Undeclared symbols are bound in `scope`,
    /// or at unit level when the front-end knows them as members.
    pub fn assign(&mut self, r: &Resolver<'_>, symbol: &str, value: ValueInfo, scope: ScopeId) {
        let symbol = normalize_symbol(symbol);
        let b = self.bindings.entry(symbol.to_string()).or_insert_with(|| {
            let (declared, origin, scope) = match r.hints.get(symbol) {
                Some(h) => (DeclaredType::from_source(Some(h)), DeclOrigin::Field, 0),
                None => (DeclaredType::Unknown, DeclOrigin::Local, scope),
            };
            Binding {
                ty: declared.clone(),
                declared,
                taint: TaintLabel::Literal,
                constant: None,
                origin,
                scope,
                shadowed: None,
            }
        });
        b.ty = match &b.declared {
            DeclaredType::Named(n) if n != "Object" => b.declared.clone(),
            _ => value.ty,
        };
        b.taint = if b.ty.is_stringish() {
            value.taint
        } else {
            TaintLabel::Literal
        };
        b.constant = value.constant;
    }

    /// Weak update for stores into object fields: the old value may still
    /// be observed through other references.
    pub fn store_field(&mut self, r: &Resolver<'_>, field: &str, value: ValueInfo) {
        let field = normalize_symbol(field);
        match self.bindings.get_mut(field) {
            Some(b) => {
                b.taint = b.taint.join(&value.taint);
                if b.constant != value.constant {
                    b.constant = None;
                }
            }
            None => self.assign(r, field, value, 0),
        }
    }

    /// Drops bindings declared in `scope`, restoring what they shadowed.
    pub fn exit_scope(&mut self, scope: ScopeId) {
        let leaving: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.scope == scope)
            .map(|(k, _)| k.clone())
            .collect();
        for name in leaving {
            if let Some(b) = self.bindings.remove(&name) {
                if let Some(prev) = b.shadowed {
                    self.bindings.insert(name, *prev);
                }
            }
        }
    }

    /// Merge of two incoming paths: types widen to a common ancestor,
    /// taint to the most tainted, constants survive only when equal.
    pub fn join(&mut self, other: &SymbolEnv, vocab: &Vocabulary) {
        for (name, theirs) in &other.bindings {
            match self.bindings.get_mut(name) {
                Some(mine) => {
                    mine.ty = mine.ty.join(&theirs.ty, vocab);
                    mine.taint = mine.taint.join(&theirs.taint);
                    if mine.constant != theirs.constant {
                        mine.constant = None;
                    }
                }
                None => {
                    self.bindings.insert(name.clone(), theirs.clone());
                }
            }
        }
    }
}
