//! Incremental construction of a [`SourceUnit`].
//!
//! The builder keeps a cursor (location and excerpt) that every emitted fact
//! takes, hands out scope ids and temporaries, and guarantees that scopes are
//! closed in LIFO order.

use crate::fact::{DeclOrigin, Fact, FactKind, Operand, TargetKind};
use crate::scope::{ScopeId, ScopeKind};
use crate::{Meta, SourceUnit};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct UnitBuilder {
    unit: SourceUnit,
    cursor: Meta,
    excerpt: String,
    next_scope: ScopeId,
    next_temp: usize,
    open: Vec<(ScopeId, ScopeKind)>,
}

impl UnitBuilder {
    pub fn new(path: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            unit: SourceUnit::new(path, language),
            cursor: Meta::new(1, 1),
            excerpt: String::new(),
            next_scope: 1,
            next_temp: 1,
            open: Vec::new(),
        }
    }

    /// Moves the cursor to `line:column` and clears the excerpt.
    pub fn at(&mut self, line: usize, column: usize) -> &mut Self {
        self.cursor = Meta::new(line, column);
        self.excerpt.clear();
        self
    }

    /// Moves the cursor and sets the evidence text for the next facts.
    pub fn at_with(&mut self, meta: Meta, excerpt: impl Into<String>) -> &mut Self {
        self.cursor = meta;
        self.excerpt = excerpt.into();
        self
    }

    pub fn cursor(&self) -> Meta {
        self.cursor
    }

    /// Fresh temporary name. Temporaries start with `$` so they never
    /// collide with source identifiers.
    pub fn temp(&mut self) -> String {
        let t = format!("$t{}", self.next_temp);
        self.next_temp += 1;
        t
    }

    pub fn hint(&mut self, symbol: impl Into<String>, ty: impl Into<String>) -> &mut Self {
        self.unit.symbol_hints.insert(symbol.into(), ty.into());
        self
    }

    pub fn suppress_line(&mut self, line: usize) -> &mut Self {
        self.unit.suppressed.insert(line);
        self
    }

    /// Number of currently open scopes.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn emit(&mut self, kind: FactKind) -> usize {
        let fact = Fact::new(kind, self.cursor).with_excerpt(self.excerpt.clone());
        self.unit.push(fact);
        self.unit.facts.len() - 1
    }

    pub fn enter(&mut self, scope: ScopeKind) -> ScopeId {
        let id = self.next_scope;
        self.next_scope += 1;
        self.open.push((id, scope.clone()));
        self.emit(FactKind::ScopeEnter { id, scope });
        id
    }

    /// Closes the innermost open scope.
    pub fn exit(&mut self) -> Option<ScopeId> {
        let (id, scope) = self.open.pop()?;
        self.emit(FactKind::ScopeExit { id, scope });
        Some(id)
    }

    /// Closes scopes until `id` (inclusive) is closed.
    pub fn exit_to(&mut self, id: ScopeId) {
        while let Some(top) = self.exit() {
            if top == id {
                break;
            }
        }
    }

    pub fn import(&mut self, path: impl Into<String>) -> usize {
        self.emit(FactKind::Import { path: path.into() })
    }

    pub fn declare(
        &mut self,
        symbol: impl Into<String>,
        declared_type: Option<&str>,
        origin: DeclOrigin,
    ) -> usize {
        self.emit(FactKind::Declare {
            symbol: symbol.into(),
            declared_type: declared_type.map(str::to_string),
            origin,
        })
    }

    pub fn assign(&mut self, symbol: impl Into<String>, value: Operand) -> usize {
        self.emit(FactKind::Assign {
            symbol: symbol.into(),
            value,
        })
    }

    pub fn call(
        &mut self,
        receiver: Option<Operand>,
        method: impl Into<String>,
        args: Vec<Operand>,
        result: Option<&str>,
    ) -> usize {
        self.emit(FactKind::Call {
            receiver,
            method: method.into(),
            args,
            result: result.map(str::to_string),
        })
    }

    pub fn annotate(
        &mut self,
        target: impl Into<String>,
        target_kind: TargetKind,
        name: impl Into<String>,
        args: BTreeMap<String, Operand>,
        modifiers: Vec<String>,
    ) -> usize {
        self.emit(FactKind::AnnotationAttach {
            target: target.into(),
            target_kind,
            name: name.into(),
            args,
            modifiers,
        })
    }

    pub fn string_build(&mut self, result: impl Into<String>, parts: Vec<Operand>) -> usize {
        self.emit(FactKind::StringBuild {
            result: result.into(),
            parts,
        })
    }

    pub fn ret(&mut self, value: Option<Operand>) -> usize {
        self.emit(FactKind::Return { value })
    }

    pub fn throw(&mut self, value: Option<Operand>) -> usize {
        self.emit(FactKind::Throw { value })
    }

    pub fn field_store(&mut self, field: impl Into<String>, value: Operand) -> usize {
        self.emit(FactKind::FieldStore {
            field: field.into(),
            value,
        })
    }

    /// Closes every open scope and returns the unit.
    pub fn finish(mut self) -> SourceUnit {
        while self.exit().is_some() {}
        self.unit
    }
}
