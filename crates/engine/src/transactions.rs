//! Transaction boundary tracking.
//!
//! The per-path part is a stack of open contexts. Manual contexts are pushed
//! by begin-style calls and popped by commit or rollback; declarative ones
//! are pushed by markers on a method (or its class) and dropped when the
//! method exits. Facts about each method are accumulated in a
//! [`MethodTxSummary`] that rules can query when the method scope closes.

use ir::{Meta, TxKind};
use loader::{TxFlag, TxOp};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TxContext {
    pub kind: TxKind,
    pub start: Meta,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxState {
    stack: Vec<TxContext>,
}

impl TxState {
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn has(&self, kind: TxKind) -> bool {
        self.stack.iter().any(|c| c.kind == kind)
    }

    pub fn contexts(&self) -> &[TxContext] {
        &self.stack
    }

    fn pop_manual(&mut self) -> Option<TxContext> {
        let pos = self.stack.iter().rposition(|c| c.kind == TxKind::Manual)?;
        Some(self.stack.remove(pos))
    }

    fn has_manual_above(&self, base: usize) -> bool {
        self.stack
            .iter()
            .skip(base)
            .any(|c| c.kind == TxKind::Manual)
    }

    /// The deeper stack wins: an unmatched begin on any incoming path
    /// stays visible after the merge.
    pub fn join(&mut self, other: &TxState) {
        if other.stack.len() > self.stack.len() {
            self.stack = other.stack.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MethodTxSummary {
    pub method: String,
    pub meta: Meta,
    pub declarative: bool,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub unmatched_begin: bool,
    pub unmatched_end: bool,
    pub manual_in_declarative: bool,
    pub max_depth: usize,
}

impl MethodTxSummary {
    pub fn new(method: impl Into<String>, meta: Meta) -> Self {
        Self {
            method: method.into(),
            meta,
            ..Default::default()
        }
    }

    pub fn manual(&self) -> bool {
        self.begins + self.commits + self.rollbacks > 0
    }

    pub fn flag(&self, flag: TxFlag) -> bool {
        match flag {
            TxFlag::Manual => self.manual(),
            TxFlag::Declarative => self.declarative,
            TxFlag::UnmatchedBegin => self.unmatched_begin,
            TxFlag::UnmatchedEnd => self.unmatched_end,
            TxFlag::ManualInDeclarative => self.manual_in_declarative,
            TxFlag::Activity => self.manual() || self.declarative,
        }
    }

    fn observe_depth(&mut self, state: &TxState) {
        self.max_depth = self.max_depth.max(state.depth());
    }
}

/// Applies a begin, commit or rollback call.
pub fn apply_op(state: &mut TxState, summary: Option<&mut MethodTxSummary>, op: TxOp, meta: Meta) {
    let mut scratch = MethodTxSummary::default();
    let summary = summary.unwrap_or(&mut scratch);
    match op {
        TxOp::Begin => {
            if state.has(TxKind::Declarative) {
                summary.manual_in_declarative = true;
            }
            state.stack.push(TxContext {
                kind: TxKind::Manual,
                start: meta,
            });
            summary.begins += 1;
            summary.observe_depth(state);
        }
        TxOp::Commit => {
            summary.commits += 1;
            if state.pop_manual().is_none() {
                summary.unmatched_end = true;
            }
        }
        TxOp::Rollback => {
            // A rollback in a handler may run when no begin happened yet.
            summary.rollbacks += 1;
            state.pop_manual();
        }
    }
}

pub fn enter_declarative(state: &mut TxState, summary: &mut MethodTxSummary, meta: Meta) {
    state.stack.push(TxContext {
        kind: TxKind::Declarative,
        start: meta,
    });
    summary.declarative = true;
    summary.observe_depth(state);
}

/// Called when a path leaves the method whose contexts start at `base`.
pub fn leave_method(state: &TxState, summary: &mut MethodTxSummary, base: usize) {
    if state.has_manual_above(base) {
        summary.unmatched_begin = true;
    }
}

/// Drops every context opened inside the method.
pub fn close_method(state: &mut TxState, base: usize) {
    state.stack.truncate(base);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_pairs_match() {
        let mut st = TxState::default();
        let mut sum = MethodTxSummary::new("save", Meta::new(1, 1));
        apply_op(&mut st, Some(&mut sum), TxOp::Begin, Meta::new(2, 1));
        apply_op(&mut st, Some(&mut sum), TxOp::Commit, Meta::new(3, 1));
        leave_method(&st, &mut sum, 0);
        assert!(sum.flag(TxFlag::Manual));
        assert!(!sum.flag(TxFlag::UnmatchedBegin));
        assert!(!sum.flag(TxFlag::UnmatchedEnd));
        assert_eq!(sum.max_depth, 1);
    }

    #[test]
    fn manual_inside_declarative_is_flagged() {
        let mut st = TxState::default();
        let mut sum = MethodTxSummary::new("save", Meta::new(1, 1));
        enter_declarative(&mut st, &mut sum, Meta::new(1, 1));
        apply_op(&mut st, Some(&mut sum), TxOp::Begin, Meta::new(2, 1));
        assert_eq!(st.depth(), 2);
        leave_method(&st, &mut sum, 0);
        assert!(sum.manual_in_declarative);
        assert!(sum.unmatched_begin);
        close_method(&mut st, 0);
        assert_eq!(st.depth(), 0);
    }

    #[test]
    fn join_keeps_the_deeper_stack() {
        let mut a = TxState::default();
        let mut b = TxState::default();
        apply_op(&mut b, None, TxOp::Begin, Meta::new(1, 1));
        a.join(&b);
        assert!(a.has(TxKind::Manual));
        apply_op(&mut a, None, TxOp::Rollback, Meta::new(2, 1));
        assert_eq!(a.depth(), 0);
    }
}
