//! Resource lifecycle tracking.
//!
//! Every acquisition call site creates one handle. The per-path part of the
//! tracker ([`ResourceState`]) records, for each live handle, the set of
//! states it may be in on the current path and which symbols may refer to
//! it. The path-independent part ([`HandleTable`]) keeps what is known about
//! each handle, the states recorded on paths that already ended, and the
//! transition log.

use ir::{HandleState, Meta, ScopeId};
use loader::Tri;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub type HandleId = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
/// States a handle may be in, one flag per possibility.
pub struct LifeSet {
    pub acquired: bool,
    pub closed: bool,
    pub escaped: bool,
    /// Handed to a call the tracker knows nothing about.
    pub passed: bool,
}

impl LifeSet {
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            ..Default::default()
        }
    }

    pub fn union(self, other: LifeSet) -> LifeSet {
        LifeSet {
            acquired: self.acquired || other.acquired,
            closed: self.closed || other.closed,
            escaped: self.escaped || other.escaped,
            passed: self.passed || other.passed,
        }
    }

    pub fn release(&mut self) {
        self.acquired = false;
        self.closed = true;
    }

    pub fn escape(&mut self) {
        self.acquired = false;
        self.escaped = true;
    }

    pub fn may_be(&self, state: HandleState) -> bool {
        match state {
            HandleState::Acquired => self.acquired,
            HandleState::Closed => self.closed,
            HandleState::Escaped => self.escaped,
            HandleState::Leaked => false,
        }
    }

    /// Final state once no path can touch the handle anymore.
    pub fn outcome(&self) -> HandleState {
        if self.acquired {
            HandleState::Leaked
        } else if self.escaped {
            HandleState::Escaped
        } else {
            HandleState::Closed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub kind: String,
    /// Symbol the acquisition was bound to.
    pub symbol: String,
    /// Scope whose exit ends the handle's life.
    pub scope: ScopeId,
    pub meta: Meta,
    pub excerpt: String,
    /// Handle the acquisition was made through (statement of a connection).
    pub parent: Option<HandleId>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Transition {
    pub fact: usize,
    pub line: usize,
    pub to: HandleState,
}

#[derive(Debug, Clone, Serialize)]
/// End-of-life summary of one handle.
pub struct HandleReport {
    pub id: HandleId,
    pub kind: String,
    pub symbol: String,
    pub meta: Meta,
    pub excerpt: String,
    pub state: HandleState,
    /// The handle reached code the tracker cannot see on some path, so a
    /// `Leaked` outcome is not certain.
    pub uncertain: bool,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState {
    handles: BTreeMap<HandleId, LifeSet>,
    bindings: BTreeMap<String, BTreeSet<HandleId>>,
}

impl ResourceState {
    pub fn len(&self) -> usize {
        self.handles.len() + self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.bindings.is_empty()
    }

    /// Handles `symbol` may refer to on this path.
    pub fn handles_of(&self, symbol: &str) -> BTreeSet<HandleId> {
        self.bindings.get(symbol).cloned().unwrap_or_default()
    }

    pub fn life(&self, id: HandleId) -> Option<LifeSet> {
        self.handles.get(&id).copied()
    }

    pub fn live(&self) -> impl Iterator<Item = (HandleId, LifeSet)> + '_ {
        self.handles.iter().map(|(k, v)| (*k, *v))
    }

    fn is_referenced(&self, id: HandleId) -> bool {
        self.bindings.values().any(|hs| hs.contains(&id))
    }

    pub fn join(&mut self, other: &ResourceState) {
        for (id, set) in &other.handles {
            let entry = self.handles.entry(*id).or_default();
            *entry = entry.union(*set);
        }
        for (sym, hs) in &other.bindings {
            self.bindings
                .entry(sym.clone())
                .or_default()
                .extend(hs.iter().copied());
        }
    }

    /// On this path `symbol` holds no resource (the null arm of a null
    /// check), so its handles need no release here.
    pub fn refine_null(&mut self, symbol: &str) {
        for id in self.handles_of(symbol) {
            if let Some(set) = self.handles.get_mut(&id) {
                *set = LifeSet {
                    closed: true,
                    ..Default::default()
                };
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct HandleTable {
    infos: BTreeMap<HandleId, HandleInfo>,
    ended: BTreeMap<HandleId, LifeSet>,
    log: BTreeMap<HandleId, Vec<Transition>>,
    reported: BTreeSet<HandleId>,
}

impl HandleTable {
    pub fn info(&self, id: HandleId) -> Option<&HandleInfo> {
        self.infos.get(&id)
    }

    /// Live children of any handle in `parents`.
    fn children<'a>(
        &'a self,
        parents: &'a BTreeSet<HandleId>,
    ) -> impl Iterator<Item = &'a HandleInfo> + 'a {
        self.infos
            .values()
            .filter(move |i| i.parent.is_some_and(|p| parents.contains(&p)))
    }

    fn record(&mut self, id: HandleId, fact: usize, meta: Meta, to: HandleState) {
        self.log.entry(id).or_default().push(Transition {
            fact,
            line: meta.line,
            to,
        });
    }

    /// Records a new handle and binds it to its symbol on this path. The
    /// symbol's previous binding ends as in an assignment.
    ///
    /// A call site reached again (the next pass of a loop body) replaces the
    /// instance it produced before. When that instance may still be open and
    /// no other symbol holds it, it is lost here.
    pub fn acquire(&mut self, state: &mut ResourceState, info: HandleInfo, fact: usize) {
        let id = info.id;
        let symbol = info.symbol.clone();
        let meta = info.meta;
        if let Some(previous) = state.handles.get(&id).copied() {
            let aliased = state
                .bindings
                .iter()
                .any(|(s, hs)| *s != symbol && hs.contains(&id));
            if previous.acquired && !aliased {
                self.record(id, fact, meta, HandleState::Leaked);
                let entry = self.ended.entry(id).or_default();
                *entry = entry.union(previous);
            }
        }
        self.record(id, fact, meta, HandleState::Acquired);
        self.infos.insert(id, info);
        self.reported.remove(&id);
        state.handles.insert(id, LifeSet::acquired());
        self.bind(state, &symbol, BTreeSet::from([id]), fact, meta);
    }

    /// Rebinds `symbol`. Handles no longer referenced by any symbol end
    /// their life on this path in whatever state they are.
    pub fn bind(
        &mut self,
        state: &mut ResourceState,
        symbol: &str,
        handles: BTreeSet<HandleId>,
        fact: usize,
        meta: Meta,
    ) {
        let previous = if handles.is_empty() {
            state.bindings.remove(symbol)
        } else {
            state.bindings.insert(symbol.to_string(), handles.clone())
        }
        .unwrap_or_default();
        for id in previous.difference(&handles) {
            if state.is_referenced(*id) {
                continue;
            }
            if let Some(set) = state.handles.remove(id) {
                if set.acquired {
                    self.record(*id, fact, meta, HandleState::Leaked);
                }
                let entry = self.ended.entry(*id).or_default();
                *entry = entry.union(set);
            }
        }
    }

    /// Extends the life of `handles` to `scope` when they are aliased by a
    /// symbol declared further out.
    pub fn widen_scope(&mut self, handles: &BTreeSet<HandleId>, scope: ScopeId, open: &[ScopeId]) {
        let depth = |s: ScopeId| open.iter().position(|o| *o == s);
        for id in handles {
            if let Some(info) = self.infos.get_mut(id) {
                if let (Some(new), Some(old)) = (depth(scope), depth(info.scope)) {
                    if new < old {
                        info.scope = scope;
                    }
                }
            }
        }
    }

    pub fn release(
        &mut self,
        state: &mut ResourceState,
        handles: &BTreeSet<HandleId>,
        fact: usize,
        meta: Meta,
    ) {
        for id in handles {
            if let Some(set) = state.handles.get_mut(id) {
                set.release();
                self.record(*id, fact, meta, HandleState::Closed);
            }
        }
    }

    pub fn escape(
        &mut self,
        state: &mut ResourceState,
        handles: &BTreeSet<HandleId>,
        fact: usize,
        meta: Meta,
    ) {
        for id in handles {
            if let Some(set) = state.handles.get_mut(id) {
                set.escape();
                self.record(*id, fact, meta, HandleState::Escaped);
            }
        }
    }

    pub fn pass(&mut self, state: &mut ResourceState, handles: &BTreeSet<HandleId>) {
        for id in handles {
            if let Some(set) = state.handles.get_mut(id) {
                set.passed = true;
            }
        }
    }

    /// Whether a handle acquired through one of `handles` is still open.
    pub fn open_dependents(&self, state: &ResourceState, handles: &BTreeSet<HandleId>) -> Tri {
        let mut result = Tri::False;
        for child in self.children(handles) {
            if let Some(set) = state.handles.get(&child.id) {
                if set.acquired && !set.closed && !set.escaped {
                    return Tri::True;
                }
                if set.acquired {
                    result = Tri::Unknown;
                }
            }
        }
        result
    }

    /// Ends the current path for every live handle selected by `within`.
    /// Their states are kept until the handle's scope exits.
    pub fn end_path<F>(&mut self, state: &mut ResourceState, within: F)
    where
        F: Fn(&HandleInfo) -> bool,
    {
        let ending: Vec<HandleId> = state
            .handles
            .keys()
            .copied()
            .filter(|id| self.infos.get(id).is_some_and(&within))
            .collect();
        for id in ending {
            if let Some(set) = state.handles.remove(&id) {
                let entry = self.ended.entry(id).or_default();
                *entry = entry.union(set);
            }
        }
    }

    /// Produces the reports of every handle whose life ends with `scope`.
    /// `state` is `None` when the current path is unreachable.
    pub fn finalize_scope(
        &mut self,
        state: Option<&mut ResourceState>,
        scope: ScopeId,
    ) -> Vec<HandleReport> {
        let ids: Vec<HandleId> = self
            .infos
            .values()
            .filter(|i| i.scope == scope && !self.reported.contains(&i.id))
            .map(|i| i.id)
            .collect();
        self.finalize(state, &ids)
    }

    /// Reports every handle not reported yet.
    pub fn finalize_all(&mut self, state: Option<&mut ResourceState>) -> Vec<HandleReport> {
        let ids: Vec<HandleId> = self
            .infos
            .keys()
            .copied()
            .filter(|id| !self.reported.contains(id))
            .collect();
        self.finalize(state, &ids)
    }

    fn finalize(&mut self, mut state: Option<&mut ResourceState>, ids: &[HandleId]) -> Vec<HandleReport> {
        let mut out = Vec::new();
        for id in ids {
            let mut set = self.ended.remove(id);
            if let Some(st) = state.as_deref_mut() {
                if let Some(live) = st.handles.remove(id) {
                    set = Some(set.unwrap_or_default().union(live));
                }
                for hs in st.bindings.values_mut() {
                    hs.remove(id);
                }
                st.bindings.retain(|_, hs| !hs.is_empty());
            }
            let Some(set) = set else {
                continue;
            };
            let Some(info) = self.infos.get(id) else {
                continue;
            };
            let outcome = set.outcome();
            out.push(HandleReport {
                id: *id,
                kind: info.kind.clone(),
                symbol: info.symbol.clone(),
                meta: info.meta,
                excerpt: info.excerpt.clone(),
                state: outcome,
                uncertain: set.passed && outcome == HandleState::Leaked,
                transitions: self.log.get(id).cloned().unwrap_or_default(),
            });
            self.reported.insert(*id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: HandleId, symbol: &str, scope: ScopeId, parent: Option<HandleId>) -> HandleInfo {
        HandleInfo {
            id,
            kind: "connection".into(),
            symbol: symbol.into(),
            scope,
            meta: Meta::new(id, 1),
            excerpt: String::new(),
            parent,
        }
    }

    #[test]
    fn joins_keep_every_possible_state() {
        let mut table = HandleTable::default();
        let mut a = ResourceState::default();
        table.acquire(&mut a, info(1, "c", 5, None), 1);
        let mut b = a.clone();
        table.release(&mut a, &BTreeSet::from([1]), 2, Meta::new(2, 1));
        a.join(&b);
        let reports = table.finalize_scope(Some(&mut a), 5);
        assert_eq!(reports[0].state, HandleState::Leaked);

        table.release(&mut b, &BTreeSet::from([1]), 3, Meta::new(3, 1));
        assert!(table.finalize_scope(Some(&mut b), 5).is_empty());
    }

    #[test]
    fn rebinding_ends_the_previous_handle() {
        let mut table = HandleTable::default();
        let mut st = ResourceState::default();
        table.acquire(&mut st, info(1, "c", 5, None), 1);
        table.acquire(&mut st, info(2, "c", 5, None), 2);
        let c = st.handles_of("c");
        table.release(&mut st, &c, 3, Meta::new(3, 1));
        let reports = table.finalize_scope(Some(&mut st), 5);
        let states: Vec<_> = reports.iter().map(|r| (r.id, r.state)).collect();
        assert_eq!(
            states,
            vec![(1, HandleState::Leaked), (2, HandleState::Closed)]
        );
    }

    #[test]
    fn reacquiring_an_open_instance_loses_it() {
        let mut table = HandleTable::default();
        let mut st = ResourceState::default();
        table.acquire(&mut st, info(1, "c", 5, None), 1);
        table.acquire(&mut st, info(1, "c", 5, None), 1);
        let c = st.handles_of("c");
        table.release(&mut st, &c, 3, Meta::new(3, 1));
        let reports = table.finalize_scope(Some(&mut st), 5);
        assert_eq!(reports[0].state, HandleState::Leaked);
        assert!(reports[0]
            .transitions
            .iter()
            .any(|t| t.to == HandleState::Leaked));
    }

    #[test]
    fn reacquiring_a_closed_instance_is_fine() {
        let mut table = HandleTable::default();
        let mut st = ResourceState::default();
        table.acquire(&mut st, info(1, "c", 5, None), 1);
        table.release(&mut st, &BTreeSet::from([1]), 2, Meta::new(2, 1));
        table.acquire(&mut st, info(1, "c", 5, None), 1);
        table.release(&mut st, &BTreeSet::from([1]), 2, Meta::new(2, 1));
        let reports = table.finalize_scope(Some(&mut st), 5);
        assert_eq!(reports[0].state, HandleState::Closed);
    }

    #[test]
    fn dependents_are_reported_while_open() {
        let mut table = HandleTable::default();
        let mut st = ResourceState::default();
        table.acquire(&mut st, info(1, "conn", 5, None), 1);
        table.acquire(&mut st, info(2, "stmt", 5, Some(1)), 2);
        let conn = st.handles_of("conn");
        assert_eq!(table.open_dependents(&st, &conn), Tri::True);
        let stmt = st.handles_of("stmt");
        table.release(&mut st, &stmt, 3, Meta::new(3, 1));
        assert_eq!(table.open_dependents(&st, &conn), Tri::False);
    }

    #[test]
    fn passed_handles_make_leaks_uncertain() {
        let mut table = HandleTable::default();
        let mut st = ResourceState::default();
        table.acquire(&mut st, info(1, "rs", 5, None), 1);
        table.pass(&mut st, &BTreeSet::from([1]));
        let reports = table.finalize_all(Some(&mut st));
        assert_eq!(reports[0].state, HandleState::Leaked);
        assert!(reports[0].uncertain);
    }
}
