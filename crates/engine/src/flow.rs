//! Forward pass over a unit's fact stream.
//!
//! [`Analyzer`] owns the flow state of the path being walked (resolver
//! environment, resource and transaction state) and a stack of frames
//! mirroring the open scopes. Frames remember the state at branch, loop and
//! try entry so that alternatives can be replayed from it and merged at the
//! scope's exit. Each processed fact yields [`FactEffects`]: the part of the
//! state before and after the fact that rule predicates look at.
//!
//! Loop and lambda bodies may run more than once. When the state at the end
//! of such a body, joined into the state the body started from, changes that
//! start state, the body is walked again from the joined state. The caller
//! rewinds to the fact named by [`FactEffects::repeat_from`].

use crate::resolver::{normalize_symbol, Resolver, SymbolEnv, ValueInfo};
use crate::resources::{HandleId, HandleInfo, HandleReport, HandleTable, LifeSet, ResourceState};
use crate::transactions::{self, MethodTxSummary, TxState};
use ir::{DeclOrigin, Fact, FactKind, Meta, Operand, ScopeId, ScopeKind, SourceUnit};
use loader::{HandleOp, Tri, TxOp, Vocabulary};
use std::collections::BTreeSet;
use tracing::debug;

/// Walks of one loop or lambda body before its exit is taken regardless.
const MAX_BODY_PASSES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub reachable: bool,
    pub env: SymbolEnv,
    pub resources: ResourceState,
    pub tx: TxState,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            reachable: true,
            env: SymbolEnv::default(),
            resources: ResourceState::default(),
            tx: TxState::default(),
        }
    }
}

impl FlowState {
    fn bottom() -> Self {
        Self {
            reachable: false,
            ..Default::default()
        }
    }

    fn size(&self) -> usize {
        1 + self.env.len() + self.resources.len() + self.tx.depth()
    }

    /// Least upper bound; an unreachable side contributes nothing.
    pub fn join(&mut self, other: &FlowState, vocab: &Vocabulary) {
        if !other.reachable {
            return;
        }
        if !self.reachable {
            *self = other.clone();
            return;
        }
        self.env.join(&other.env, vocab);
        self.resources.join(&other.resources);
        self.tx.join(&other.tx);
    }
}

#[derive(Debug, Clone)]
/// State observed around one fact.
pub struct FactEffects {
    pub reachable: bool,
    /// Receiver type and its ancestors; `None` when unresolved.
    pub receiver_types: Option<Vec<String>>,
    /// Possible states of the receiver's handles before the call.
    pub receiver_lives: Vec<LifeSet>,
    pub receiver_kinds: Vec<String>,
    pub args: Vec<ValueInfo>,
    pub parts: Vec<ValueInfo>,
    /// Assigned, stored, returned or built value.
    pub value: Option<ValueInfo>,
    pub handle_op: Option<HandleOp>,
    /// For releases: whether a handle derived from the released one is
    /// still open.
    pub open_dependents: Tri,
    pub tx_op: Option<TxOp>,
    /// Transaction contexts open before the fact.
    pub tx_before: TxState,
    /// Summary of the method being closed, or of the enclosing method so
    /// far for other facts.
    pub tx_summary: Option<MethodTxSummary>,
    /// For scope exits: location of the matching scope entry.
    pub anchor: Option<(Meta, String)>,
    /// Handles whose life ended with this fact.
    pub ended: Vec<HandleReport>,
    /// Set on the exit of a loop or lambda body that must be walked again:
    /// index of the body's first fact.
    pub repeat_from: Option<usize>,
}

impl FactEffects {
    pub(crate) fn new(state: &FlowState) -> Self {
        Self {
            reachable: state.reachable,
            receiver_types: None,
            receiver_lives: Vec::new(),
            receiver_kinds: Vec::new(),
            args: Vec::new(),
            parts: Vec::new(),
            value: None,
            handle_op: None,
            open_dependents: Tri::False,
            tx_op: None,
            tx_before: state.tx.clone(),
            tx_summary: None,
            anchor: None,
            ended: Vec::new(),
            repeat_from: None,
        }
    }
}

#[derive(Debug)]
struct Frame {
    id: ScopeId,
    kind: ScopeKind,
    meta: Meta,
    excerpt: String,
    /// Index of the fact that opened the scope.
    start: usize,
    passes: usize,
    entry: Option<FlowState>,
    out: Option<FlowState>,
    body_end: Option<FlowState>,
    arms: usize,
    tx_base: usize,
    summary: Option<MethodTxSummary>,
    declarative_class: bool,
}

impl Frame {
    fn new(id: ScopeId, kind: ScopeKind, fact: &Fact) -> Self {
        Self {
            id,
            kind,
            meta: fact.meta,
            excerpt: fact.excerpt.clone(),
            start: fact.index,
            passes: 1,
            entry: None,
            out: None,
            body_end: None,
            arms: 0,
            tx_base: 0,
            summary: None,
            declarative_class: false,
        }
    }
}

pub struct Analyzer<'a> {
    vocab: &'a Vocabulary,
    resolver: Resolver<'a>,
    state: FlowState,
    frames: Vec<Frame>,
    handles: HandleTable,
    imports: Vec<String>,
    methods: Vec<MethodTxSummary>,
    /// Work units spent so far: one per fact plus the size of every merge.
    pub steps: usize,
}

impl<'a> Analyzer<'a> {
    pub fn new(vocab: &'a Vocabulary, unit: &'a SourceUnit) -> Self {
        Self {
            vocab,
            resolver: Resolver::new(vocab, &unit.symbol_hints),
            state: FlowState::default(),
            frames: Vec::new(),
            handles: HandleTable::default(),
            imports: Vec::new(),
            methods: Vec::new(),
            steps: 0,
        }
    }

    pub fn reachable(&self) -> bool {
        self.state.reachable
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Summaries of every method closed so far, in closing order.
    pub fn method_summaries(&self) -> &[MethodTxSummary] {
        &self.methods
    }

    /// Kind of the innermost open scope.
    pub fn innermost_scope(&self) -> Option<&ScopeKind> {
        self.frames.last().map(|f| &f.kind)
    }

    fn current_scope(&self) -> ScopeId {
        self.frames.last().map(|f| f.id).unwrap_or(0)
    }

    fn open_scopes(&self) -> Vec<ScopeId> {
        std::iter::once(0)
            .chain(self.frames.iter().map(|f| f.id))
            .collect()
    }

    fn this_type(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match &f.kind {
            ScopeKind::Class { name } => Some(name.as_str()),
            _ => None,
        })
    }

    fn method_summary_mut(&mut self) -> Option<&mut MethodTxSummary> {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| matches!(f.kind, ScopeKind::Method { .. }))
            .and_then(|f| f.summary.as_mut())
    }

    fn merge(&mut self, into: &mut FlowState, other: &FlowState) {
        self.steps += other.size();
        into.join(other, self.vocab);
    }

    fn symbol_handles(&self, op: Option<&Operand>) -> BTreeSet<HandleId> {
        match op.and_then(Operand::as_symbol) {
            Some(s) => self.state.resources.handles_of(normalize_symbol(s)),
            None => BTreeSet::new(),
        }
    }

    fn is_field(&self, symbol: &str) -> bool {
        if symbol.starts_with("this.") {
            return true;
        }
        match self.state.env.get(symbol) {
            Some(b) => b.origin == DeclOrigin::Field,
            None => self.resolver.hints.contains_key(symbol),
        }
    }

    /// Processes one fact and returns what rules may observe about it.
    pub fn step(&mut self, fact: &Fact) -> FactEffects {
        self.steps += 1;
        let mut fx = FactEffects::new(&self.state);
        match &fact.kind {
            FactKind::ScopeEnter { id, scope } => self.enter_scope(*id, scope, fact),
            FactKind::ScopeExit { id, .. } => self.exit_scope(*id, &mut fx),
            FactKind::Import { path } => self.imports.push(path.clone()),
            _ if !self.state.reachable => {}
            FactKind::Declare {
                symbol,
                declared_type,
                origin,
            } => {
                let scope = self.current_scope();
                self.state.env.declare(
                    &self.resolver,
                    symbol,
                    declared_type.as_deref(),
                    *origin,
                    scope,
                );
            }
            FactKind::Assign { symbol, value } => self.assign(fact, symbol, value, &mut fx),
            FactKind::Call {
                receiver,
                method,
                args,
                result,
            } => self.call(fact, receiver.as_ref(), method, args, result.as_deref(), &mut fx),
            FactKind::AnnotationAttach {
                target_kind, name, ..
            } => self.annotation(fact, *target_kind, name),
            FactKind::StringBuild { result, parts } => {
                let infos: Vec<ValueInfo> = parts
                    .iter()
                    .map(|p| self.resolver.value(&self.state.env, p))
                    .collect();
                let built = self.resolver.string_build(&infos);
                let scope = self.current_scope();
                self.state
                    .env
                    .assign(&self.resolver, result, built.clone(), scope);
                fx.parts = infos;
                fx.value = Some(built);
            }
            FactKind::Return { value } => {
                fx.value = value.as_ref().map(|v| self.resolver.value(&self.state.env, v));
                let handles = self.symbol_handles(value.as_ref());
                self.handles
                    .escape(&mut self.state.resources, &handles, fact.index, fact.meta);
                self.leave(false);
            }
            FactKind::Throw { value } => {
                fx.value = value.as_ref().map(|v| self.resolver.value(&self.state.env, v));
                self.leave(true);
            }
            FactKind::FieldStore { field, value } => {
                let v = self.resolver.value(&self.state.env, value);
                let handles = self.symbol_handles(Some(value));
                self.handles
                    .escape(&mut self.state.resources, &handles, fact.index, fact.meta);
                self.state.env.store_field(&self.resolver, field, v.clone());
                fx.value = Some(v);
            }
        }
        if matches!(fact.kind, FactKind::Call { .. } | FactKind::ScopeExit { .. })
            || fx.tx_op.is_some()
        {
            fx.tx_summary = fx
                .tx_summary
                .take()
                .or_else(|| {
                    self.frames
                        .iter()
                        .rev()
                        .find(|f| matches!(f.kind, ScopeKind::Method { .. }))
                        .and_then(|f| f.summary.clone())
                });
        }
        fx
    }

    fn assign(&mut self, fact: &Fact, symbol: &str, value: &Operand, fx: &mut FactEffects) {
        let v = self.resolver.value(&self.state.env, value);
        let handles = self.symbol_handles(Some(value));
        let target = normalize_symbol(symbol);
        if !handles.is_empty() && self.is_field(symbol) {
            self.handles
                .escape(&mut self.state.resources, &handles, fact.index, fact.meta);
        }
        let scope = self
            .state
            .env
            .get(target)
            .map(|b| b.scope)
            .unwrap_or_else(|| self.current_scope());
        if !handles.is_empty() {
            let open = self.open_scopes();
            self.handles.widen_scope(&handles, scope, &open);
        }
        self.handles.bind(
            &mut self.state.resources,
            target,
            handles,
            fact.index,
            fact.meta,
        );
        let current = self.current_scope();
        self.state.env.assign(&self.resolver, symbol, v.clone(), current);
        fx.value = Some(v);
    }

    fn call(
        &mut self,
        fact: &Fact,
        receiver: Option<&Operand>,
        method: &str,
        args: &[Operand],
        result: Option<&str>,
        fx: &mut FactEffects,
    ) {
        let env = &self.state.env;
        let receiver_value = receiver.map(|r| self.resolver.value(env, r));
        let types = self.resolver.receiver_types(env, receiver, self.this_type());
        let arg_values: Vec<ValueInfo> = args.iter().map(|a| self.resolver.value(env, a)).collect();
        let receiver_handles = self.symbol_handles(receiver);

        fx.receiver_types = types.clone();
        fx.args = arg_values.clone();
        for id in &receiver_handles {
            if let Some(set) = self.state.resources.life(*id) {
                fx.receiver_lives.push(set);
            }
            if let Some(info) = self.handles.info(*id) {
                if !fx.receiver_kinds.contains(&info.kind) {
                    fx.receiver_kinds.push(info.kind.clone());
                }
            }
        }

        if let Some(op) = self.vocab.tx_op(types.as_deref(), method, args) {
            fx.tx_op = Some(op);
            let mut tx = std::mem::take(&mut self.state.tx);
            transactions::apply_op(&mut tx, self.method_summary_mut(), op, fact.meta);
            self.state.tx = tx;
        }

        let arg_handles: BTreeSet<HandleId> = args
            .iter()
            .flat_map(|a| self.symbol_handles(Some(a)))
            .collect();
        let acquisition = self
            .vocab
            .acquisition(types.as_deref(), method)
            .map(|k| k.kind.clone());
        let releases = receiver_handles.iter().any(|id| {
            self.handles
                .info(*id)
                .and_then(|i| self.vocab.resource_kind(&i.kind))
                .is_some_and(|k| k.release.iter().any(|m| m == method))
        });

        if let Some(kind) = acquisition {
            fx.handle_op = Some(HandleOp::Acquire);
            let symbol = result
                .map(|r| normalize_symbol(r).to_string())
                .unwrap_or_else(|| format!("$discarded{}", fact.index));
            let scope = self
                .state
                .env
                .get(&symbol)
                .map(|b| b.scope)
                .filter(|s| self.open_scopes().contains(s))
                .unwrap_or_else(|| self.current_scope());
            let info = HandleInfo {
                id: fact.index,
                kind,
                symbol: symbol.clone(),
                scope,
                meta: fact.meta,
                excerpt: fact.excerpt.clone(),
                parent: receiver_handles.iter().next().copied(),
            };
            debug!(handle = fact.index, symbol = %symbol, kind = %info.kind, "Resource acquired");
            self.handles
                .acquire(&mut self.state.resources, info, fact.index);
            if result.is_some_and(|r| self.is_field(r)) {
                self.handles.escape(
                    &mut self.state.resources,
                    &BTreeSet::from([fact.index]),
                    fact.index,
                    fact.meta,
                );
            }
        } else if releases {
            fx.handle_op = Some(HandleOp::Release);
            fx.open_dependents = self
                .handles
                .open_dependents(&self.state.resources, &receiver_handles);
            self.handles.release(
                &mut self.state.resources,
                &receiver_handles,
                fact.index,
                fact.meta,
            );
        } else if self.vocab.is_closer(types.as_deref(), method) {
            fx.handle_op = Some(HandleOp::Release);
            fx.open_dependents = self
                .handles
                .open_dependents(&self.state.resources, &arg_handles);
            self.handles
                .release(&mut self.state.resources, &arg_handles, fact.index, fact.meta);
        } else if self.vocab.is_transfer(types.as_deref(), method) {
            fx.handle_op = Some(HandleOp::Transfer);
            self.handles
                .escape(&mut self.state.resources, &arg_handles, fact.index, fact.meta);
        } else if !arg_handles.is_empty() {
            self.handles.pass(&mut self.state.resources, &arg_handles);
        }

        if let Some(res) = result {
            let value = self.resolver.call_result(
                receiver,
                receiver_value.as_ref(),
                types.as_deref(),
                method,
                &arg_values,
            );
            if fx.handle_op != Some(HandleOp::Acquire) {
                self.handles.bind(
                    &mut self.state.resources,
                    normalize_symbol(res),
                    BTreeSet::new(),
                    fact.index,
                    fact.meta,
                );
            }
            let scope = self.current_scope();
            self.state.env.assign(&self.resolver, res, value, scope);
        }
    }

    fn annotation(&mut self, fact: &Fact, target_kind: ir::TargetKind, name: &str) {
        if !self.vocab.is_declarative(name) {
            return;
        }
        match target_kind {
            ir::TargetKind::Method => {
                let mut tx = std::mem::take(&mut self.state.tx);
                if let Some(summary) = self.method_summary_mut() {
                    transactions::enter_declarative(&mut tx, summary, fact.meta);
                }
                self.state.tx = tx;
            }
            ir::TargetKind::Class => {
                if let Some(f) = self
                    .frames
                    .iter_mut()
                    .rev()
                    .find(|f| matches!(f.kind, ScopeKind::Class { .. }))
                {
                    f.declarative_class = true;
                }
            }
            _ => {}
        }
    }

    /// Handles a `return` (or `throw` when `throwing`). The path ends unless
    /// a `finally` (or, for throws, a `catch`) between here and the
    /// enclosing function still runs.
    fn leave(&mut self, throwing: bool) {
        let function = self
            .frames
            .iter()
            .rposition(|f| f.kind.is_function());
        let start = function.map(|i| i + 1).unwrap_or(0);
        for i in start..self.frames.len() {
            if let ScopeKind::Try {
                has_catch,
                has_finally,
            } = self.frames[i].kind
            {
                let in_body = self
                    .frames
                    .get(i + 1)
                    .is_some_and(|f| matches!(f.kind, ScopeKind::Arm));
                if has_finally || (throwing && has_catch && in_body) {
                    return;
                }
            }
        }
        for i in (start..self.frames.len()).rev() {
            if let ScopeKind::ResourceGuard { guarded } = &self.frames[i].kind {
                for sym in guarded.iter().rev() {
                    let hs = self.state.resources.handles_of(normalize_symbol(sym));
                    let meta = self.frames[i].meta;
                    self.handles.release(&mut self.state.resources, &hs, 0, meta);
                }
            }
        }
        if let Some(fi) = function {
            let base = self.frames[fi].tx_base;
            if let Some(summary) = self.frames[fi].summary.as_mut() {
                transactions::leave_method(&self.state.tx, summary, base);
            }
        }
        let open = self.open_scopes();
        let from = function.map(|i| i + 1).unwrap_or(0);
        let inside: Vec<ScopeId> = open[from..].to_vec();
        self.handles
            .end_path(&mut self.state.resources, |info| inside.contains(&info.scope));
        self.state = FlowState::bottom();
    }

    fn enter_scope(&mut self, id: ScopeId, scope: &ScopeKind, fact: &Fact) {
        let mut frame = Frame::new(id, scope.clone(), fact);
        match scope {
            ScopeKind::Method { name, .. } => {
                frame.entry = Some(self.state.clone());
                self.state.reachable = true;
                frame.tx_base = self.state.tx.depth();
                let mut summary = MethodTxSummary::new(name.clone(), fact.meta);
                let class_declarative = self
                    .frames
                    .iter()
                    .rev()
                    .find(|f| matches!(f.kind, ScopeKind::Class { .. }))
                    .is_some_and(|f| f.declarative_class);
                if class_declarative {
                    transactions::enter_declarative(&mut self.state.tx, &mut summary, fact.meta);
                }
                frame.summary = Some(summary);
            }
            ScopeKind::Lambda | ScopeKind::Loop | ScopeKind::Branch { .. } | ScopeKind::Try { .. } => {
                frame.entry = Some(self.state.clone());
            }
            ScopeKind::Arm => {
                if let Some(parent) = self.frames.last_mut() {
                    let index = parent.arms;
                    parent.arms += 1;
                    if let ScopeKind::Branch { null_check, .. } = &parent.kind {
                        let mut state = parent.entry.clone().unwrap_or_else(FlowState::bottom);
                        if let Some(nc) = null_check {
                            if index == usize::from(nc.non_null_in_first) {
                                state.resources.refine_null(normalize_symbol(&nc.symbol));
                            }
                        }
                        self.state = state;
                    }
                }
            }
            ScopeKind::Catch => {
                let vocab = self.vocab;
                if let Some(parent) = self.frames.last_mut() {
                    if matches!(parent.kind, ScopeKind::Try { .. }) {
                        if parent.body_end.is_none() {
                            parent.body_end = Some(self.state.clone());
                            let mut out = parent.out.take().unwrap_or_else(FlowState::bottom);
                            out.join(&self.state, vocab);
                            parent.out = Some(out);
                        }
                        let mut start = parent.entry.clone().unwrap_or_else(FlowState::bottom);
                        if let Some(body) = &parent.body_end {
                            start.join(body, vocab);
                        }
                        self.steps += start.size();
                        self.state = start;
                    }
                }
            }
            _ => {}
        }
        self.frames.push(frame);
    }

    fn exit_scope(&mut self, id: ScopeId, fx: &mut FactEffects) {
        if !self.frames.iter().any(|f| f.id == id) {
            debug!(scope = id, "Exit of a scope that is not open");
            return;
        }
        while let Some(mut frame) = self.frames.pop() {
            let done = frame.id == id;
            if done && self.back_edge(&mut frame) {
                fx.repeat_from = Some(frame.start + 1);
                self.frames.push(frame);
                return;
            }
            self.close_frame(frame, fx);
            if done {
                break;
            }
        }
    }

    /// Joins the end of a loop or lambda body into the state the body
    /// started from. Returns true when the start state grew; the body then
    /// restarts from it. The transaction stack at the body's start stays the
    /// one it was entered with.
    fn back_edge(&mut self, frame: &mut Frame) -> bool {
        if !matches!(frame.kind, ScopeKind::Loop | ScopeKind::Lambda)
            || !self.state.reachable
            || frame.passes >= MAX_BODY_PASSES
        {
            return false;
        }
        let Some(entry) = frame.entry.take() else {
            return false;
        };
        let mut head = entry.clone();
        let end = self.state.clone();
        self.merge(&mut head, &end);
        head.tx = entry.tx.clone();
        if head == entry {
            frame.entry = Some(entry);
            return false;
        }
        frame.passes += 1;
        debug!(scope = frame.id, pass = frame.passes, "Body walked again from joined state");
        self.state = head.clone();
        frame.entry = Some(head);
        true
    }

    fn close_frame(&mut self, mut frame: Frame, fx: &mut FactEffects) {
        if let ScopeKind::ResourceGuard { guarded } = &frame.kind {
            if self.state.reachable {
                for sym in guarded.iter().rev() {
                    let hs = self.state.resources.handles_of(normalize_symbol(sym));
                    self.handles
                        .release(&mut self.state.resources, &hs, 0, frame.meta);
                }
            }
        }
        if matches!(frame.kind, ScopeKind::Lambda | ScopeKind::Loop) {
            let mut merged = frame.entry.take().unwrap_or_default();
            let end = std::mem::replace(&mut self.state, FlowState::bottom());
            self.merge(&mut merged, &end);
            self.state = merged;
        }
        let reachable = self.state.reachable;
        let ended = self
            .handles
            .finalize_scope(reachable.then_some(&mut self.state.resources), frame.id);
        fx.ended.extend(ended);
        self.state.env.exit_scope(frame.id);
        fx.anchor = Some((frame.meta, frame.excerpt.clone()));

        match &frame.kind {
            ScopeKind::Method { .. } => {
                if let Some(mut summary) = frame.summary.take() {
                    if self.state.reachable {
                        transactions::leave_method(&self.state.tx, &mut summary, frame.tx_base);
                    }
                    fx.tx_summary = Some(summary.clone());
                    // Bodies walked again close the same method more than once.
                    match self
                        .methods
                        .iter_mut()
                        .find(|m| m.meta == summary.meta && m.method == summary.method)
                    {
                        Some(existing) => *existing = summary,
                        None => self.methods.push(summary),
                    }
                }
                let mut restored = frame.entry.take().unwrap_or_default();
                transactions::close_method(&mut restored.tx, frame.tx_base);
                self.state = restored;
            }
            ScopeKind::Arm | ScopeKind::Catch => {
                let end = self.state.clone();
                let vocab = self.vocab;
                if let Some(parent) = self.frames.last_mut() {
                    if matches!(frame.kind, ScopeKind::Arm)
                        && matches!(parent.kind, ScopeKind::Try { .. })
                        && parent.body_end.is_none()
                    {
                        parent.body_end = Some(end.clone());
                    }
                    let mut out = parent.out.take().unwrap_or_else(FlowState::bottom);
                    out.join(&end, vocab);
                    parent.out = Some(out);
                }
                self.steps += end.size();
            }
            ScopeKind::Branch {
                exhaustive,
                null_check,
            } => {
                let mut out = frame.out.take().unwrap_or_else(FlowState::bottom);
                if !exhaustive || frame.arms == 0 {
                    let mut implicit = frame.entry.take().unwrap_or_default();
                    if let Some(nc) = null_check {
                        if frame.arms == usize::from(nc.non_null_in_first) {
                            implicit.resources.refine_null(normalize_symbol(&nc.symbol));
                        }
                    }
                    self.merge(&mut out, &implicit);
                }
                self.state = out;
            }
            ScopeKind::Try { .. } => {
                if frame.arms > 0 || frame.body_end.is_some() {
                    self.state = frame.out.take().unwrap_or_else(FlowState::bottom);
                }
            }
            _ => {}
        }
    }

    /// Ends the unit: every handle still tracked is reported.
    pub fn finish(&mut self) -> Vec<HandleReport> {
        let reachable = self.state.reachable;
        self.handles
            .finalize_all(reachable.then_some(&mut self.state.resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{HandleState, UnitBuilder};
    use loader::VocabularyDoc;

    fn vocab() -> Vocabulary {
        let doc: VocabularyDoc = serde_yaml::from_str(
            r#"
resources:
  - kind: connection
    acquire: ["DataSource.getConnection"]
returns:
  "DataSource.getConnection": Connection
transactions:
  begin:
    - call: Connection.setAutoCommit
      arg: 0
      equals: "false"
  commit: ["Connection.commit"]
  rollback: ["Connection.rollback"]
  declarative: [Transactional]
"#,
        )
        .unwrap();
        Vocabulary::compile(&doc).unwrap()
    }

    fn run(unit: &SourceUnit, vocab: &Vocabulary) -> (Vec<HandleReport>, Vec<MethodTxSummary>) {
        let mut a = Analyzer::new(vocab, unit);
        let mut reports = Vec::new();
        let mut next = 0;
        while let Some(f) = unit.facts.get(next) {
            let fx = a.step(f);
            next = fx.repeat_from.unwrap_or(next + 1);
            reports.extend(fx.ended);
        }
        reports.extend(a.finish());
        (reports, a.method_summaries().to_vec())
    }

    fn method(b: &mut UnitBuilder) -> ScopeId {
        b.enter(ScopeKind::Class { name: "Dao".into() });
        let m = b.enter(ScopeKind::Method {
            name: "load".into(),
            modifiers: vec![],
        });
        b.declare("ds", Some("DataSource"), DeclOrigin::Parameter);
        m
    }

    #[test]
    fn release_in_one_arm_only_leaks() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.enter(ScopeKind::Branch {
            exhaustive: false,
            null_check: None,
        });
        b.enter(ScopeKind::Arm);
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        b.exit();
        b.exit();
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, HandleState::Leaked);
    }

    #[test]
    fn null_guarded_close_in_finally_is_complete() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.assign("c", Operand::Null);
        b.enter(ScopeKind::Try {
            has_catch: false,
            has_finally: true,
        });
        b.enter(ScopeKind::Arm);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.exit();
        b.exit();
        b.enter(ScopeKind::Finally);
        b.enter(ScopeKind::Branch {
            exhaustive: false,
            null_check: Some(ir::NullCheck {
                symbol: "c".into(),
                non_null_in_first: true,
            }),
        });
        b.enter(ScopeKind::Arm);
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports[0].state, HandleState::Closed);
    }

    #[test]
    fn early_return_without_release_leaks() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.enter(ScopeKind::Branch {
            exhaustive: false,
            null_check: None,
        });
        b.enter(ScopeKind::Arm);
        b.ret(None);
        b.exit();
        b.exit();
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports[0].state, HandleState::Leaked);
    }

    #[test]
    fn returned_handle_escapes() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.ret(Some(Operand::symbol("c")));
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports[0].state, HandleState::Escaped);
    }

    #[test]
    fn guard_closes_on_return() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.enter(ScopeKind::ResourceGuard {
            guarded: vec!["c".into()],
        });
        b.declare("c", Some("Connection"), DeclOrigin::Resource);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.ret(Some(Operand::literal("done")));
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports[0].state, HandleState::Closed);
    }

    #[test]
    fn commit_on_one_path_leaves_begin_unmatched() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.call(
            Some(Operand::symbol("c")),
            "setAutoCommit",
            vec![Operand::Constant {
                value: "false".into(),
            }],
            None,
        );
        b.enter(ScopeKind::Branch {
            exhaustive: false,
            null_check: None,
        });
        b.enter(ScopeKind::Arm);
        b.call(Some(Operand::symbol("c")), "commit", vec![], None);
        b.exit();
        b.exit();
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        let (_, methods) = run(&b.finish(), &v);
        assert_eq!(methods.len(), 1);
        assert!(methods[0].unmatched_begin);
        assert_eq!(methods[0].begins, 1);
    }

    #[test]
    fn reacquiring_in_a_loop_loses_the_previous_connection() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.assign("c", Operand::Null);
        b.enter(ScopeKind::Loop);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.exit();
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        let (reports, _) = run(&b.finish(), &v);
        let states: Vec<_> = reports.iter().map(|r| (r.symbol.as_str(), r.state)).collect();
        assert_eq!(states, vec![("c", HandleState::Leaked)]);
    }

    #[test]
    fn acquire_and_close_in_each_iteration_is_closed() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.enter(ScopeKind::Loop);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        b.exit();
        let (reports, _) = run(&b.finish(), &v);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, HandleState::Closed);
    }

    #[test]
    fn loop_body_is_walked_until_its_start_state_is_stable() {
        let v = vocab();
        let mut b = UnitBuilder::new("A.java", "java");
        method(&mut b);
        b.declare("name", Some("String"), DeclOrigin::Parameter);
        b.declare("q", Some("String"), DeclOrigin::Local);
        b.assign("q", Operand::literal("SELECT 1"));
        let enter = b.enter(ScopeKind::Loop);
        b.string_build("q", vec![Operand::symbol("q"), Operand::symbol("name")]);
        b.exit();
        let unit = b.finish();

        let mut a = Analyzer::new(&v, &unit);
        let mut repeats = 0;
        let mut next = 0;
        while let Some(f) = unit.facts.get(next) {
            let fx = a.step(f);
            if let Some(start) = fx.repeat_from {
                assert!(matches!(
                    unit.facts[start - 1].kind,
                    FactKind::ScopeEnter { id, .. } if id == enter
                ));
                repeats += 1;
            }
            next = fx.repeat_from.unwrap_or(next + 1);
        }
        assert_eq!(repeats, 1);
        let q = a.state().env.get("q").expect("q bound after the loop");
        assert_eq!(q.constant, None);
        assert_ne!(q.taint, crate::taint::TaintLabel::Literal);
    }
}
