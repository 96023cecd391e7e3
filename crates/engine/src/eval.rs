//! Three-valued interpretation of compiled predicates.
//!
//! A predicate is evaluated against a [`Subject`]: either one fact together
//! with the tracker effects observed around it, or the end-of-life report of
//! a resource handle. Predicates that do not apply to the subject's shape
//! answer `False`; questions about state the resolver could not pin down
//! answer `Unknown`.

use crate::custom::CustomRegistry;
use crate::flow::FactEffects;
use crate::resolver::ValueInfo;
use crate::resources::{HandleReport, LifeSet};
use anyhow::anyhow;
use ir::{Fact, FactKind, HandleState, Operand, TxKind};
use loader::{ArgSelector, Predicate, Tri};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub enum Subject<'s> {
    Fact {
        fact: &'s Fact,
        fx: &'s FactEffects,
    },
    Handle(&'s HandleReport),
}

/// Everything a predicate may look at.
pub struct EvalContext<'s> {
    pub subject: Subject<'s>,
    /// Imports seen in the unit so far.
    pub imports: &'s [String],
    pub policies: &'s BTreeMap<String, bool>,
    pub custom: &'s CustomRegistry,
}

impl<'s> EvalContext<'s> {
    pub fn fact(&self) -> Option<(&'s Fact, &'s FactEffects)> {
        match self.subject {
            Subject::Fact { fact, fx } => Some((fact, fx)),
            Subject::Handle(_) => None,
        }
    }

    pub fn handle(&self) -> Option<&'s HandleReport> {
        match self.subject {
            Subject::Handle(h) => Some(h),
            Subject::Fact { .. } => None,
        }
    }

    /// Operands of the current call, if it is one.
    fn call_args(&self) -> Option<(&'s [Operand], &'s [ValueInfo])> {
        let (fact, fx) = self.fact()?;
        match &fact.kind {
            FactKind::Call { args, .. } => Some((args.as_slice(), fx.args.as_slice())),
            _ => None,
        }
    }
}

fn selected<T>(items: &[T], sel: ArgSelector) -> Vec<&T> {
    match sel {
        ArgSelector::Index(i) => items.get(i).into_iter().collect(),
        ArgSelector::Any => items.iter().collect(),
        ArgSelector::Last => items.last().into_iter().collect(),
    }
}

fn any_of<I: IntoIterator<Item = Tri>>(items: I) -> Tri {
    items.into_iter().fold(Tri::False, Tri::or)
}

/// Whether a value is a compile-time constant. Null is not.
fn literal_value(op: Option<&Operand>, v: &ValueInfo) -> Tri {
    if matches!(op, Some(Operand::Null)) {
        return Tri::False;
    }
    if v.constant.is_some() {
        Tri::True
    } else if v.unresolved {
        Tri::Unknown
    } else {
        Tri::False
    }
}

fn value_text(op: &Operand, v: &ValueInfo) -> String {
    match &v.constant {
        Some(c) => c.clone(),
        None => match op {
            Operand::Literal { value } => value.clone(),
            other => other.text(),
        },
    }
}

/// State query over the receiver's handles: `True` when the state is the
/// only possibility for every handle, `Unknown` when it is one of several.
fn lives_in(lives: &[LifeSet], state: HandleState) -> Tri {
    if lives.is_empty() {
        return Tri::False;
    }
    let states = [HandleState::Acquired, HandleState::Closed, HandleState::Escaped];
    let mut result = Tri::True;
    for l in lives {
        if !l.may_be(state) {
            return Tri::False;
        }
        if states.iter().filter(|s| l.may_be(**s)).count() > 1 {
            result = Tri::Unknown;
        }
    }
    result
}

fn report_state(h: &HandleReport, state: HandleState) -> Tri {
    if h.uncertain && matches!(state, HandleState::Leaked | HandleState::Escaped) {
        return Tri::Unknown;
    }
    (h.state == state).into()
}

fn fact_symbol(fact: &Fact) -> Option<&str> {
    match &fact.kind {
        FactKind::Declare { symbol, .. } | FactKind::Assign { symbol, .. } => Some(symbol.as_str()),
        FactKind::FieldStore { field, .. } => Some(field.as_str()),
        FactKind::StringBuild { result, .. } => Some(result.as_str()),
        FactKind::AnnotationAttach { target, .. } => Some(target.as_str()),
        FactKind::Call { result, .. } => result.as_deref(),
        _ => None,
    }
}

fn fact_value(fact: &Fact) -> Option<&Operand> {
    match &fact.kind {
        FactKind::Assign { value, .. } | FactKind::FieldStore { value, .. } => Some(value),
        FactKind::Return { value } | FactKind::Throw { value } => value.as_ref(),
        _ => None,
    }
}

/// Evaluates `p`. Only custom predicates can fail.
pub fn eval(p: &Predicate, ctx: &EvalContext<'_>) -> anyhow::Result<Tri> {
    Ok(match p {
        Predicate::Always(b) => (*b).into(),
        Predicate::All(ps) => {
            let mut acc = Tri::True;
            for q in ps {
                acc = acc.and(eval(q, ctx)?);
                if acc == Tri::False {
                    break;
                }
            }
            acc
        }
        Predicate::Any(ps) => {
            let mut acc = Tri::False;
            for q in ps {
                acc = acc.or(eval(q, ctx)?);
                if acc == Tri::True {
                    break;
                }
            }
            acc
        }
        Predicate::Not(q) => !eval(q, ctx)?,
        Predicate::Policy(name) => ctx.policies.get(name).copied().unwrap_or(false).into(),
        Predicate::Custom(name) => {
            let custom = ctx
                .custom
                .get(name)
                .ok_or_else(|| anyhow!("custom predicate '{name}' is not registered"))?;
            custom.evaluate(ctx)?
        }
        Predicate::Imports(pat) => ctx.imports.iter().any(|i| pat.matches(i)).into(),
        Predicate::HandleState(state) => match ctx.subject {
            Subject::Handle(h) => report_state(h, *state),
            Subject::Fact { fx, .. } => lives_in(&fx.receiver_lives, *state),
        },
        Predicate::HandleKind(pat) => match ctx.subject {
            Subject::Handle(h) => pat.matches(&h.kind).into(),
            Subject::Fact { fx, .. } => fx.receiver_kinds.iter().any(|k| pat.matches(k)).into(),
        },
        Predicate::SymbolName(re) => match ctx.subject {
            Subject::Handle(h) => re.is_match(&h.symbol).into(),
            Subject::Fact { fact, .. } => fact_symbol(fact).is_some_and(|s| re.is_match(s)).into(),
        },
        other => match ctx.subject {
            Subject::Fact { fact, fx } => eval_fact(other, ctx, fact, fx),
            Subject::Handle(_) => Tri::False,
        },
    })
}

fn eval_fact(p: &Predicate, ctx: &EvalContext<'_>, fact: &Fact, fx: &FactEffects) -> Tri {
    match p {
        Predicate::CallTo(sig) => match &fact.kind {
            FactKind::Call { method, .. } => sig.match_call(fx.receiver_types.as_deref(), method),
            _ => Tri::False,
        },
        Predicate::ReceiverType(pat) => match &fact.kind {
            FactKind::Call { .. } => match &fx.receiver_types {
                Some(types) => types.iter().any(|t| pat.matches(t)).into(),
                None => Tri::Unknown,
            },
            _ => Tri::False,
        },
        Predicate::ArgCount(n) => ctx
            .call_args()
            .is_some_and(|(args, _)| args.len() >= *n)
            .into(),
        Predicate::ArgTainted(sel) => match ctx.call_args() {
            Some((_, values)) => any_of(selected(values, *sel).into_iter().map(|v| v.taint.is_tainted())),
            None => Tri::False,
        },
        Predicate::ArgLiteral(sel) => match ctx.call_args() {
            Some((args, values)) => {
                let pairs: Vec<(&Operand, &ValueInfo)> = args.iter().zip(values).collect();
                any_of(
                    selected(&pairs, *sel)
                        .into_iter()
                        .map(|&(op, v)| literal_value(Some(op), v)),
                )
            }
            None => Tri::False,
        },
        Predicate::ArgMatches { arg, pattern } => match ctx.call_args() {
            Some((args, values)) => {
                let pairs: Vec<(&Operand, &ValueInfo)> = args.iter().zip(values).collect();
                selected(&pairs, *arg)
                    .into_iter()
                    .any(|&(op, v)| pattern.is_match(&value_text(op, v)))
                    .into()
            }
            None => Tri::False,
        },
        Predicate::PartTainted => match &fact.kind {
            FactKind::StringBuild { .. } => any_of(fx.parts.iter().map(|v| v.taint.is_tainted())),
            _ => Tri::False,
        },
        Predicate::PartMatches(re) => match &fact.kind {
            FactKind::StringBuild { parts, .. } => parts
                .iter()
                .zip(&fx.parts)
                .any(|(op, v)| v.constant.as_deref().is_some_and(|c| re.is_match(c)) && op.is_literal())
                .into(),
            _ => Tri::False,
        },
        Predicate::Annotation(pat) => match &fact.kind {
            FactKind::AnnotationAttach { name, .. } => pat.matches(name).into(),
            _ => Tri::False,
        },
        Predicate::AnnotationArg { name, pattern } => match &fact.kind {
            FactKind::AnnotationAttach { args, .. } => args
                .get(name)
                .is_some_and(|op| {
                    let text = match op {
                        Operand::Literal { value } | Operand::Constant { value } => value.clone(),
                        other => other.text(),
                    };
                    pattern.is_match(&text)
                })
                .into(),
            _ => Tri::False,
        },
        Predicate::TargetKind(kind) => match &fact.kind {
            FactKind::AnnotationAttach { target_kind, .. } => (target_kind == kind).into(),
            _ => Tri::False,
        },
        Predicate::TargetHasModifier(mods) => {
            let present: &[String] = match &fact.kind {
                FactKind::AnnotationAttach { modifiers, .. } => modifiers,
                FactKind::ScopeEnter {
                    scope: ir::ScopeKind::Method { modifiers, .. },
                    ..
                } => modifiers,
                _ => &[],
            };
            present.iter().any(|m| mods.contains(m)).into()
        }
        Predicate::DeclaredType(pat) => match &fact.kind {
            FactKind::Declare { declared_type, .. } => match declared_type.as_deref() {
                Some("var") | None => Tri::Unknown,
                Some(t) => pat.matches_any_of(t).into(),
            },
            _ => Tri::False,
        },
        Predicate::DeclOrigin(origin) => match &fact.kind {
            FactKind::Declare { origin: o, .. } => (o == origin).into(),
            _ => Tri::False,
        },
        Predicate::ValueLiteral => match &fx.value {
            Some(v) => literal_value(fact_value(fact), v),
            None => Tri::False,
        },
        Predicate::ValueTainted => match &fx.value {
            Some(v) => v.taint.is_tainted(),
            None => Tri::False,
        },
        Predicate::HandleOp(op) => (fx.handle_op == Some(*op)).into(),
        Predicate::OpenDependents => {
            if fx.handle_op == Some(loader::HandleOp::Release) {
                fx.open_dependents
            } else {
                Tri::False
            }
        }
        Predicate::TxOp(op) => (fx.tx_op == Some(*op)).into(),
        Predicate::InDeclarativeTx => fx.tx_before.has(TxKind::Declarative).into(),
        Predicate::InManualTx => fx.tx_before.has(TxKind::Manual).into(),
        Predicate::TxDepthAtLeast(n) => (fx.tx_before.depth() >= *n).into(),
        Predicate::TxSummary(flag) => fx
            .tx_summary
            .as_ref()
            .is_some_and(|s| s.flag(*flag))
            .into(),
        Predicate::ScopeKind(name) => match &fact.kind {
            FactKind::ScopeEnter { scope, .. } | FactKind::ScopeExit { scope, .. } => {
                (scope.name() == name).into()
            }
            _ => Tri::False,
        },
        // Handled in `eval`.
        Predicate::Always(_)
        | Predicate::All(_)
        | Predicate::Any(_)
        | Predicate::Not(_)
        | Predicate::Policy(_)
        | Predicate::Custom(_)
        | Predicate::Imports(_)
        | Predicate::HandleState(_)
        | Predicate::HandleKind(_)
        | Predicate::SymbolName(_) => Tri::False,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taint::TaintLabel;
    use crate::flow::FlowState;
    use crate::resolver::DeclaredType;
    use ir::Meta;
    use loader::predicate::{on_call_to, where_arg_tainted, where_handle_state};

    fn effects() -> FactEffects {
        let mut fx = FactEffects::new(&FlowState::default());
        fx.receiver_types = Some(vec!["PreparedStatement".into(), "Statement".into()]);
        fx
    }

    fn value(taint: TaintLabel, constant: Option<&str>, unresolved: bool) -> ValueInfo {
        ValueInfo {
            ty: DeclaredType::Named("String".into()),
            taint,
            constant: constant.map(str::to_string),
            symbol: None,
            unresolved,
        }
    }

    fn call(args: Vec<Operand>) -> Fact {
        Fact::new(
            FactKind::Call {
                receiver: Some(Operand::symbol("st")),
                method: "executeQuery".into(),
                args,
                result: None,
            },
            Meta::new(3, 9),
        )
    }

    fn with<'s>(
        fact: &'s Fact,
        fx: &'s FactEffects,
        policies: &'s BTreeMap<String, bool>,
        custom: &'s CustomRegistry,
    ) -> EvalContext<'s> {
        EvalContext {
            subject: Subject::Fact { fact, fx },
            imports: &[],
            policies,
            custom,
        }
    }

    #[test]
    fn call_pattern_uses_ancestors() {
        let fact = call(vec![]);
        let fx = effects();
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::builtin());
        let ctx = with(&fact, &fx, &pol, &reg);
        let p = on_call_to("Statement.executeQuery").unwrap();
        assert_eq!(eval(&p, &ctx).unwrap(), Tri::True);
        let p = on_call_to("EntityManager.createQuery").unwrap();
        assert_eq!(eval(&p, &ctx).unwrap(), Tri::False);
    }

    #[test]
    fn unresolved_receiver_is_unknown() {
        let fact = call(vec![]);
        let mut fx = effects();
        fx.receiver_types = None;
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::builtin());
        let ctx = with(&fact, &fx, &pol, &reg);
        let p = on_call_to("Statement.executeQuery").unwrap();
        assert_eq!(eval(&p, &ctx).unwrap(), Tri::Unknown);
    }

    #[test]
    fn argument_taint_levels() {
        let fact = call(vec![Operand::symbol("q")]);
        let mut fx = effects();
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::builtin());
        for (label, expected) in [
            (TaintLabel::external("param"), Tri::True),
            (TaintLabel::assumed("x"), Tri::Unknown),
            (TaintLabel::Literal, Tri::False),
        ] {
            fx.args = vec![value(label, None, false)];
            let ctx = with(&fact, &fx, &pol, &reg);
            assert_eq!(eval(&where_arg_tainted(0), &ctx).unwrap(), expected);
        }
    }

    #[test]
    fn literal_arguments() {
        let fact = call(vec![Operand::literal("pw"), Operand::Null, Operand::symbol("u")]);
        let mut fx = effects();
        fx.args = vec![
            value(TaintLabel::Literal, Some("pw"), false),
            value(TaintLabel::Literal, None, false),
            value(TaintLabel::assumed("u"), None, true),
        ];
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::builtin());
        let ctx = with(&fact, &fx, &pol, &reg);
        assert_eq!(eval(&Predicate::ArgLiteral(ArgSelector::Index(0)), &ctx).unwrap(), Tri::True);
        assert_eq!(eval(&Predicate::ArgLiteral(ArgSelector::Index(1)), &ctx).unwrap(), Tri::False);
        assert_eq!(eval(&Predicate::ArgLiteral(ArgSelector::Last), &ctx).unwrap(), Tri::Unknown);
        assert_eq!(eval(&Predicate::ArgCount(3), &ctx).unwrap(), Tri::True);
        assert_eq!(eval(&Predicate::ArgCount(4), &ctx).unwrap(), Tri::False);
    }

    #[test]
    fn handle_states_on_receiver() {
        let fact = call(vec![]);
        let mut fx = effects();
        let closed = LifeSet {
            closed: true,
            ..Default::default()
        };
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::builtin());
        fx.receiver_lives = vec![closed];
        let ctx = with(&fact, &fx, &pol, &reg);
        assert_eq!(eval(&where_handle_state(HandleState::Closed), &ctx).unwrap(), Tri::True);
        let mut fx2 = effects();
        fx2.receiver_lives = vec![closed.union(LifeSet::acquired())];
        let ctx = with(&fact, &fx2, &pol, &reg);
        assert_eq!(eval(&where_handle_state(HandleState::Closed), &ctx).unwrap(), Tri::Unknown);
    }

    #[test]
    fn policies_and_missing_custom() {
        let fact = call(vec![]);
        let fx = effects();
        let pol = BTreeMap::from([("strict".to_string(), true)]);
        let reg = CustomRegistry::default();
        let ctx = with(&fact, &fx, &pol, &reg);
        assert_eq!(eval(&Predicate::Policy("strict".into()), &ctx).unwrap(), Tri::True);
        assert_eq!(eval(&Predicate::Policy("other".into()), &ctx).unwrap(), Tri::False);
        assert!(eval(&Predicate::Custom("sql-text".into()), &ctx).is_err());
    }

    #[test]
    fn kleene_short_circuit() {
        let fact = call(vec![]);
        let mut fx = effects();
        fx.receiver_types = None;
        let (pol, reg) = (BTreeMap::new(), CustomRegistry::default());
        let ctx = with(&fact, &fx, &pol, &reg);
        let unknown = on_call_to("Statement.executeQuery").unwrap();
        let p = Predicate::All(vec![unknown.clone(), Predicate::Always(false)]);
        assert_eq!(eval(&p, &ctx).unwrap(), Tri::False);
        let p = Predicate::Any(vec![unknown, Predicate::Always(true)]);
        assert_eq!(eval(&p, &ctx).unwrap(), Tri::True);
    }
}
