//! Lowering tests grouped by construct family.

use super::parse_java;
use ir::{Fact, FactKind, Operand, SourceUnit};


fn parse_snippet(code: &str) -> SourceUnit {
    parse_java(code, "Snippet.java", None).expect("parse java snippet")
}

/// Scope structure as `name` / `/name` markers.
fn scopes(unit: &SourceUnit) -> Vec<String> {
    unit.facts
        .iter()
        .filter_map(|f| match &f.kind {
            FactKind::ScopeEnter { scope, .. } => Some(scope.name().to_string()),
            FactKind::ScopeExit { scope, .. } => Some(format!("/{}", scope.name())),
            _ => None,
        })
        .collect()
}

/// `(receiver, method, args, result)` of every call, in stream order.
fn calls(unit: &SourceUnit) -> Vec<(Option<Operand>, String, Vec<Operand>, Option<String>)> {
    unit.facts
        .iter()
        .filter_map(|f| match &f.kind {
            FactKind::Call {
                receiver,
                method,
                args,
                result,
            } => Some((receiver.clone(), method.clone(), args.clone(), result.clone())),
            _ => None,
        })
        .collect()
}

fn string_builds(unit: &SourceUnit) -> Vec<(String, Vec<Operand>)> {
    unit.facts
        .iter()
        .filter_map(|f| match &f.kind {
            FactKind::StringBuild { result, parts } => Some((result.clone(), parts.clone())),
            _ => None,
        })
        .collect()
}

fn find<'u>(unit: &'u SourceUnit, pred: impl Fn(&FactKind) -> bool) -> &'u Fact {
    unit.facts
        .iter()
        .find(|f| pred(&f.kind))
        .expect("fact present")
}
