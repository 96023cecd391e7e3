#![allow(dead_code)]

use engine::{Engine, EngineConfig, Finding, UnitReport, Verdict};
use ir::{DeclOrigin, Operand, ScopeKind, SourceUnit, UnitBuilder};
use loader::Catalog;
use std::collections::BTreeMap;

pub fn builtin_engine() -> Engine {
    let catalog = Catalog::builtin().unwrap();
    Engine::new(catalog, BTreeMap::new()).unwrap()
}

pub fn analyze(unit: &SourceUnit) -> UnitReport {
    builtin_engine().analyze_unit(unit, &EngineConfig::default())
}

/// Opens `class Dao { <name>(DataSource ds, String name) { ... }` and leaves
/// the method scope open.
pub fn dao_method(name: &str) -> UnitBuilder {
    let mut b = UnitBuilder::new("Dao.java", "java");
    b.at(1, 1);
    b.enter(ScopeKind::Class { name: "Dao".into() });
    b.at(2, 5);
    b.enter(ScopeKind::Method {
        name: name.into(),
        modifiers: vec!["public".into()],
    });
    b.declare("ds", Some("DataSource"), DeclOrigin::Parameter);
    b.declare("name", Some("String"), DeclOrigin::Parameter);
    b
}

/// `Connection <sym> = ds.getConnection();` on `line`.
pub fn acquire_connection(b: &mut UnitBuilder, sym: &str, line: usize) {
    b.at(line, 9);
    b.declare(sym, Some("Connection"), DeclOrigin::Local);
    b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some(sym));
}

pub fn close(b: &mut UnitBuilder, sym: &str, line: usize) {
    b.at(line, 9);
    b.call(Some(Operand::symbol(sym)), "close", vec![], None);
}

pub fn findings_for<'r>(report: &'r UnitReport, rule: &str) -> Vec<&'r Finding> {
    report.findings.iter().filter(|f| f.rule_id == rule).collect()
}

pub fn verdict_at(report: &UnitReport, rule: &str, line: usize) -> Option<Verdict> {
    report
        .findings
        .iter()
        .find(|f| f.rule_id == rule && f.line == line)
        .map(|f| f.verdict)
}

pub fn has_violation(report: &UnitReport, rule: &str) -> bool {
    findings_for(report, rule)
        .iter()
        .any(|f| f.verdict == Verdict::Violation)
}
