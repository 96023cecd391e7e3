//! Every rule in the built-in catalog carries paired exemplars: the `bad`
//! source must produce a violation of that rule and the `good` one must not.

use engine::{Engine, EngineConfig, Verdict};
use loader::Catalog;

fn violations(engine: &Engine, rule: &str, src: &str) -> usize {
    let unit = parsers::parse_java(src, "Example.java", None).unwrap();
    engine
        .analyze_unit(&unit, &EngineConfig::default())
        .findings
        .iter()
        .filter(|f| f.rule_id == rule && f.verdict == Verdict::Violation)
        .count()
}

#[test]
fn every_rule_has_both_exemplars() {
    let catalog = Catalog::builtin().unwrap();
    for rule in &catalog.rules {
        assert!(
            rule.examples.iter().any(|e| e.bad.is_some()),
            "{} has no violating exemplar",
            rule.id
        );
        assert!(
            rule.examples.iter().any(|e| e.good.is_some()),
            "{} has no compliant exemplar",
            rule.id
        );
    }
}

#[test]
fn builtin_exemplars_conform() {
    let catalog = Catalog::builtin().unwrap();
    let mut failures = Vec::new();
    for rule in &catalog.rules {
        for (i, example) in rule.examples.iter().enumerate() {
            let engine = Engine::new(catalog.clone(), example.policies.clone()).unwrap();
            if let Some(bad) = &example.bad {
                if violations(&engine, &rule.id, bad) == 0 {
                    failures.push(format!("{} example {}: bad source not flagged", rule.id, i));
                }
            }
            if let Some(good) = &example.good {
                let n = violations(&engine, &rule.id, good);
                if n > 0 {
                    failures.push(format!("{} example {}: good source flagged {} times", rule.id, i, n));
                }
            }
        }
    }
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}
