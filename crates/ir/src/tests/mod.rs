use super::*;
use serde_json::{self, Value as JsonValue};
// Tests for JSON roundtrips of SourceUnit and the builder invariants.

#[test]
fn fact_serialization_flattens_kind() {
    let mut b = UnitBuilder::new("Repo.java", "java");
    b.at(3, 9).call(
        Some(Operand::symbol("stmt")),
        "executeQuery",
        vec![Operand::symbol("sql")],
        Some("rs"),
    );
    let unit = b.finish();

    let json = serde_json::to_string(&unit).unwrap();
    let v: JsonValue = serde_json::from_str(&json).unwrap();
    let fact = &v["facts"][0];
    assert_eq!(fact["kind"], "call");
    assert_eq!(fact["method"], "executeQuery");
    assert_eq!(fact["receiver"]["op"], "symbol");
    assert_eq!(fact["meta"]["line"], 3);
    assert_eq!(fact["meta"]["column"], 9);

    let back: SourceUnit = serde_json::from_str(&json).unwrap();
    assert_eq!(back.facts, unit.facts);
}

#[test]
fn deserialization_fails_without_meta() {
    let json = r#"{"path":"a","language":"facts","facts":[{"kind":"import","path":"java.sql.Connection"}]}"#;
    assert!(serde_json::from_str::<SourceUnit>(json).is_err());
}

#[test]
fn reindex_restores_stream_positions() {
    let json = r#"{"path":"a","language":"facts","facts":[
        {"kind":"import","path":"x","meta":{"line":1,"column":1}},
        {"kind":"return","meta":{"line":2,"column":1}}
    ]}"#;
    let mut unit: SourceUnit = serde_json::from_str(json).unwrap();
    unit.reindex();
    assert_eq!(unit.facts[1].index, 1);
    assert!(matches!(unit.facts[1].kind, FactKind::Return { value: None }));
}

#[test]
fn builder_closes_scopes_in_lifo_order() {
    let mut b = UnitBuilder::new("A.java", "java");
    let unit_scope = b.enter(ScopeKind::Unit);
    let method = b.enter(ScopeKind::Method {
        name: "run".into(),
        modifiers: vec![],
    });
    b.enter(ScopeKind::Block);
    b.exit_to(method);
    assert_eq!(b.depth(), 1);
    let unit = b.finish();

    let exits: Vec<ScopeId> = unit
        .facts
        .iter()
        .filter_map(|f| match f.kind {
            FactKind::ScopeExit { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(exits, vec![method + 1, method, unit_scope]);
}

#[test]
fn temporaries_never_collide_with_identifiers() {
    let mut b = UnitBuilder::new("A.java", "java");
    let t1 = b.temp();
    let t2 = b.temp();
    assert_ne!(t1, t2);
    assert!(t1.starts_with('$'));
}

#[test]
fn simple_type_name_strips_qualifiers() {
    assert_eq!(simple_type_name("java.util.List<java.lang.String>"), "List");
    assert_eq!(simple_type_name("byte[]"), "byte");
    assert_eq!(simple_type_name("String..."), "String");
}

#[test]
fn handle_state_parses_case_insensitively() {
    assert_eq!("Leaked".parse::<HandleState>().unwrap(), HandleState::Leaked);
    assert!("gone".parse::<HandleState>().is_err());
}
