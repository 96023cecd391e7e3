mod common;

use common::*;
use engine::{EngineConfig, EngineMetrics, Verdict};
use ir::{DeclOrigin, HandleState, NullCheck, Operand, ScopeKind, SourceUnit};

fn straight_line() -> SourceUnit {
    let mut b = dao_method("load");
    acquire_connection(&mut b, "c", 3);
    close(&mut b, "c", 4);
    b.finish()
}

fn closed_in_both_arms() -> SourceUnit {
    let mut b = dao_method("load");
    acquire_connection(&mut b, "c", 3);
    b.at(4, 9);
    b.enter(ScopeKind::Branch {
        exhaustive: true,
        null_check: None,
    });
    b.enter(ScopeKind::Arm);
    close(&mut b, "c", 5);
    b.exit();
    b.enter(ScopeKind::Arm);
    close(&mut b, "c", 7);
    b.exit();
    b.exit();
    b.finish()
}

fn closed_in_finally() -> SourceUnit {
    let mut b = dao_method("load");
    acquire_connection(&mut b, "c", 3);
    b.at(4, 9);
    b.enter(ScopeKind::Try {
        has_catch: false,
        has_finally: true,
    });
    b.enter(ScopeKind::Arm);
    b.at(5, 13);
    b.call(
        Some(Operand::symbol("c")),
        "isValid",
        vec![Operand::Constant { value: "1".into() }],
        None,
    );
    b.exit();
    b.exit();
    b.at(6, 11);
    b.enter(ScopeKind::Finally);
    close(&mut b, "c", 7);
    b.exit();
    b.finish()
}

fn guarded() -> SourceUnit {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.enter(ScopeKind::ResourceGuard {
        guarded: vec!["c".into()],
    });
    b.declare("c", Some("Connection"), DeclOrigin::Resource);
    b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
    b.at(4, 13);
    b.ret(Some(Operand::literal("done")));
    b.finish()
}

fn null_guarded_finally() -> SourceUnit {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.declare("c", Some("Connection"), DeclOrigin::Local);
    b.assign("c", Operand::Null);
    b.enter(ScopeKind::Try {
        has_catch: false,
        has_finally: true,
    });
    b.enter(ScopeKind::Arm);
    b.at(5, 13);
    b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
    b.exit();
    b.exit();
    b.at(6, 11);
    b.enter(ScopeKind::Finally);
    b.enter(ScopeKind::Branch {
        exhaustive: false,
        null_check: Some(NullCheck {
            symbol: "c".into(),
            non_null_in_first: true,
        }),
    });
    b.enter(ScopeKind::Arm);
    close(&mut b, "c", 7);
    b.finish()
}

fn closed_in_one_arm() -> SourceUnit {
    let mut b = dao_method("load");
    acquire_connection(&mut b, "c", 3);
    b.at(4, 9);
    b.enter(ScopeKind::Branch {
        exhaustive: false,
        null_check: None,
    });
    b.enter(ScopeKind::Arm);
    close(&mut b, "c", 5);
    b.finish()
}

fn early_return() -> SourceUnit {
    let mut b = dao_method("load");
    acquire_connection(&mut b, "c", 3);
    b.at(4, 9);
    b.enter(ScopeKind::Branch {
        exhaustive: false,
        null_check: None,
    });
    b.enter(ScopeKind::Arm);
    b.at(5, 13);
    b.ret(None);
    b.exit();
    b.exit();
    close(&mut b, "c", 7);
    b.finish()
}

fn connection_state(unit: &SourceUnit) -> HandleState {
    let report = analyze(unit);
    let handle = report
        .handles
        .iter()
        .find(|h| h.symbol == "c")
        .expect("connection handle tracked");
    handle.state
}

#[test]
fn release_on_every_path_is_closed() {
    for (name, unit) in [
        ("straight line", straight_line()),
        ("both arms", closed_in_both_arms()),
        ("finally", closed_in_finally()),
        ("guard", guarded()),
        ("null-guarded finally", null_guarded_finally()),
    ] {
        assert_eq!(connection_state(&unit), HandleState::Closed, "{name}");
        assert!(!has_violation(&analyze(&unit), "resource-cleanup"), "{name}");
    }
}

#[test]
fn missing_release_on_some_path_is_leaked() {
    for (name, unit) in [
        ("one arm", closed_in_one_arm()),
        ("early return", early_return()),
    ] {
        assert_eq!(connection_state(&unit), HandleState::Leaked, "{name}");
        let report = analyze(&unit);
        assert_eq!(
            verdict_at(&report, "resource-cleanup", 3),
            Some(Verdict::Violation),
            "{name}"
        );
    }
}

#[test]
fn analysis_is_idempotent() {
    let engine = builtin_engine();
    let cfg = EngineConfig::default();
    for unit in [closed_in_one_arm(), null_guarded_finally(), guarded()] {
        let first = serde_json::to_string(&engine.analyze_unit(&unit, &cfg)).unwrap();
        let second = serde_json::to_string(&engine.analyze_unit(&unit, &cfg)).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn parallel_analysis_matches_sequential() {
    let engine = builtin_engine();
    let cfg = EngineConfig::default();
    let units = vec![
        straight_line(),
        closed_in_one_arm(),
        early_return(),
        closed_in_finally(),
    ];
    let mut metrics = EngineMetrics::default();
    let parallel = engine.analyze_units(&units, &cfg, Some(&mut metrics));
    let sequential: Vec<_> = units.iter().map(|u| engine.analyze_unit(u, &cfg)).collect();
    assert_eq!(parallel.len(), sequential.len());
    for (p, s) in parallel.iter().zip(&sequential) {
        assert_eq!(p.findings, s.findings);
    }
    assert_eq!(metrics.units, 4);
    assert_eq!(
        metrics.violations,
        sequential.iter().map(|r| r.count(Verdict::Violation)).sum::<usize>()
    );
}

/// `name` flows through `len` string builds into `executeQuery`; when
/// `sanitize_at` is set the value passes through an escaping call at that
/// position of the chain.
fn build_chain(len: usize, sanitize_at: Option<usize>) -> SourceUnit {
    let mut b = dao_method("search");
    b.at(3, 9);
    b.declare("st", Some("Statement"), DeclOrigin::Local);
    let mut prev = "name".to_string();
    for i in 0..len {
        let next = format!("q{i}");
        b.at(4 + i, 9);
        b.declare(&next, Some("String"), DeclOrigin::Local);
        if sanitize_at == Some(i) {
            b.call(
                Some(Operand::type_ref("StringEscapeUtils")),
                "escapeSql",
                vec![Operand::symbol(&prev)],
                Some(&next),
            );
        } else {
            b.string_build(
                &next,
                vec![Operand::literal(" AND x = "), Operand::symbol(&prev)],
            );
        }
        prev = next;
    }
    b.at(100, 9);
    b.call(
        Some(Operand::symbol("st")),
        "executeQuery",
        vec![Operand::symbol(&prev)],
        None,
    );
    b.finish()
}

#[test]
fn taint_survives_any_number_of_string_builds() {
    for len in 1..=6 {
        let report = analyze(&build_chain(len, None));
        assert_eq!(
            verdict_at(&report, "dynamic-query-injection-risk", 100),
            Some(Verdict::Violation),
            "chain of {len}"
        );
    }
}

#[test]
fn sanitizer_anywhere_in_the_chain_clears_taint() {
    for len in 1..=5 {
        for k in 0..len {
            let report = analyze(&build_chain(len, Some(k)));
            assert_eq!(
                verdict_at(&report, "dynamic-query-injection-risk", 100),
                Some(Verdict::Compliant),
                "chain of {len}, sanitized at {k}"
            );
        }
    }
}

/// Acquire on line 3, two unrelated statements on lines 4 and 5, release on
/// line 6. Returns the unit and the indices of the four facts.
fn with_independent_facts() -> (SourceUnit, [usize; 4]) {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.declare("c", Some("Connection"), DeclOrigin::Local);
    let acquire = b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
    b.at(4, 9);
    let counter = b.declare("count", Some("int"), DeclOrigin::Local);
    b.at(5, 9);
    let log = b.call(
        Some(Operand::type_ref("Logger")),
        "info",
        vec![Operand::literal("loading")],
        None,
    );
    b.at(6, 9);
    let release = b.call(Some(Operand::symbol("c")), "close", vec![], None);
    (b.finish(), [acquire, counter, log, release])
}

#[test]
fn swapping_independent_facts_keeps_findings() {
    let (unit, [_, counter, log, _]) = with_independent_facts();
    let mut swapped = unit.clone();
    swapped.facts.swap(counter, log);
    swapped.reindex();
    assert_eq!(analyze(&unit).findings, analyze(&swapped).findings);
}

#[test]
fn swapping_acquire_and_release_changes_the_outcome() {
    let (unit, [acquire, _, _, release]) = with_independent_facts();
    let before = analyze(&unit);
    assert_eq!(
        verdict_at(&before, "resource-cleanup", 3),
        Some(Verdict::Compliant)
    );
    let mut swapped = unit.clone();
    swapped.facts.swap(acquire, release);
    swapped.reindex();
    let after = analyze(&swapped);
    assert_eq!(
        verdict_at(&after, "resource-cleanup", 6),
        Some(Verdict::Violation)
    );
}

/// `q = "SELECT 1"; loop { st.executeQuery(q); q = q + name; }` with the
/// query on line 6.
fn query_grown_across_iterations() -> SourceUnit {
    let mut b = dao_method("search");
    b.at(3, 9);
    b.declare("st", Some("Statement"), DeclOrigin::Local);
    b.at(4, 9);
    b.declare("q", Some("String"), DeclOrigin::Local);
    b.assign("q", Operand::literal("SELECT 1"));
    b.at(5, 9);
    b.enter(ScopeKind::Loop);
    b.at(6, 13);
    b.call(
        Some(Operand::symbol("st")),
        "executeQuery",
        vec![Operand::symbol("q")],
        None,
    );
    b.at(7, 13);
    b.string_build("q", vec![Operand::symbol("q"), Operand::symbol("name")]);
    b.exit();
    b.finish()
}

#[test]
fn taint_from_a_later_iteration_reaches_the_sink() {
    let report = analyze(&query_grown_across_iterations());
    let found: Vec<_> = findings_for(&report, "dynamic-query-injection-risk")
        .iter()
        .map(|f| (f.line, f.verdict))
        .collect();
    assert_eq!(found, vec![(6, Verdict::Violation)]);
}

#[test]
fn reacquiring_in_a_loop_leaks() {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.declare("c", Some("Connection"), DeclOrigin::Local);
    b.assign("c", Operand::Null);
    b.at(4, 9);
    b.enter(ScopeKind::Loop);
    b.at(5, 13);
    b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
    b.exit();
    close(&mut b, "c", 7);
    let unit = b.finish();

    assert_eq!(connection_state(&unit), HandleState::Leaked);
    let report = analyze(&unit);
    assert_eq!(
        verdict_at(&report, "resource-cleanup", 5),
        Some(Verdict::Violation)
    );
}

#[test]
fn acquire_and_close_in_one_iteration_stays_closed() {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.enter(ScopeKind::Loop);
    acquire_connection(&mut b, "c", 4);
    close(&mut b, "c", 5);
    b.exit();
    let unit = b.finish();

    assert_eq!(connection_state(&unit), HandleState::Closed);
    let report = analyze(&unit);
    assert_eq!(
        verdict_at(&report, "resource-cleanup", 4),
        Some(Verdict::Compliant)
    );
}

#[test]
fn handle_closed_inside_a_repeated_body_is_reported_once() {
    let mut b = dao_method("load");
    b.at(3, 9);
    b.declare("q", Some("String"), DeclOrigin::Local);
    b.assign("q", Operand::literal("SELECT 1"));
    b.at(4, 9);
    b.enter(ScopeKind::Loop);
    b.at(5, 13);
    b.enter(ScopeKind::ResourceGuard {
        guarded: vec!["c".into()],
    });
    b.declare("c", Some("Connection"), DeclOrigin::Resource);
    b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
    b.exit();
    b.at(6, 13);
    b.string_build("q", vec![Operand::symbol("q"), Operand::symbol("name")]);
    b.exit();
    let report = analyze(&b.finish());

    let states: Vec<_> = report
        .handles
        .iter()
        .filter(|h| h.symbol == "c")
        .map(|h| h.state)
        .collect();
    assert_eq!(states, vec![HandleState::Closed]);
    assert_eq!(findings_for(&report, "resource-cleanup").len(), 1);
}
