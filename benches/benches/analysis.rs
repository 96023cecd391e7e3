use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use engine::{Engine, EngineConfig};
use ir::{DeclOrigin, Operand, ScopeKind, SourceUnit, UnitBuilder};
use loader::Catalog;
use parsers::parse_java;
use std::collections::BTreeMap;

const REPOSITORY: &str = r#"import java.sql.*;
import javax.sql.DataSource;
import org.springframework.transaction.annotation.Transactional;

class AccountRepository {
    private DataSource ds;

    Account find(String id) throws SQLException {
        try (Connection c = ds.getConnection();
             PreparedStatement ps = c.prepareStatement("SELECT * FROM account WHERE id = ?")) {
            ps.setString(1, id);
            try (ResultSet rs = ps.executeQuery()) {
                return rs.next() ? new Account(rs.getString("id")) : null;
            }
        }
    }

    int search(HttpServletRequest req) throws SQLException {
        String q = req.getParameter("q");
        Connection c = ds.getConnection();
        Statement st = c.createStatement();
        ResultSet rs = st.executeQuery("SELECT COUNT(*) FROM account WHERE name = '" + q + "'");
        rs.next();
        return rs.getInt(1);
    }

    void transfer(Connection c, long from, long to) throws SQLException {
        c.setAutoCommit(false);
        try {
            debit(c, from);
            credit(c, to);
            c.commit();
        } catch (SQLException e) {
            c.rollback();
            throw e;
        }
    }

    @Transactional
    public void archive(String id) {
        mark(id);
    }
}
"#;

fn builtin_engine() -> Engine {
    let catalog = Catalog::builtin().expect("builtin catalog");
    Engine::new(catalog, BTreeMap::new()).expect("engine")
}

/// A class with `methods` methods, each acquiring a connection, building a
/// query from a parameter and closing on one branch only.
fn synthetic_unit(methods: usize) -> SourceUnit {
    let mut b = UnitBuilder::new("Synthetic.java", "java");
    b.at(1, 1);
    b.enter(ScopeKind::Class {
        name: "Synthetic".into(),
    });
    let mut line = 2;
    for m in 0..methods {
        b.at(line, 5);
        b.enter(ScopeKind::Method {
            name: format!("m{m}"),
            modifiers: vec![],
        });
        b.declare("ds", Some("DataSource"), DeclOrigin::Parameter);
        b.declare("name", Some("String"), DeclOrigin::Parameter);
        b.at(line + 1, 9);
        b.declare("c", Some("Connection"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("ds")), "getConnection", vec![], Some("c"));
        b.at(line + 2, 9);
        b.declare("sql", Some("String"), DeclOrigin::Local);
        b.string_build(
            "sql",
            vec![Operand::literal("SELECT * FROM t WHERE n = '"), Operand::symbol("name")],
        );
        b.at(line + 3, 9);
        b.declare("st", Some("Statement"), DeclOrigin::Local);
        b.call(Some(Operand::symbol("c")), "createStatement", vec![], Some("st"));
        b.at(line + 4, 9);
        b.call(
            Some(Operand::symbol("st")),
            "executeQuery",
            vec![Operand::symbol("sql")],
            None,
        );
        b.at(line + 5, 9);
        b.enter(ScopeKind::Branch {
            exhaustive: false,
            null_check: None,
        });
        b.enter(ScopeKind::Arm);
        b.at(line + 6, 13);
        b.call(Some(Operand::symbol("st")), "close", vec![], None);
        b.call(Some(Operand::symbol("c")), "close", vec![], None);
        b.exit();
        b.exit();
        b.exit();
        line += 8;
    }
    b.finish()
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_java", |b| {
        b.iter(|| parse_java(black_box(REPOSITORY), "AccountRepository.java", None).unwrap())
    });
}

fn bench_analyze_parsed(c: &mut Criterion) {
    let engine = builtin_engine();
    let unit = parse_java(REPOSITORY, "AccountRepository.java", None).expect("parse");
    let cfg = EngineConfig::default();
    c.bench_function("analyze_java", |b| {
        b.iter(|| engine.analyze_unit(black_box(&unit), black_box(&cfg)))
    });
}

fn bench_analyze_synthetic(c: &mut Criterion) {
    let engine = builtin_engine();
    let cfg = EngineConfig::default();
    let mut group = c.benchmark_group("analyze_synthetic");
    for methods in [10usize, 100, 500] {
        let unit = synthetic_unit(methods);
        group.bench_with_input(BenchmarkId::from_parameter(methods), &unit, |b, unit| {
            b.iter(|| engine.analyze_unit(black_box(unit), black_box(&cfg)))
        });
    }
    group.finish();
}

fn bench_step_budget(c: &mut Criterion) {
    let engine = builtin_engine();
    let unit = synthetic_unit(500);
    let cfg = EngineConfig {
        max_steps: 1_000,
        ..EngineConfig::default()
    };
    c.bench_function("analyze_step_budget", |b| {
        b.iter(|| engine.analyze_unit(black_box(&unit), black_box(&cfg)))
    });
}

fn bench_parallel_units(c: &mut Criterion) {
    let engine = builtin_engine();
    let units: Vec<SourceUnit> = (0..64)
        .map(|i| {
            let mut u = synthetic_unit(20);
            u.path = format!("Synthetic{i}.java");
            u
        })
        .collect();
    let cfg = EngineConfig::default();
    c.bench_function("analyze_units_parallel", |b| {
        b.iter(|| engine.analyze_units(black_box(&units), black_box(&cfg), None))
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_analyze_parsed,
    bench_analyze_synthetic,
    bench_step_budget,
    bench_parallel_units
);
criterion_main!(benches);
