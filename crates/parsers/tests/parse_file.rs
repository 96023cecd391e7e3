use ir::FactKind;
use parsers::{detect_type, parse_file, ParserMetrics};
use std::fs;
use tempfile::tempdir;

#[test]
fn lowers_java_and_counts_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("Repo.java");
    fs::write(
        &path,
        "class Repo {\n    void run(DataSource ds) throws Exception {\n        ds.getConnection(); // dblint-ignore\n    }\n}\n",
    )
    .unwrap();

    let mut metrics = ParserMetrics::default();
    let unit = parse_file(&path, Some("dblint-ignore"), Some(&mut metrics))
        .unwrap()
        .unwrap();
    assert_eq!(unit.language, "java");
    assert!(unit.suppressed.contains(&3));
    assert!(unit
        .facts
        .iter()
        .any(|f| matches!(&f.kind, FactKind::Call { method, .. } if method == "getConnection")));
    assert_eq!(metrics.files_parsed, 1);
    assert_eq!(metrics.parse_errors, 0);
}

#[test]
fn syntax_errors_are_counted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("Broken.java");
    fs::write(&path, "class Broken { void run( { }").unwrap();

    let mut metrics = ParserMetrics::default();
    assert!(parse_file(&path, None, Some(&mut metrics)).is_err());
    assert_eq!(metrics.parse_errors, 1);
    assert_eq!(metrics.files_parsed, 0);
}

#[test]
fn loads_fact_streams() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("Repo.facts.json");
    fs::write(
        &path,
        r#"{"path":"","language":"kotlin","facts":[
            {"kind":"import","path":"java.sql.Connection","meta":{"line":1,"column":1}}
        ]}"#,
    )
    .unwrap();
    assert_eq!(detect_type(&path), Some("facts"));
    let unit = parse_file(&path, None, None).unwrap().unwrap();
    assert_eq!(unit.language, "kotlin");
    assert!(unit.path.ends_with("Repo.facts.json"));
}

#[test]
fn unsupported_files_are_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pom.xml");
    fs::write(&path, "<project/>").unwrap();
    assert!(parse_file(&path, None, None).unwrap().is_none());
}
