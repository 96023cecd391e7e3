use loader::{load_catalog, Catalog};
use std::fs;
use tempfile::tempdir;

#[test]
fn rejects_duplicate_ids() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("rules.yaml"),
        r#"rules:
- id: dup.rule
  category: leak
  trigger: handle_end
  violation: { handle_state: leaked }
  message: a
- id: dup.rule
  category: leak
  trigger: handle_end
  violation: { handle_state: escaped }
  message: b
"#,
    )?;
    let err = load_catalog(dir.path()).unwrap_err();
    assert!(format!("{err:#}").to_lowercase().contains("duplicate"));
    Ok(())
}

#[test]
fn rejects_duplicate_ids_across_files() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let rule = r#"rules:
- id: same.rule
  category: connection
  trigger: call
  violation: { call_to: "DriverManager.getConnection" }
  message: m
"#;
    fs::write(dir.path().join("a.yaml"), rule)?;
    fs::write(dir.path().join("b.yml"), rule)?;
    let err = load_catalog(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("duplicate rule id: same.rule"));
    Ok(())
}

#[test]
fn user_rules_cannot_shadow_builtin_ids() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("shadow.yaml"),
        r#"rules:
- id: resource-cleanup
  category: leak
  trigger: handle_end
  violation: never
  message: m
"#,
    )?;
    let mut catalog = Catalog::builtin()?;
    let err = catalog.merge(load_catalog(dir.path())?).unwrap_err();
    assert!(err.to_string().contains("resource-cleanup"));
    Ok(())
}
