use loader::{load_catalog, Category, RuleSelection, Severity};
use std::collections::BTreeMap;
use std::fs;
use tempfile::tempdir;

const RULE: &str = r#"rules:
- id: test.rule
  category: mapping
  trigger: declare
  violation: { declared_type: "float|double" }
  message: test
"#;

#[test]
fn parses_every_severity_level() {
    assert_eq!("info".parse::<Severity>().unwrap(), Severity::Info);
    assert_eq!("LOW".parse::<Severity>().unwrap(), Severity::Low);
    assert_eq!("Medium".parse::<Severity>().unwrap(), Severity::Medium);
    assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
    assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
    assert!(Severity::Info < Severity::Low && Severity::High < Severity::Critical);
}

#[test]
fn levels_outside_the_scale_are_rejected() -> anyhow::Result<()> {
    for level in ["error", "warning"] {
        assert!(level.parse::<Severity>().is_err(), "{level}");
    }
    let dir = tempdir()?;
    fs::write(
        dir.path().join("rules.yaml"),
        format!("{RULE}  severity: ERROR\n"),
    )?;
    let err = load_catalog(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("unknown severity"));
    Ok(())
}

#[test]
fn rejects_unknown_severity() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("rules.yaml"),
        format!("{RULE}  severity: UNKNOWN\n"),
    )?;
    let err = load_catalog(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("unknown severity"));
    Ok(())
}

#[test]
fn default_severity_is_medium() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("rules.yaml"), RULE)?;
    let catalog = load_catalog(dir.path())?;
    assert_eq!(catalog.rules[0].severity, Severity::Medium);
    Ok(())
}

#[test]
fn category_override_applies_to_selection() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("rules.yaml"), RULE)?;
    let catalog = load_catalog(dir.path())?;
    let mut severity = BTreeMap::new();
    severity.insert("mapping".parse::<Category>().unwrap(), Severity::Low);
    let selected = catalog.select(&RuleSelection {
        severity,
        ..Default::default()
    });
    assert_eq!(selected.rules[0].severity, Severity::Low);
    Ok(())
}

#[test]
fn severity_roundtrip() {
    let sev: Severity = serde_json::from_str("\"CRITICAL\"").unwrap();
    assert_eq!(sev, Severity::Critical);
    let ser = serde_json::to_string(&sev).unwrap();
    assert_eq!(ser, "\"CRITICAL\"");
}
