//! Conversion of violations to SARIF 2.1.0.

use engine::{Finding, UnitReport, Verdict};
use loader::Severity;
use serde_sarif::sarif;
use std::collections::BTreeSet;

fn level(sev: Severity) -> sarif::ResultLevel {
    match sev {
        Severity::Info => sarif::ResultLevel::Note,
        Severity::Critical => sarif::ResultLevel::Error,
        Severity::Low => sarif::ResultLevel::Note,
        Severity::Medium => sarif::ResultLevel::Warning,
        Severity::High => sarif::ResultLevel::Error,
    }
}

fn result(f: &Finding) -> sarif::Result {
    let location = sarif::Location::builder()
        .physical_location(
            sarif::PhysicalLocation::builder()
                .artifact_location(sarif::ArtifactLocation::builder().uri(f.file.clone()).build())
                .region(
                    sarif::Region::builder()
                        .start_line(f.line as i64)
                        .start_column(f.col as i64)
                        .build(),
                )
                .build(),
        )
        .build();

    sarif::Result::builder()
        .rule_id(f.rule_id.clone())
        .message(sarif::Message::builder().text(f.message.clone()).build())
        .level(level(f.severity))
        .locations(vec![location])
        .build()
}

/// One SARIF run whose results are the violations of every report. Other
/// verdicts are not results in the SARIF sense and are left out.
pub fn to_sarif(reports: &[UnitReport]) -> sarif::Sarif {
    let violations: Vec<&Finding> = reports
        .iter()
        .flat_map(|r| &r.findings)
        .filter(|f| f.verdict == Verdict::Violation)
        .collect();
    let rule_ids: BTreeSet<&str> = violations.iter().map(|f| f.rule_id.as_str()).collect();
    let rules: Vec<sarif::ReportingDescriptor> = rule_ids
        .into_iter()
        .map(|id| sarif::ReportingDescriptor::builder().id(id.to_string()).build())
        .collect();
    let results: Vec<sarif::Result> = violations.into_iter().map(result).collect();

    sarif::Sarif::builder()
        .version(serde_json::json!("2.1.0"))
        .schema(sarif::SCHEMA_URL.to_string())
        .runs(vec![sarif::Run::builder()
            .tool(
                sarif::Tool::builder()
                    .driver(
                        sarif::ToolComponent::builder()
                            .name("dblint")
                            .version(env!("CARGO_PKG_VERSION"))
                            .rules(rules)
                            .build(),
                    )
                    .build(),
            )
            .results(results)
            .build()])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::Finding;
    use loader::Category;

    fn finding(rule: &str, verdict: Verdict, line: usize) -> Finding {
        Finding {
            id: blake3::hash(format!("{rule}:Dao.java:{line}:9").as_bytes())
                .to_hex()
                .to_string(),
            rule_id: rule.into(),
            category: Category::Injection,
            severity: Severity::High,
            verdict,
            file: "src/Dao.java".into(),
            line,
            col: 9,
            evidence: "st.executeQuery(sql)".into(),
            message: "dummy".into(),
            remediation: None,
        }
    }

    #[test]
    fn only_violations_become_results() {
        let report = UnitReport {
            file: "src/Dao.java".into(),
            findings: vec![
                finding("dynamic-query-injection-risk", Verdict::Violation, 10),
                finding("dynamic-query-injection-risk", Verdict::Unknown, 12),
                finding("statement-over-prepared", Verdict::Compliant, 14),
            ],
            ..Default::default()
        };
        let rendered = serde_json::to_value(to_sarif(&[report])).unwrap();
        assert_eq!(rendered["version"], "2.1.0");
        let run = &rendered["runs"][0];
        assert_eq!(run["tool"]["driver"]["name"], "dblint");
        assert_eq!(
            run["tool"]["driver"]["rules"][0]["id"],
            "dynamic-query-injection-risk"
        );
        let results = run["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["ruleId"], "dynamic-query-injection-risk");
        assert_eq!(results[0]["level"], "error");
        let region = &results[0]["locations"][0]["physicalLocation"]["region"];
        assert_eq!(region["startLine"], 10);
        assert_eq!(region["startColumn"], 9);
    }
}
