use anyhow::{Context, Result};
use colored::*;
use engine::{Engine, EngineConfig, Verdict};
use loader::{Catalog, Rule, Severity};
use std::{env, fs, path::Path, path::PathBuf};
use tracing::{debug, info};

use crate::{EXIT_CLEAN, EXIT_ERROR, EXIT_VIOLATIONS};

/// Compiles a catalog from a directory of YAML documents or a single file.
pub fn load_catalog_path(path: &Path) -> Result<Catalog> {
    if path.is_dir() {
        loader::load_catalog(path)
    } else {
        let src = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        Catalog::from_yaml_str(&src, &path.to_string_lossy())
    }
}

/// Built-in catalog (unless `builtin` is false) merged with every extra
/// directory, in order.
pub fn assemble_catalog(builtin: bool, extra: &[PathBuf]) -> Result<Catalog> {
    let mut catalog = if builtin {
        Catalog::builtin().context("built-in catalog")?
    } else {
        Catalog::default()
    };
    for dir in extra {
        let more = load_catalog_path(dir)?;
        info!(dir = %dir.display(), rules = more.rules.len(), "Catalog loaded");
        catalog
            .merge(more)
            .with_context(|| format!("merging catalog {}", dir.display()))?;
    }
    Ok(catalog)
}

/// Check if colored output should be used
fn use_colored_output() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    if let Ok(term) = env::var("TERM") {
        if term == "dumb" || term == "unknown" {
            return false;
        }
    }
    if env::var("CI").is_ok() || env::var("CONTINUOUS_INTEGRATION").is_ok() {
        return false;
    }
    true
}

fn print_error(tag: &str, message: &str) {
    if use_colored_output() {
        println!("[{}] {}", tag.bright_red().bold(), message);
    } else {
        println!("[{tag}] {message}");
    }
}

fn print_success(tag: &str, message: &str) {
    if use_colored_output() {
        println!("[{}] {}", tag.bright_green().bold(), message);
    } else {
        println!("[{tag}] {message}");
    }
}

fn severity_label(sev: Severity) -> ColoredString {
    let text = sev.to_string().to_lowercase();
    if !use_colored_output() {
        return text.normal();
    }
    match sev {
        Severity::Critical => text.bright_red(),
        Severity::High => text.bright_magenta(),
        Severity::Medium => text.bright_yellow(),
        Severity::Low => text.bright_blue(),
        Severity::Info => text.bright_cyan(),
    }
}

pub fn list_rules(extra: &[PathBuf], no_builtin: bool) -> Result<i32> {
    let catalog = assemble_catalog(!no_builtin, extra)?;
    if let Some(v) = &catalog.version {
        println!("Catalog version {v}");
    }
    println!(
        "{:<36} {:<19} {:<10} {:<12} ENABLED",
        "ID", "CATEGORY", "SEVERITY", "TRIGGER"
    );
    for rule in &catalog.rules {
        let sev = severity_label(rule.severity);
        // Pad before coloring so escape codes don't shift the columns.
        let pad = " ".repeat(10usize.saturating_sub(rule.severity.to_string().len()));
        println!(
            "{:<36} {:<19} {}{} {:<12} {}",
            rule.id,
            rule.category.as_str(),
            sev,
            pad,
            rule.trigger.as_str(),
            if rule.enabled { "yes" } else { "no" }
        );
    }
    println!();
    println!("{} rules", catalog.rules.len());
    Ok(EXIT_CLEAN)
}

#[derive(Debug, PartialEq)]
/// Exemplar that did not produce the expected outcome.
pub struct ExemplarFailure {
    pub rule_id: String,
    pub example: usize,
    pub problem: String,
}

fn rule_violations(engine: &Engine, rule: &Rule, label: &str, src: &str) -> Result<usize> {
    let unit = parsers::parse_java(src, label, None)
        .with_context(|| format!("exemplar {label} does not parse"))?;
    let report = engine.analyze_unit(&unit, &EngineConfig::default());
    Ok(report
        .findings
        .iter()
        .filter(|f| f.rule_id == rule.id && f.verdict == Verdict::Violation)
        .count())
}

/// Runs every rule's exemplars: `bad` sources must be reported as a
/// violation of that rule and `good` sources must not.
pub fn check_exemplars(catalog: &Catalog) -> Result<Vec<ExemplarFailure>> {
    let mut failures = Vec::new();
    for rule in &catalog.rules {
        for (i, example) in rule.examples.iter().enumerate() {
            let engine = Engine::new(catalog.clone(), example.policies.clone())?;
            if let Some(bad) = &example.bad {
                let label = format!("{}/bad-{}.java", rule.id, i);
                match rule_violations(&engine, rule, &label, bad) {
                    Ok(0) => failures.push(ExemplarFailure {
                        rule_id: rule.id.clone(),
                        example: i,
                        problem: "violating exemplar is not reported".into(),
                    }),
                    Ok(_) => {}
                    Err(e) => failures.push(ExemplarFailure {
                        rule_id: rule.id.clone(),
                        example: i,
                        problem: format!("{e:#}"),
                    }),
                }
            }
            if let Some(good) = &example.good {
                let label = format!("{}/good-{}.java", rule.id, i);
                match rule_violations(&engine, rule, &label, good) {
                    Ok(0) => {}
                    Ok(n) => failures.push(ExemplarFailure {
                        rule_id: rule.id.clone(),
                        example: i,
                        problem: format!("compliant exemplar reported {n} time(s)"),
                    }),
                    Err(e) => failures.push(ExemplarFailure {
                        rule_id: rule.id.clone(),
                        example: i,
                        problem: format!("{e:#}"),
                    }),
                }
            }
            debug!(rule = %rule.id, example = i, "Exemplar checked");
        }
    }
    Ok(failures)
}

/// Compiles the catalog at `path` and checks its exemplars. Rules see the
/// built-in vocabulary and policies in addition to their own.
pub fn verify_rules(path: &Path, full: bool) -> Result<i32> {
    println!("{}", "Verifying catalog...".bright_blue().bold());
    println!("Path: {}", path.display().to_string().bright_white());
    let catalog = match load_catalog_path(path) {
        Ok(c) => c,
        Err(e) => {
            print_error("error", &format!("{e:#}"));
            return Ok(EXIT_ERROR);
        }
    };
    print_success(
        "ok",
        &format!("{} rules compiled", catalog.rules.len()),
    );

    let builtin = Catalog::builtin()?;
    let mut vocabulary = builtin.vocabulary;
    vocabulary.extend(catalog.vocabulary.clone());
    let mut policies = builtin.policies;
    policies.extend(catalog.policies.clone());
    let combined = Catalog {
        vocabulary,
        policies,
        ..catalog
    };
    if let Err(e) = Engine::new(combined.clone(), Default::default()) {
        print_error("error", &format!("{e:#}"));
        return Ok(EXIT_ERROR);
    }

    let failures = check_exemplars(&combined)?;
    let examples: usize = combined.rules.iter().map(|r| r.examples.len()).sum();
    if failures.is_empty() {
        print_success("ok", &format!("{examples} exemplar pairs conform"));
        return Ok(EXIT_CLEAN);
    }
    println!();
    println!("{}", "Exemplar failures:".bright_red().bold());
    for (i, f) in failures.iter().enumerate() {
        if full || i < 10 {
            println!(
                "  {} {} #{}: {}",
                "•".bright_red(),
                f.rule_id.bright_white(),
                f.example,
                f.problem
            );
        } else {
            println!(
                "  {} {} more failures...",
                "•".bright_red(),
                (failures.len() - 10).to_string().bright_yellow()
            );
            break;
        }
    }
    Ok(EXIT_VIOLATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_exemplars_pass_verification() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(check_exemplars(&catalog).unwrap(), vec![]);
    }

    #[test]
    fn mislabelled_exemplar_is_reported() {
        let mut catalog = Catalog::builtin().unwrap();
        let rule = catalog
            .rules
            .iter_mut()
            .find(|r| r.id == "statement-over-prepared")
            .unwrap();
        let good = rule.examples[0].good.clone();
        rule.examples[0].bad = good;
        let failures = check_exemplars(&catalog).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].rule_id, "statement-over-prepared");
    }
}
