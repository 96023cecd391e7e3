//! Matching engine that evaluates a rule catalog over fact streams.
//!
//! Each unit is analyzed on its own: a forward pass ([`flow::Analyzer`])
//! updates the resolver and the trackers fact by fact and, after every
//! update, the rules triggered by that fact are evaluated against the
//! resulting state. Facts of a loop body walked again are evaluated again;
//! a location keeps its strongest verdict. Units are independent and are spread over the rayon
//! pool; the catalog is shared read-only.

use ir::{FactKind, Meta, SourceUnit};
use loader::{Catalog, Category, Rule, Severity, Tri, Trigger};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod custom;
pub mod eval;
pub mod flow;
pub mod resolver;
pub mod resources;
pub mod taint;
pub mod transactions;

pub use custom::{CustomPredicate, CustomRegistry};
pub use eval::{EvalContext, Subject};
pub use flow::{Analyzer, FactEffects, FlowState};
pub use resources::HandleReport;
pub use transactions::MethodTxSummary;

/// Facts processed between two checks of the wall-clock budget.
const TIMEOUT_CHECK_INTERVAL: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Violation,
    Compliant,
    NotApplicable,
    Unknown,
}

impl Verdict {
    /// Combines the rule's two predicates. An undecidable `applies` only
    /// matters when the violation side could still hold.
    pub fn decide(applies: Tri, violation: Tri) -> Verdict {
        match (applies, violation) {
            (Tri::False, _) => Verdict::NotApplicable,
            (Tri::Unknown, Tri::False) => Verdict::NotApplicable,
            (Tri::Unknown, _) => Verdict::Unknown,
            (Tri::True, Tri::True) => Verdict::Violation,
            (Tri::True, Tri::False) => Verdict::Compliant,
            (Tri::True, Tri::Unknown) => Verdict::Unknown,
        }
    }

    /// Rank used when two evaluations hit the same location.
    pub fn strength(self) -> u8 {
        match self {
            Verdict::Violation => 3,
            Verdict::Unknown => 2,
            Verdict::Compliant => 1,
            Verdict::NotApplicable => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Violation => "violation",
            Verdict::Compliant => "compliant",
            Verdict::NotApplicable => "not_applicable",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A rule's verdict at one location of a unit.
pub struct Finding {
    /// Stable identifier derived from rule, file and location.
    pub id: String,
    pub rule_id: String,
    pub category: Category,
    pub severity: Severity,
    pub verdict: Verdict,
    pub file: String,
    pub line: usize,
    pub col: usize,
    /// Source text of the fact the verdict is attached to.
    pub evidence: String,
    pub message: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosticKind {
    ParseError,
    BudgetExceeded,
    RuleFault,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Non-fatal problem met while processing a unit.
pub struct Diagnostic {
    pub file: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UnitReport {
    pub file: String,
    pub findings: Vec<Finding>,
    /// Analysis stopped early; findings cover a prefix of the unit.
    pub incomplete: bool,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip)]
    pub handles: Vec<HandleReport>,
    #[serde(skip)]
    pub transactions: Vec<MethodTxSummary>,
}

impl UnitReport {
    /// Report for a file whose facts could not be extracted.
    pub fn parse_failure(file: impl Into<String>, message: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            diagnostics: vec![Diagnostic {
                file: file.clone(),
                kind: DiagnosticKind::ParseError,
                message: message.into(),
            }],
            file,
            ..Default::default()
        }
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.findings.iter().filter(|f| f.verdict == verdict).count()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Work units a single unit may spend: one per fact plus the size of
    /// every state merge.
    pub max_steps: usize,
    pub unit_timeout: Option<Duration>,
    /// Drop findings on lines carrying the suppression comment.
    pub suppress_comment_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            unit_timeout: None,
            suppress_comment_enabled: true,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct EngineMetrics {
    pub units: usize,
    pub facts: usize,
    pub findings: usize,
    pub violations: usize,
    pub unknown: usize,
    pub incomplete_units: usize,
    pub unit_times_ms: BTreeMap<String, u128>,
}

impl EngineMetrics {
    fn record(&mut self, unit: &SourceUnit, report: &UnitReport, elapsed: Duration) {
        self.units += 1;
        self.facts += unit.facts.len();
        self.findings += report.findings.len();
        self.violations += report.count(Verdict::Violation);
        self.unknown += report.count(Verdict::Unknown);
        if report.incomplete {
            self.incomplete_units += 1;
        }
        self.unit_times_ms
            .insert(unit.path.clone(), elapsed.as_millis());
    }
}

/// Compiled catalog ready for analysis.
pub struct Engine {
    catalog: Catalog,
    policies: BTreeMap<String, bool>,
    custom: CustomRegistry,
    by_trigger: HashMap<Trigger, Vec<usize>>,
}

/// Location and evidence a verdict is attached to.
struct Anchor<'a> {
    meta: Meta,
    evidence: &'a str,
}

struct Collector<'u> {
    unit: &'u SourceUnit,
    findings: Vec<Finding>,
    diagnostics: Vec<Diagnostic>,
}

impl Engine {
    /// Engine with the built-in custom predicates. `policy` overrides the
    /// catalog's policy defaults.
    pub fn new(catalog: Catalog, policy: BTreeMap<String, bool>) -> anyhow::Result<Self> {
        Self::with_predicates(catalog, policy, CustomRegistry::builtin())
    }

    pub fn with_predicates(
        catalog: Catalog,
        policy: BTreeMap<String, bool>,
        custom: CustomRegistry,
    ) -> anyhow::Result<Self> {
        for rule in &catalog.rules {
            let mut names = rule.applies.custom_names();
            names.extend(rule.violation.custom_names());
            for name in names {
                if !custom.contains(&name) {
                    anyhow::bail!(
                        "rule '{}' references unknown custom predicate '{}'",
                        rule.id,
                        name
                    );
                }
            }
        }
        let mut policies = catalog.policies.clone();
        for (name, value) in policy {
            if policies.contains_key(&name) {
                policies.insert(name, value);
            } else {
                warn!(policy = %name, "Ignoring override of unknown policy");
            }
        }
        let mut by_trigger: HashMap<Trigger, Vec<usize>> = HashMap::new();
        for (i, rule) in catalog.rules.iter().enumerate() {
            by_trigger.entry(rule.trigger).or_default().push(i);
        }
        debug!(
            rules = catalog.rules.len(),
            custom = custom.names().count(),
            "Engine ready"
        );
        Ok(Self {
            catalog,
            policies,
            custom,
            by_trigger,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn policies(&self) -> &BTreeMap<String, bool> {
        &self.policies
    }

    fn rules_for(&self, trigger: Trigger) -> impl Iterator<Item = &Rule> {
        self.by_trigger
            .get(&trigger)
            .into_iter()
            .flatten()
            .map(|i| &self.catalog.rules[*i])
    }

    /// Evaluates one rule, containing errors and panics.
    fn verdict(&self, rule: &Rule, ctx: &EvalContext<'_>, out: &mut Collector<'_>) -> Verdict {
        let res = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<Verdict> {
            let applies = eval::eval(&rule.applies, ctx)?;
            if applies == Tri::False {
                return Ok(Verdict::NotApplicable);
            }
            let violation = eval::eval(&rule.violation, ctx)?;
            Ok(Verdict::decide(applies, violation))
        }));
        let message = match res {
            Ok(Ok(v)) => return v,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    format!("panic: {s}")
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    format!("panic: {s}")
                } else {
                    "panic".to_string()
                }
            }
        };
        warn!(rule = %rule.id, file = %out.unit.path, error = %message, "Rule evaluation failed");
        out.diagnostics.push(Diagnostic {
            file: out.unit.path.clone(),
            kind: DiagnosticKind::RuleFault,
            message: format!("rule '{}': {}", rule.id, message),
        });
        Verdict::Unknown
    }

    fn run_rules(
        &self,
        trigger: Trigger,
        ctx: &EvalContext<'_>,
        anchor: Anchor<'_>,
        out: &mut Collector<'_>,
    ) {
        for rule in self.rules_for(trigger) {
            let verdict = self.verdict(rule, ctx, out);
            if verdict == Verdict::NotApplicable {
                continue;
            }
            out.findings.push(Finding {
                id: String::new(),
                rule_id: rule.id.clone(),
                category: rule.category,
                severity: rule.severity,
                verdict,
                file: out.unit.path.clone(),
                line: anchor.meta.line,
                col: anchor.meta.column,
                evidence: anchor.evidence.trim().to_string(),
                message: finding_message(rule, verdict, &ctx.subject),
                remediation: rule.remediation.clone(),
            });
        }
    }

    fn handle_end(&self, report: &HandleReport, imports: &[String], out: &mut Collector<'_>) {
        let ctx = EvalContext {
            subject: Subject::Handle(report),
            imports,
            policies: &self.policies,
            custom: &self.custom,
        };
        let anchor = Anchor {
            meta: report.meta,
            evidence: &report.excerpt,
        };
        self.run_rules(Trigger::HandleEnd, &ctx, anchor, out);
    }

    /// Runs the whole catalog over one unit.
    pub fn analyze_unit(&self, unit: &SourceUnit, cfg: &EngineConfig) -> UnitReport {
        let start = Instant::now();
        debug!(file = %unit.path, facts = unit.facts.len(), "Analyzing unit");
        let mut analyzer = Analyzer::new(&self.catalog.vocabulary, unit);
        let mut out = Collector {
            unit,
            findings: Vec::new(),
            diagnostics: Vec::new(),
        };
        let mut handles = Vec::new();
        let mut incomplete = false;

        let mut next = 0;
        let mut processed = 0;
        while let Some(fact) = unit.facts.get(next) {
            let mut fx = analyzer.step(fact);
            processed += 1;
            let repeat = fx.repeat_from.take();
            next = repeat.unwrap_or(next + 1);
            let scope_fact = matches!(
                fact.kind,
                FactKind::ScopeEnter { .. } | FactKind::ScopeExit { .. }
            );
            if repeat.is_none() && (fx.reachable || scope_fact) {
                let ctx = EvalContext {
                    subject: Subject::Fact { fact, fx: &fx },
                    imports: analyzer.imports(),
                    policies: &self.policies,
                    custom: &self.custom,
                };
                let anchor = match (&fact.kind, &fx.anchor) {
                    (FactKind::ScopeExit { .. }, Some((meta, excerpt))) => Anchor {
                        meta: *meta,
                        evidence: excerpt,
                    },
                    _ => Anchor {
                        meta: fact.meta,
                        evidence: &fact.excerpt,
                    },
                };
                self.run_rules(Trigger::for_fact(&fact.kind), &ctx, anchor, &mut out);
            }
            for report in fx.ended {
                self.handle_end(&report, analyzer.imports(), &mut out);
                keep_latest(&mut handles, report);
            }

            let over_steps = analyzer.steps > cfg.max_steps;
            let over_time = processed % TIMEOUT_CHECK_INTERVAL == 0
                && cfg.unit_timeout.is_some_and(|t| start.elapsed() > t);
            if over_steps || over_time {
                let message = if over_steps {
                    format!("step budget of {} exceeded after {} facts", cfg.max_steps, processed)
                } else {
                    format!("time budget exceeded after {} facts", processed)
                };
                warn!(file = %unit.path, "{}", message);
                out.diagnostics.push(Diagnostic {
                    file: unit.path.clone(),
                    kind: DiagnosticKind::BudgetExceeded,
                    message,
                });
                incomplete = true;
                break;
            }
        }

        if !incomplete {
            for report in analyzer.finish() {
                self.handle_end(&report, analyzer.imports(), &mut out);
                keep_latest(&mut handles, report);
            }
        }

        let mut findings = out.findings;
        if cfg.suppress_comment_enabled && !unit.suppressed.is_empty() {
            findings.retain(|f| !unit.suppressed.contains(&f.line));
        }
        dedup_findings(&mut findings);
        for f in &mut findings {
            f.id = finding_id(&f.rule_id, &f.file, f.line, f.col);
        }
        debug!(
            file = %unit.path,
            findings = findings.len(),
            time_ms = start.elapsed().as_millis(),
            "Unit analyzed"
        );
        UnitReport {
            file: unit.path.clone(),
            findings,
            incomplete,
            diagnostics: out.diagnostics,
            handles,
            transactions: analyzer.method_summaries().to_vec(),
        }
    }

    /// Analyzes `units` in parallel. Reports keep the input order.
    pub fn analyze_units(
        &self,
        units: &[SourceUnit],
        cfg: &EngineConfig,
        metrics: Option<&mut EngineMetrics>,
    ) -> Vec<UnitReport> {
        debug!(units = units.len(), rules = self.catalog.rules.len(), "Starting analysis");
        let timed: Vec<(UnitReport, Duration)> = units
            .par_iter()
            .map(|u| {
                let start = Instant::now();
                let report = self.analyze_unit(u, cfg);
                (report, start.elapsed())
            })
            .collect();
        if let Some(m) = metrics {
            for (unit, (report, elapsed)) in units.iter().zip(&timed) {
                m.record(unit, report, *elapsed);
            }
        }
        timed.into_iter().map(|(r, _)| r).collect()
    }
}

/// A handle ended again by a later walk of a loop body replaces its earlier
/// report.
fn keep_latest(handles: &mut Vec<HandleReport>, report: HandleReport) {
    match handles.iter_mut().find(|h| h.id == report.id) {
        Some(previous) => *previous = report,
        None => handles.push(report),
    }
}

/// One finding per (rule, location), keeping the strongest verdict, sorted
/// by location then rule id.
fn dedup_findings(findings: &mut Vec<Finding>) {
    findings.sort_by(|a, b| {
        (a.line, a.col, &a.rule_id)
            .cmp(&(b.line, b.col, &b.rule_id))
            .then(b.verdict.strength().cmp(&a.verdict.strength()))
    });
    findings.dedup_by(|later, first| {
        later.line == first.line && later.col == first.col && later.rule_id == first.rule_id
    });
}

fn finding_id(rule: &str, file: &str, line: usize, col: usize) -> String {
    blake3::hash(format!("{}:{}:{}:{}", rule, file, line, col).as_bytes())
        .to_hex()
        .to_string()
}

/// The rule's message for violations and unknowns. Compliant locations get
/// the rule's `compliant_message`, or a neutral line naming the rule.
fn finding_message(rule: &Rule, verdict: Verdict, subject: &Subject<'_>) -> String {
    match verdict {
        Verdict::Violation | Verdict::Unknown => render_message(&rule.message, subject),
        Verdict::Compliant | Verdict::NotApplicable => match &rule.compliant_message {
            Some(template) => render_message(template, subject),
            None => format!("No {} issue found by {}", rule.category, rule.id),
        },
    }
}

/// Fills `{symbol}`, `{kind}` and `{method}` placeholders.
fn render_message(template: &str, subject: &Subject<'_>) -> String {
    if !template.contains('{') {
        return template.to_string();
    }
    let (symbol, kind, method) = match subject {
        Subject::Handle(h) => (Some(h.symbol.as_str()), Some(h.kind.as_str()), None),
        Subject::Fact { fact, fx } => match &fact.kind {
            FactKind::Call { method, result, .. } => (
                result.as_deref(),
                fx.receiver_kinds.first().map(String::as_str),
                Some(method.as_str()),
            ),
            FactKind::Declare { symbol, .. } | FactKind::Assign { symbol, .. } => {
                (Some(symbol.as_str()), None, None)
            }
            FactKind::FieldStore { field, .. } => (Some(field.as_str()), None, None),
            FactKind::StringBuild { result, .. } => (Some(result.as_str()), None, None),
            FactKind::AnnotationAttach { target, .. } => (Some(target.as_str()), None, None),
            FactKind::ScopeEnter { scope, .. } | FactKind::ScopeExit { scope, .. } => {
                let name = match scope {
                    ir::ScopeKind::Method { name, .. } | ir::ScopeKind::Class { name } => {
                        Some(name.as_str())
                    }
                    _ => None,
                };
                (None, None, name)
            }
            _ => (None, None, None),
        },
    };
    template
        .replace("{symbol}", symbol.unwrap_or("value"))
        .replace("{kind}", kind.unwrap_or("resource"))
        .replace("{method}", method.unwrap_or("method"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_table() {
        use Tri::*;
        assert_eq!(Verdict::decide(False, True), Verdict::NotApplicable);
        assert_eq!(Verdict::decide(Unknown, False), Verdict::NotApplicable);
        assert_eq!(Verdict::decide(Unknown, True), Verdict::Unknown);
        assert_eq!(Verdict::decide(True, True), Verdict::Violation);
        assert_eq!(Verdict::decide(True, False), Verdict::Compliant);
        assert_eq!(Verdict::decide(True, Unknown), Verdict::Unknown);
    }

    fn finding(rule: &str, line: usize, verdict: Verdict) -> Finding {
        Finding {
            id: String::new(),
            rule_id: rule.into(),
            category: Category::Leak,
            severity: Severity::Medium,
            verdict,
            file: "A.java".into(),
            line,
            col: 5,
            evidence: String::new(),
            message: String::new(),
            remediation: None,
        }
    }

    #[test]
    fn dedup_keeps_strongest_and_sorts() {
        let mut fs = vec![
            finding("b", 4, Verdict::Compliant),
            finding("a", 4, Verdict::Compliant),
            finding("a", 4, Verdict::Violation),
            finding("a", 2, Verdict::Unknown),
            finding("a", 4, Verdict::Unknown),
        ];
        dedup_findings(&mut fs);
        let got: Vec<(usize, &str, Verdict)> = fs
            .iter()
            .map(|f| (f.line, f.rule_id.as_str(), f.verdict))
            .collect();
        assert_eq!(
            got,
            vec![
                (2, "a", Verdict::Unknown),
                (4, "a", Verdict::Violation),
                (4, "b", Verdict::Compliant),
            ]
        );
    }

    #[test]
    fn compliant_findings_use_their_own_message() {
        let catalog = Catalog::from_yaml_str(
            r#"
rules:
  - id: leak
    category: leak
    trigger: handle_end
    violation: { handle_state: leaked }
    message: "{kind} '{symbol}' leaked"
    compliant_message: "{kind} '{symbol}' released"
  - id: plain
    category: leak
    trigger: handle_end
    violation: { handle_state: leaked }
    message: "{symbol} leaked"
"#,
            "inline",
        )
        .unwrap();
        let handle = HandleReport {
            id: 1,
            kind: "connection".into(),
            symbol: "c".into(),
            meta: Meta::new(3, 9),
            excerpt: String::new(),
            state: ir::HandleState::Closed,
            uncertain: false,
            transitions: Vec::new(),
        };
        let subject = Subject::Handle(&handle);
        let (leak, plain) = (&catalog.rules[0], &catalog.rules[1]);
        assert_eq!(
            finding_message(leak, Verdict::Violation, &subject),
            "connection 'c' leaked"
        );
        assert_eq!(
            finding_message(leak, Verdict::Compliant, &subject),
            "connection 'c' released"
        );
        assert_eq!(finding_message(plain, Verdict::Unknown, &subject), "c leaked");
        assert_eq!(
            finding_message(plain, Verdict::Compliant, &subject),
            "No leak issue found by plain"
        );
    }

    #[test]
    fn finding_ids_are_stable() {
        let a = finding_id("resource-cleanup", "A.java", 3, 7);
        assert_eq!(a, finding_id("resource-cleanup", "A.java", 3, 7));
        assert_ne!(a, finding_id("resource-cleanup", "A.java", 3, 8));
        assert_eq!(a.len(), 64);
    }
}
