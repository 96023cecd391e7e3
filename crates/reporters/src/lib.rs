//! Formatters for unit reports in text, JSON and SARIF.

use engine::{Diagnostic, Finding, UnitReport, Verdict};
use loader::Severity;
use serde::Serialize;
use std::io::{self, Write};
use tracing::debug;

mod sarif;

pub use sarif::to_sarif;

/// Returns the severity colored with simple ANSI codes.
fn color_severity(sev: Severity) -> String {
    let (code, text) = match sev {
        Severity::Info => ("\x1b[32m", "INFO"),
        Severity::Critical => ("\x1b[31m", "CRITICAL"),
        Severity::Low => ("\x1b[32m", "LOW"),
        Severity::Medium => ("\x1b[33m", "MEDIUM"),
        Severity::High => ("\x1b[31m", "HIGH"),
    };
    format!("{code}{text}\x1b[0m")
}

fn verdict_marker(v: Verdict) -> &'static str {
    match v {
        Verdict::Violation => "✘",
        Verdict::Unknown => "?",
        Verdict::Compliant => "✔",
        Verdict::NotApplicable => "-",
    }
}

fn simple_box(title: &str) -> String {
    let width = title.len() + 2;
    format!(
        "╭{}╮\n│ {} │\n╰{}╯\n",
        "─".repeat(width),
        title,
        "─".repeat(width)
    )
}

const RULER: &str =
    "    ──────────────────────────────────────────────────────────────────────────────\n";

fn run_stats(info: &RunInfo, totals: &Totals) -> String {
    let mut output = simple_box("Analysis Status");
    output.push('\n');
    output.push_str(&format!(
        "    Analyzed {} files with {} rules:\n\n",
        info.files_analyzed, info.rules_loaded
    ));

    output.push_str("    VERDICTS\n");
    output.push_str(RULER);
    output.push_str(&format!("    Violations                {}\n", totals.violations));
    output.push_str(&format!("    Unknown                   {}\n", totals.unknown));
    output.push_str(&format!("    Compliant                 {}\n", totals.compliant));
    output.push('\n');

    output.push_str("    PERFORMANCE\n");
    output.push_str(RULER);
    output.push_str(&format!("    Duration                  {}ms\n", info.duration_ms));
    output.push_str(&format!("    Failed files              {}\n", info.failed_files));
    output.push_str(&format!("    Incomplete files          {}\n", totals.incomplete));
    output.push_str(&format!(
        "    Success rate              {:.1}%\n",
        if info.files_analyzed > 0 {
            (info.files_analyzed.saturating_sub(info.failed_files) as f64
                / info.files_analyzed as f64)
                * 100.0
        } else {
            0.0
        }
    ));
    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Supported formats for printing reports.
pub enum Format {
    /// Human-readable output in plain text.
    Text,
    /// JSON structure for integrations.
    Json,
    /// SARIF 2.1.0 log with one result per violation.
    Sarif,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "sarif" => Ok(Format::Sarif),
            other => Err(format!("unknown format '{other}'")),
        }
    }
}

/// Additional information to display in statistics.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub rules_loaded: usize,
    pub files_analyzed: usize,
    pub duration_ms: u64,
    pub failed_files: usize,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
/// Verdict counts over a whole run.
pub struct Totals {
    pub violations: usize,
    pub unknown: usize,
    pub compliant: usize,
    pub incomplete: usize,
}

impl Totals {
    pub fn of(reports: &[UnitReport]) -> Self {
        let mut t = Totals::default();
        for r in reports {
            t.violations += r.count(Verdict::Violation);
            t.unknown += r.count(Verdict::Unknown);
            t.compliant += r.count(Verdict::Compliant);
            if r.incomplete {
                t.incomplete += 1;
            }
        }
        t
    }
}

#[derive(Serialize)]
struct UnitOut<'a> {
    file: &'a str,
    incomplete: bool,
    findings: &'a [Finding],
    #[serde(skip_serializing_if = "no_diagnostics")]
    diagnostics: &'a [Diagnostic],
}

fn no_diagnostics(d: &&[Diagnostic]) -> bool {
    d.is_empty()
}

#[derive(Serialize)]
struct ReportOut<'a> {
    units: Vec<UnitOut<'a>>,
    totals: Totals,
}

/// Prints reports in the selected format to stdout. `show_all` also lists
/// compliant verdicts in text output.
///
/// # Example
/// ```
/// use reporters::{print_reports, Format, RunInfo};
/// let info = RunInfo {
///     rules_loaded: 10,
///     files_analyzed: 5,
///     duration_ms: 1000,
///     failed_files: 0,
/// };
/// print_reports(&[], Format::Text, false, Some(&info)).unwrap();
/// ```
pub fn print_reports(
    reports: &[UnitReport],
    fmt: Format,
    show_all: bool,
    info: Option<&RunInfo>,
) -> io::Result<()> {
    let mut out = io::stdout().lock();
    write_reports(&mut out, reports, fmt, show_all, info)
}

/// Writes reports to any `Write`.
pub fn write_reports<W: Write>(
    out: &mut W,
    reports: &[UnitReport],
    fmt: Format,
    show_all: bool,
    info: Option<&RunInfo>,
) -> io::Result<()> {
    debug!(units = reports.len(), format = ?fmt, "Rendering reports");
    let totals = Totals::of(reports);
    match fmt {
        Format::Text => {
            if let Some(info) = info {
                writeln!(out, "{}", run_stats(info, &totals))?;
            }
            writeln!(out, "{}", simple_box("Results"))?;
            let shown: Vec<&Finding> = reports
                .iter()
                .flat_map(|r| &r.findings)
                .filter(|f| show_all || f.verdict != Verdict::Compliant)
                .collect();
            if shown.is_empty() {
                writeln!(out, "✔ No issues found.")?;
            } else {
                for f in &shown {
                    writeln!(
                        out,
                        "{} {} {}:{}:{} {} [{}]",
                        verdict_marker(f.verdict),
                        color_severity(f.severity),
                        f.file,
                        f.line,
                        f.col,
                        f.rule_id,
                        f.verdict
                    )?;
                    writeln!(out, "    {}", f.message)?;
                    if !f.evidence.is_empty() {
                        writeln!(out, "    ↳  {}", f.evidence)?;
                    }
                    if f.verdict == Verdict::Violation {
                        if let Some(r) = &f.remediation {
                            writeln!(out, "    • Remediation: {r}")?;
                        }
                    }
                    writeln!(out)?;
                }
                writeln!(
                    out,
                    "Violations: {}  Unknown: {}",
                    totals.violations, totals.unknown
                )?;
            }
            let diagnostics: Vec<&Diagnostic> =
                reports.iter().flat_map(|r| &r.diagnostics).collect();
            if !diagnostics.is_empty() {
                writeln!(out)?;
                writeln!(out, "{}", simple_box("Diagnostics"))?;
                for d in diagnostics {
                    writeln!(out, "  {:?} {}: {}", d.kind, d.file, d.message)?;
                }
            }
        }
        Format::Json => {
            let json = ReportOut {
                units: reports
                    .iter()
                    .map(|r| UnitOut {
                        file: &r.file,
                        incomplete: r.incomplete,
                        findings: &r.findings,
                        diagnostics: &r.diagnostics,
                    })
                    .collect(),
                totals,
            };
            serde_json::to_writer_pretty(&mut *out, &json)?;
            writeln!(out)?;
        }
        Format::Sarif => {
            let sarif = sarif::to_sarif(reports);
            serde_json::to_writer_pretty(&mut *out, &sarif)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
