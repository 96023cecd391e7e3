use anyhow::{Context, Result};
use engine::{Engine, EngineConfig, EngineMetrics, UnitReport, Verdict};
use ir::SourceUnit;
use parsers::ParserMetrics;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::AnalyzeArgs;
use crate::config::{load_config, Config};
use crate::output::{self, Format};
use crate::rules::assemble_catalog;
use crate::{
    default_excludes, is_excluded, is_included, parse_exclude, ui, DEFAULT_MAX_FILE_SIZE,
    EXIT_CLEAN, EXIT_ERROR, EXIT_VIOLATIONS,
};

pub const DEFAULT_SUPPRESS_COMMENT: &str = "dblint-ignore";

#[derive(Serialize)]
struct RunMetrics<'a> {
    parser: &'a ParserMetrics,
    engine: &'a EngineMetrics,
    duration_ms: u128,
}

fn init_logging(args: &AnalyzeArgs) {
    let level = if args.quiet {
        LevelFilter::OFF
    } else if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn compile_globs(globs: &[String], what: &str) -> Result<Vec<Regex>> {
    globs
        .iter()
        .map(|g| parse_exclude(g).map_err(|e| anyhow::anyhow!("invalid {what} glob '{g}': {e}")))
        .collect()
}

/// Input files below `roots` that a front-end handles, in traversal order.
pub fn collect_inputs(
    roots: &[PathBuf],
    excludes: &[Regex],
    includes: &[Regex],
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in roots {
        if !root.exists() {
            anyhow::bail!("path not found: {}", root.display());
        }
        loader::visit(
            root,
            &|p| is_excluded(p, excludes, DEFAULT_MAX_FILE_SIZE),
            &mut |p| {
                if parsers::detect_type(p).is_some() && is_included(p, includes) {
                    files.push(p.to_path_buf());
                }
                Ok(())
            },
        )
        .with_context(|| format!("failed to walk {}", root.display()))?;
    }
    files.dedup();
    Ok(files)
}

fn engine_config(args: &AnalyzeArgs, cfg: &Config) -> EngineConfig {
    let defaults = EngineConfig::default();
    EngineConfig {
        max_steps: args
            .max_steps
            .or(cfg.engine.max_steps)
            .unwrap_or(defaults.max_steps),
        unit_timeout: args
            .timeout_unit_ms
            .or(cfg.engine.unit_timeout_ms)
            .map(Duration::from_millis),
        suppress_comment_enabled: defaults.suppress_comment_enabled,
    }
}

/// Parses every input. Files that fail become parse-failure reports.
fn extract(
    files: &[PathBuf],
    suppress_comment: &str,
    quiet: bool,
    metrics: &mut ParserMetrics,
) -> (Vec<SourceUnit>, Vec<UnitReport>) {
    let bar = Mutex::new(if quiet {
        None
    } else {
        ui::ProgressBar::new("Extracting facts", files.len())
    });
    let results: Vec<(&PathBuf, Result<Option<SourceUnit>>)> = files
        .par_iter()
        .map(|path| {
            let res = parsers::parse_file(path, Some(suppress_comment), None);
            if let Ok(mut guard) = bar.lock() {
                if let Some(b) = guard.as_mut() {
                    b.increment(1);
                }
            }
            (path, res)
        })
        .collect();
    if let Ok(mut guard) = bar.lock() {
        if let Some(b) = guard.as_mut() {
            b.finish();
        }
    }

    let mut units = Vec::new();
    let mut failures = Vec::new();
    for (path, res) in results {
        match res {
            Ok(Some(unit)) => {
                metrics.files_parsed += 1;
                units.push(unit);
            }
            Ok(None) => debug!(file = %path.display(), "No front-end for file"),
            Err(e) => {
                metrics.parse_errors += 1;
                warn!(file = %path.display(), error = %format!("{e:#}"), "Skipping unit");
                failures.push(UnitReport::parse_failure(
                    path.to_string_lossy(),
                    format!("{e:#}"),
                ));
            }
        }
    }
    (units, failures)
}

fn write_metrics(path: &Path, metrics: &RunMetrics<'_>, quiet: bool) -> Result<()> {
    let data = serde_json::to_string_pretty(metrics)?;
    if path.as_os_str() == "-" {
        if !quiet {
            eprintln!("{data}");
        }
    } else {
        fs::write(path, data)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }
    Ok(())
}

/// Runs `dblint analyze` and returns the process exit status.
pub fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    init_logging(&args);
    let start = Instant::now();
    let cfg = load_config(args.config.as_deref()).context("failed to load configuration")?;

    if args.format == Format::Text && !args.quiet {
        ui::print_header();
    }

    let threads = args.threads.or(cfg.engine.threads);
    if let Some(n) = threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
        {
            error!("Failed to build global thread pool: {e}");
        }
    }

    let mut catalog_dirs = cfg.catalog_dirs.clone();
    catalog_dirs.extend(args.catalogs.iter().cloned());
    let catalog = assemble_catalog(true, &catalog_dirs)?;
    let mut selection = cfg.selection()?;
    selection.only = args.rules.clone();
    let catalog = catalog.select(&selection);
    if catalog.rules.is_empty() {
        warn!("No rules selected");
    }
    info!(
        rules = catalog.rules.len(),
        version = catalog.version.as_deref().unwrap_or("-"),
        "Catalog ready"
    );

    let mut policies: BTreeMap<String, bool> = cfg.policy.clone();
    policies.extend(args.policies.iter().cloned());
    let rules_loaded = catalog.rules.len();
    let engine = Engine::new(catalog, policies)?;
    let engine_cfg = engine_config(&args, &cfg);

    let mut excludes = args.exclude.clone();
    excludes.extend(compile_globs(&cfg.paths.exclude, "exclude")?);
    if !args.no_default_exclude {
        excludes.extend(default_excludes());
    }
    let includes = compile_globs(&cfg.paths.include, "include")?;
    let files = collect_inputs(&args.paths, &excludes, &includes)?;
    info!(files = files.len(), "Inputs collected");

    let suppress = args
        .suppress_comment
        .clone()
        .or_else(|| cfg.engine.suppress_comment.clone())
        .unwrap_or_else(|| DEFAULT_SUPPRESS_COMMENT.to_string());
    let mut parser_metrics = ParserMetrics::default();
    let (units, failures) = extract(&files, &suppress, args.quiet, &mut parser_metrics);

    let mut engine_metrics = EngineMetrics::default();
    let mut reports = engine.analyze_units(&units, &engine_cfg, Some(&mut engine_metrics));
    let failed_files = failures.len();
    reports.extend(failures);
    reports.sort_by(|a, b| a.file.cmp(&b.file));

    let duration = start.elapsed();
    let info = reporters::RunInfo {
        rules_loaded,
        files_analyzed: files.len(),
        duration_ms: duration.as_millis() as u64,
        failed_files,
    };
    output::print_reports(&reports, args.format, args.all, &info)?;

    if let Some(path) = &args.metrics {
        let metrics = RunMetrics {
            parser: &parser_metrics,
            engine: &engine_metrics,
            duration_ms: duration.as_millis(),
        };
        write_metrics(path, &metrics, args.quiet)?;
    }

    let violations: usize = reports.iter().map(|r| r.count(Verdict::Violation)).sum();
    info!(
        files = files.len(),
        violations,
        failed = failed_files,
        "Analysis completed"
    );
    if !files.is_empty() && failed_files == files.len() {
        return Ok(EXIT_ERROR);
    }
    Ok(if violations > 0 {
        EXIT_VIOLATIONS
    } else {
        EXIT_CLEAN
    })
}
