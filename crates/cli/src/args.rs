use clap::{Args as ClapArgs, Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;

use crate::output::Format;

fn parse_threads(s: &str) -> Result<usize, String> {
    let v: usize = s
        .parse()
        .map_err(|e: std::num::ParseIntError| e.to_string())?;
    if v == 0 {
        Err("threads must be greater than 0".into())
    } else {
        Ok(v)
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "dblint - static analysis of database, resource and ORM usage",
    long_about = "dblint reads Java sources (or pre-extracted fact files), tracks connections, statements, transactions and untrusted strings through each method, and reports every rule of its catalog as violated, compliant or unknown.

Examples:
  dblint analyze src/                      # Analyze a source tree
  dblint analyze src/ --format sarif       # SARIF output for code scanning
  dblint analyze . --rules 'leak,resource-*'
  dblint rules list                        # Show the active catalog
  dblint rules verify my-catalog/          # Check a catalog and its exemplars",
    subcommand_required = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: Option<bool>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze source files against the rule catalog
    Analyze(AnalyzeArgs),
    /// Inspect and verify rule catalogs
    #[command(subcommand, alias = "rule")]
    Rules(RulesCmd),
}

#[derive(ClapArgs, Debug)]
pub struct AnalyzeArgs {
    /// Files or directories to analyze
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    /// Run only rules matching these ids, globs or categories
    #[arg(long, value_delimiter = ',')]
    pub rules: Vec<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,
    /// Additional catalog directory (repeatable)
    #[arg(long = "catalog")]
    pub catalogs: Vec<PathBuf>,
    /// Configuration file (defaults to ./dblint.toml, then the user config)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Number of worker threads
    #[arg(long, value_parser = parse_threads)]
    pub threads: Option<usize>,
    /// Exclude paths matching these globs
    #[arg(long, value_parser = crate::parse_exclude, value_delimiter = ',')]
    pub exclude: Vec<Regex>,
    /// Don't use default exclusion patterns
    #[arg(long)]
    pub no_default_exclude: bool,
    /// Step budget per unit
    #[arg(long)]
    pub max_steps: Option<usize>,
    /// Time budget per unit in milliseconds
    #[arg(long)]
    pub timeout_unit_ms: Option<u64>,
    /// Set a policy switch, e.g. `--policy env_credentials_allowed=false`
    #[arg(long = "policy", value_parser = parse_policy)]
    pub policies: Vec<(String, bool)>,
    /// Also list compliant verdicts in text output
    #[arg(long)]
    pub all: bool,
    /// Write engine metrics as JSON to this file (`-` for stderr)
    #[arg(long)]
    pub metrics: Option<PathBuf>,
    /// Marker comment that suppresses findings on its line
    #[arg(long = "suppress-comment")]
    pub suppress_comment: Option<String>,
    /// Enable debug output
    #[arg(long)]
    pub debug: bool,
    /// Suppress non-essential output
    #[arg(long)]
    pub quiet: bool,
}

fn parse_policy(s: &str) -> Result<(String, bool), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=true|false, got '{s}'"))?;
    let value = value
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("policy value must be true or false, got '{value}'"))?;
    Ok((name.trim().to_string(), value))
}

#[derive(Subcommand)]
pub enum RulesCmd {
    /// List the rules of the catalog
    List {
        /// Additional catalog directory
        #[arg(long = "catalog")]
        catalogs: Vec<PathBuf>,
        /// Skip the built-in catalog
        #[arg(long)]
        no_builtin: bool,
    },
    /// Compile a catalog and check every rule against its exemplars
    Verify {
        /// Catalog directory or YAML file
        path: PathBuf,
        /// Show every failure without truncation
        #[arg(long)]
        full: bool,
    },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_flag_parses_name_and_value() {
        assert_eq!(
            parse_policy("env_credentials_allowed=false").unwrap(),
            ("env_credentials_allowed".to_string(), false)
        );
        assert!(parse_policy("strict").is_err());
        assert!(parse_policy("strict=maybe").is_err());
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(parse_threads("0").is_err());
        assert_eq!(parse_threads("4").unwrap(), 4);
    }

    #[test]
    fn analyze_accepts_rule_filters() {
        let cli = Cli::try_parse_from([
            "dblint",
            "analyze",
            "src",
            "--rules",
            "leak,dynamic-query-*",
            "--format",
            "json",
        ])
        .unwrap();
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.rules, vec!["leak", "dynamic-query-*"]);
        assert_eq!(args.format, Format::Json);
    }
}
