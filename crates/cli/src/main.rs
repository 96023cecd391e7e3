//! Entry point for the command-line interface.
//! Delegates to dedicated modules for argument handling,
//! analysis and catalog management.

use dblint::analyze::run_analyze;
use dblint::args::{parse_cli, Commands, RulesCmd};
use dblint::rules::{list_rules, verify_rules};
use dblint::EXIT_ERROR;

fn main() {
    let cli = parse_cli();
    let res = match cli.command {
        Commands::Analyze(args) => run_analyze(args),
        Commands::Rules(RulesCmd::List {
            catalogs,
            no_builtin,
        }) => list_rules(&catalogs, no_builtin),
        Commands::Rules(RulesCmd::Verify { path, full }) => verify_rules(&path, full),
    };
    match res {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
