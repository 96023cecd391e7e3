use clap::ValueEnum;
use engine::UnitReport;
use reporters::{self, RunInfo};

/// Supported output formats for analysis results.
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum Format {
    Text,
    Json,
    Sarif,
}

impl From<Format> for reporters::Format {
    fn from(fmt: Format) -> Self {
        match fmt {
            Format::Text => reporters::Format::Text,
            Format::Json => reporters::Format::Json,
            Format::Sarif => reporters::Format::Sarif,
        }
    }
}

pub fn print_reports(
    reports: &[UnitReport],
    fmt: Format,
    show_all: bool,
    info: &RunInfo,
) -> anyhow::Result<()> {
    let info = (fmt == Format::Text).then_some(info);
    reporters::print_reports(reports, fmt.into(), show_all, info)?;
    Ok(())
}
