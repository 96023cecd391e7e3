//! Front-ends that turn source files into the fact streams consumed by the
//! engine.

use anyhow::{Context, Result};
use ir::SourceUnit;
use serde::Serialize;
use std::{fs, path::Path};
use tracing::debug;

#[derive(Debug, Default, Serialize)]
pub struct ParserMetrics {
    pub files_parsed: usize,
    pub parse_errors: usize,
}

pub mod languages;
pub use languages::*;

/// Determines the supported front-end from the name/extension.
///
/// # Example
/// ```
/// use parsers::detect_type;
/// use std::path::Path;
/// assert_eq!(detect_type(Path::new("src/Repo.java")), Some("java"));
/// assert_eq!(detect_type(Path::new("Repo.facts.json")), Some("facts"));
/// assert_eq!(detect_type(Path::new("pom.xml")), None);
/// ```
pub fn detect_type(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    let detected = if name.ends_with(".facts.json") {
        Some("facts")
    } else {
        match path.extension().map(|e| e.to_string_lossy().to_lowercase()).as_deref() {
            Some("java") => Some("java"),
            _ => None,
        }
    };
    if let Some(t) = detected {
        debug!(file = %path.display(), file_type = t, "File type detected");
    } else {
        debug!(file = %path.display(), "Unsupported file type");
    }
    detected
}

/// Reads a file and lowers it into a [`SourceUnit`].
///
/// Returns `Ok(None)` for files no front-end handles and `Err` when the file
/// cannot be read or does not parse.
///
/// # Example
/// ```
/// use parsers::parse_file;
/// use std::fs;
/// let path = std::env::temp_dir().join("Example.java");
/// fs::write(&path, "class Example { void run() {} }").unwrap();
/// let unit = parse_file(&path, None, None).unwrap().unwrap();
/// assert_eq!(unit.language, "java");
/// assert!(!unit.facts.is_empty());
/// ```
pub fn parse_file(
    path: &Path,
    suppress_comment: Option<&str>,
    mut metrics: Option<&mut ParserMetrics>,
) -> Result<Option<SourceUnit>> {
    debug!(file = %path.display(), "Detecting file type");
    let Some(ftype) = detect_type(path) else {
        return Ok(None);
    };
    debug!(file = %path.display(), file_type = ftype, "Parsing file");
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let display = path.to_string_lossy();
    let res = match ftype {
        "java" => parse_java(&content, &display, suppress_comment),
        "facts" => parse_facts(&content, &display),
        _ => return Ok(None),
    };
    match res {
        Ok(unit) => {
            if let Some(m) = metrics {
                m.files_parsed += 1;
            }
            debug!(file = %path.display(), facts = unit.facts.len(), "File lowered");
            Ok(Some(unit))
        }
        Err(e) => {
            if let Some(m) = metrics.as_deref_mut() {
                m.parse_errors += 1;
            }
            Err(e)
        }
    }
}
