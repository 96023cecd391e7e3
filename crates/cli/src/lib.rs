//! Common utilities for the command line interface.
use regex::Regex;
use std::fs;
use std::path::Path;

pub mod analyze;
pub mod args;
pub mod config;
pub mod output;
pub mod rules;
pub mod ui;

/// Exit status when no violation was found.
pub const EXIT_CLEAN: i32 = 0;
/// Exit status when at least one violation was found.
pub const EXIT_VIOLATIONS: i32 = 1;
/// Exit status for catalog/configuration errors or when no input could be
/// analyzed.
pub const EXIT_ERROR: i32 = 2;

/// Default maximum size of an input file: 5 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Converts a path glob to a regular expression. `*` stays within one path
/// segment, `**` crosses segments and `**/` also matches no segment at all.
/// Character classes are not supported.
///
/// # Example
///
/// ```
/// use dblint::glob_to_regex;
/// let re = glob_to_regex("src/*.java").unwrap();
/// assert!(re.is_match("src/Dao.java"));
/// assert!(!re.is_match("src/dao/Dao.java"));
/// assert!(glob_to_regex("**/dao/**").unwrap().is_match("dao/UserDao.java"));
/// ```
pub fn glob_to_regex(pat: &str) -> Result<Regex, regex::Error> {
    if pat.contains('[') || pat.contains(']') {
        return Regex::new("[");
    }
    let mut regex = String::from("^");
    let mut chars = pat.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push('.'),
            '.' => regex.push_str("\\."),
            '(' | ')' | '+' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }
    regex.push('$');
    Regex::new(&regex)
}

/// Transforms a glob-style exclusion string into [`Regex`].
/// Accepts trailing slashes and expands to `**` automatically.
///
/// # Example
///
/// ```
/// use dblint::parse_exclude;
/// let re = parse_exclude("target/").unwrap();
/// assert!(re.is_match("target/classes/Dao.java"));
/// ```
pub fn parse_exclude(s: &str) -> Result<Regex, String> {
    let glob_str = if s.ends_with('/') {
        format!("{s}**")
    } else {
        s.to_string()
    };
    glob_to_regex(&glob_str).map_err(|e| e.to_string())
}

/// Default exclusion patterns: VCS metadata and build output.
pub fn default_excludes() -> Vec<Regex> {
    ["**/.git/**", "**/target/**", "**/build/**", "**/node_modules/**"]
        .into_iter()
        .filter_map(|p| parse_exclude(p).ok())
        .collect()
}

/// Indicates whether a path should be omitted according to patterns or size.
/// Separators are normalised to support Windows and Unix.
///
/// # Example
///
/// ```
/// use dblint::{is_excluded, parse_exclude};
/// use std::path::Path;
/// let patterns = vec![parse_exclude("gen/**").unwrap()];
/// assert!(is_excluded(Path::new("gen/Dao.java"), &patterns, 0));
/// ```
pub fn is_excluded(path: &Path, patterns: &[Regex], max_file_size: u64) -> bool {
    let path_str = path.to_string_lossy().replace('\\', "/");
    if patterns.iter().any(|re| re.is_match(&path_str)) {
        return true;
    }
    if max_file_size > 0 {
        if let Ok(meta) = fs::metadata(path) {
            if meta.is_file() && meta.len() > max_file_size {
                return true;
            }
        }
    }
    false
}

/// Whether `path` passes the include filter. An empty filter admits all.
pub fn is_included(path: &Path, includes: &[Regex]) -> bool {
    if includes.is_empty() {
        return true;
    }
    let path_str = path.to_string_lossy().replace('\\', "/");
    includes.iter().any(|re| re.is_match(&path_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_excludes_cover_build_output() {
        let patterns = default_excludes();
        assert!(is_excluded(Path::new("app/target/gen/A.java"), &patterns, 0));
        assert!(is_excluded(Path::new("repo/.git/HEAD"), &patterns, 0));
        assert!(!is_excluded(Path::new("app/src/A.java"), &patterns, 0));
    }

    #[test]
    fn leading_double_star_matches_at_the_root() {
        let patterns = default_excludes();
        assert!(is_excluded(Path::new(".git/HEAD"), &patterns, 0));
        assert!(is_excluded(Path::new("target/classes/A.java"), &patterns, 0));
        assert!(!is_excluded(Path::new("targets/A.java"), &patterns, 0));

        let inc = vec![parse_exclude("**/dao/**").unwrap()];
        assert!(is_included(Path::new("dao/UserDao.java"), &inc));
        assert!(!is_included(Path::new("mydao/UserDao.java"), &inc));

        let nested = glob_to_regex("src/**/Dao.java").unwrap();
        assert!(nested.is_match("src/Dao.java"));
        assert!(nested.is_match("src/a/b/Dao.java"));
        assert!(!nested.is_match("srcDao.java"));
    }

    #[test]
    fn include_filter() {
        let inc = vec![parse_exclude("**/dao/**").unwrap()];
        assert!(is_included(Path::new("src/dao/UserDao.java"), &inc));
        assert!(!is_included(Path::new("src/web/Controller.java"), &inc));
        assert!(is_included(Path::new("anything"), &[]));
    }
}
