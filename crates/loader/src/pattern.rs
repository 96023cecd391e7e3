//! Glob-style name and call-signature patterns used by predicates and the
//! vocabulary. `*` matches any run of characters and `|` separates
//! alternatives: `Statement.execute*|EntityManager.createQuery`.

use crate::Tri;
use regex::Regex;
use std::fmt;

/// Converts a name glob to an anchored regular expression.
///
/// # Example
/// ```
/// let re = loader::glob_to_regex("execute*").unwrap();
/// assert!(re.is_match("executeQuery"));
/// assert!(!re.is_match("prepareStatement"));
/// ```
pub fn glob_to_regex(pat: &str) -> Result<Regex, regex::Error> {
    let mut regex = String::from("^(?:");
    for c in pat.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '(' | ')' | '+' | '^' | '$' | '[' | ']' | '{' | '}' | '\\' | '|' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }
    regex.push_str(")$");
    Regex::new(&regex)
}

#[derive(Debug, Clone)]
/// Alternatives of simple-name globs.
pub struct NamePattern {
    source: String,
    alternatives: Vec<(String, Regex)>,
}

impl NamePattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let alternatives = source
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| glob_to_regex(s).map(|re| (s.to_string(), re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    /// Matches `name` exactly or, for qualified names, by its last segment
    /// when the alternative itself is unqualified.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_start_matches('@');
        let simple = name.rsplit('.').next().unwrap_or(name);
        self.alternatives.iter().any(|(alt, re)| {
            if alt.contains('.') {
                re.is_match(name)
            } else {
                re.is_match(simple)
            }
        })
    }

    /// True if any of the `|`-separated names in `names` matches.
    /// Union catch types are written `IOException|SQLException`.
    pub fn matches_any_of(&self, names: &str) -> bool {
        names.split('|').map(str::trim).any(|n| self.matches(n))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone)]
struct SignatureAlt {
    /// `None` when the alternative names no receiver type.
    receiver: Option<Regex>,
    method: Regex,
}

#[derive(Debug, Clone)]
/// `Type.method` call pattern. The type side is compared against the
/// receiver's resolved type and all of its known ancestors.
pub struct SignaturePattern {
    source: String,
    alternatives: Vec<SignatureAlt>,
}

impl SignaturePattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let mut alternatives = Vec::new();
        for alt in source.split('|').map(str::trim).filter(|s| !s.is_empty()) {
            let (receiver, method) = match alt.rsplit_once('.') {
                Some((ty, m)) if ty != "*" => (Some(glob_to_regex(ty)?), glob_to_regex(m)?),
                Some((_, m)) => (None, glob_to_regex(m)?),
                None => (None, glob_to_regex(alt)?),
            };
            alternatives.push(SignatureAlt { receiver, method });
        }
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    /// Three-valued match. `receiver_types` is `None` when the receiver's
    /// type could not be resolved; a type-qualified alternative whose method
    /// name matches then answers `Unknown`.
    pub fn match_call(&self, receiver_types: Option<&[String]>, method: &str) -> Tri {
        let mut result = Tri::False;
        for alt in &self.alternatives {
            if !alt.method.is_match(method) {
                continue;
            }
            match (&alt.receiver, receiver_types) {
                (None, _) => return Tri::True,
                (Some(re), Some(types)) => {
                    if types.iter().any(|t| re.is_match(t)) {
                        return Tri::True;
                    }
                }
                (Some(_), None) => result = Tri::Unknown,
            }
        }
        result
    }

    /// Two-valued match for classification: an unresolved receiver never
    /// matches a type-qualified alternative.
    pub fn matches(&self, receiver_types: Option<&[String]>, method: &str) -> bool {
        self.match_call(receiver_types, method) == Tri::True
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for SignaturePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
