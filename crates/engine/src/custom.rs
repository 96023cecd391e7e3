//! Predicates implemented in Rust and referenced by name from the catalog
//! (`custom: sql-text`).

use crate::eval::{EvalContext, Subject};
use loader::Tri;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// A named predicate the catalog cannot express with the built-in
/// combinators. Errors and panics are contained per rule by the engine.
pub trait CustomPredicate: Send + Sync {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<Tri>;
}

impl<F> CustomPredicate for F
where
    F: Fn(&EvalContext<'_>) -> anyhow::Result<Tri> + Send + Sync,
{
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<Tri> {
        self(ctx)
    }
}

#[derive(Clone, Default)]
pub struct CustomRegistry {
    predicates: BTreeMap<String, Arc<dyn CustomPredicate>>,
}

impl CustomRegistry {
    /// Registry holding the predicates every engine knows.
    pub fn builtin() -> Self {
        let mut r = Self::default();
        r.register("sql-text", SqlText);
        r.register("jdbc-url-password", JdbcUrlPassword);
        r
    }

    pub fn register(&mut self, name: impl Into<String>, p: impl CustomPredicate + 'static) {
        self.predicates.insert(name.into(), Arc::new(p));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomPredicate>> {
        self.predicates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for CustomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.predicates.keys()).finish()
    }
}

fn sql_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(select|insert|delete|merge)\b|\b(select\s.+\sfrom|insert\s+into|update\s+\w+\s+set|delete\s+from|where\s+\w+\s*(=|like|in)\s*)",
        )
        .expect("valid sql regex")
    })
}

fn url_password_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^jdbc:.*[?&;:]password=[^&;]+")
            .expect("valid jdbc url regex")
    })
}

/// Constant string values visible in the current fact: literal parts of a
/// string build, literal call arguments, or an assigned constant.
fn constants<'c>(ctx: &'c EvalContext<'_>) -> Vec<&'c str> {
    let Subject::Fact { fx, .. } = &ctx.subject else {
        return Vec::new();
    };
    fx.parts
        .iter()
        .chain(fx.args.iter())
        .chain(fx.value.iter())
        .filter_map(|v| v.constant.as_deref())
        .collect()
}

/// True when any constant piece of text in the fact looks like SQL.
struct SqlText;

impl CustomPredicate for SqlText {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<Tri> {
        let re = sql_regex();
        Ok(constants(ctx).iter().any(|c| re.is_match(c)).into())
    }
}

/// True for JDBC URLs carrying an inline password.
struct JdbcUrlPassword;

impl CustomPredicate for JdbcUrlPassword {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<Tri> {
        let re = url_password_regex();
        Ok(constants(ctx).iter().any(|c| re.is_match(c)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_text_recognises_queries() {
        let re = sql_regex();
        assert!(re.is_match("SELECT * FROM users WHERE id = "));
        assert!(re.is_match("  insert into audit values (?)"));
        assert!(re.is_match("... WHERE name = "));
        assert!(!re.is_match("Hello, "));
        assert!(!re.is_match("selected items"));
    }

    #[test]
    fn url_password_requires_jdbc_scheme() {
        let re = url_password_regex();
        assert!(re.is_match("jdbc:mysql://db/app?user=app&password=s3cret"));
        assert!(!re.is_match("jdbc:mysql://db/app?user=app"));
        assert!(!re.is_match("https://host/?password=x"));
    }

    #[test]
    fn builtin_registry_names() {
        let r = CustomRegistry::builtin();
        let names: Vec<&str> = r.names().collect();
        assert_eq!(names, vec!["jdbc-url-password", "sql-text"]);
        assert!(!r.contains("missing"));
    }
}
