//! Loads rule catalogs from YAML documents and compiles them to the
//! representation evaluated by the matching engine.
//!
//! A catalog document may carry four sections: `vocabulary` (domain calls
//! and types), `policies` (named house-style switches), `predicates` (a
//! library of named predicates rules refer to with `ref:`) and `rules`.
//! Loading fails as a whole on duplicate rule ids or malformed predicates.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub mod pattern;
pub mod predicate;
mod tri;
pub mod vocabulary;
mod walk;

pub use pattern::{glob_to_regex, NamePattern, SignaturePattern};
pub use predicate::{ArgSelector, Predicate, TxFlag};
pub use tri::Tri;
pub use vocabulary::{HandleOp, TxOp, Vocabulary, VocabularyDoc};
pub use walk::visit;

use predicate::PredicateCompiler;

/// Catalog bundled with the binary.
pub const BUILTIN_CATALOG: &str = include_str!("../catalog/default.yaml");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
/// Severity associated with a rule or finding.
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
/// Concern a rule belongs to. Enable/disable and severity policy are
/// applied per category.
pub enum Category {
    Leak,
    Injection,
    Transaction,
    Mapping,
    FrameworkUsage,
    Connection,
    ExceptionHandling,
    Credentials,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Leak,
        Category::Injection,
        Category::Transaction,
        Category::Mapping,
        Category::FrameworkUsage,
        Category::Connection,
        Category::ExceptionHandling,
        Category::Credentials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Leak => "leak",
            Category::Injection => "injection",
            Category::Transaction => "transaction",
            Category::Mapping => "mapping",
            Category::FrameworkUsage => "framework-usage",
            Category::Connection => "connection",
            Category::ExceptionHandling => "exception-handling",
            Category::Credentials => "credentials",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.to_lowercase().replace('_', "-");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == norm)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Event that makes the engine evaluate a rule.
pub enum Trigger {
    Import,
    Declare,
    Assign,
    Call,
    Annotation,
    StringBuild,
    Return,
    Throw,
    FieldStore,
    ScopeEnter,
    ScopeExit,
    /// End of a resource handle's life: its declaring scope exited.
    HandleEnd,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Import => "import",
            Trigger::Declare => "declare",
            Trigger::Assign => "assign",
            Trigger::Call => "call",
            Trigger::Annotation => "annotation",
            Trigger::StringBuild => "string_build",
            Trigger::Return => "return",
            Trigger::Throw => "throw",
            Trigger::FieldStore => "field_store",
            Trigger::ScopeEnter => "scope_enter",
            Trigger::ScopeExit => "scope_exit",
            Trigger::HandleEnd => "handle_end",
        }
    }

    /// Trigger fired by a fact of the given kind. `HandleEnd` has no fact.
    pub fn for_fact(kind: &ir::FactKind) -> Trigger {
        use ir::FactKind as K;
        match kind {
            K::Import { .. } => Trigger::Import,
            K::Declare { .. } => Trigger::Declare,
            K::Assign { .. } => Trigger::Assign,
            K::Call { .. } => Trigger::Call,
            K::AnnotationAttach { .. } => Trigger::Annotation,
            K::StringBuild { .. } => Trigger::StringBuild,
            K::Return { .. } => Trigger::Return,
            K::Throw { .. } => Trigger::Throw,
            K::FieldStore { .. } => Trigger::FieldStore,
            K::ScopeEnter { .. } => Trigger::ScopeEnter,
            K::ScopeExit { .. } => Trigger::ScopeExit,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_value(YamlValue::String(s.to_string()))
            .map_err(|_| format!("unknown trigger '{s}'"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
/// Paired exemplar sources for a rule: `bad` must yield a violation,
/// `good` must not yield a violation.
pub struct Example {
    pub bad: Option<String>,
    pub good: Option<String>,
    /// Policy switches the pair is evaluated under.
    #[serde(default)]
    pub policies: BTreeMap<String, bool>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Rule as written in a catalog document.
pub struct RuleDoc {
    pub id: String,
    pub category: String,
    pub severity: Option<String>,
    pub trigger: String,
    pub applies: Option<YamlValue>,
    pub violation: YamlValue,
    pub message: String,
    /// Message for locations the rule checked and found in order.
    #[serde(default)]
    pub compliant_message: Option<String>,
    pub remediation: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub examples: Vec<Example>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
/// One catalog document.
pub struct CatalogDoc {
    pub version: Option<String>,
    #[serde(default)]
    pub vocabulary: VocabularyDoc,
    #[serde(default)]
    pub policies: BTreeMap<String, bool>,
    #[serde(default)]
    pub predicates: BTreeMap<String, YamlValue>,
    #[serde(default)]
    pub rules: Vec<RuleDoc>,
}

#[derive(Debug, Clone)]
/// Representation ready for rule evaluation.
pub struct Rule {
    pub id: String,
    pub category: Category,
    pub severity: Severity,
    pub trigger: Trigger,
    /// `False` means the rule has no opinion here.
    pub applies: Predicate,
    pub violation: Predicate,
    pub message: String,
    pub compliant_message: Option<String>,
    pub remediation: Option<String>,
    /// Active unless a selection enables it explicitly.
    pub enabled: bool,
    pub examples: Vec<Example>,
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, Default)]
/// Collection of compiled rules plus the vocabulary they share.
/// Read-only once loaded.
pub struct Catalog {
    pub version: Option<String>,
    pub rules: Vec<Rule>,
    pub vocabulary: Vocabulary,
    /// Default value of every policy switch.
    pub policies: BTreeMap<String, bool>,
}

impl Catalog {
    /// Compiles the catalog bundled with the binary.
    pub fn builtin() -> anyhow::Result<Catalog> {
        Catalog::from_yaml_str(BUILTIN_CATALOG, "builtin:default.yaml")
    }

    /// Compiles a single YAML document.
    ///
    /// # Example
    /// ```
    /// use loader::Catalog;
    /// let cat = Catalog::from_yaml_str(r#"
    /// rules:
    ///   - id: demo
    ///     category: injection
    ///     trigger: call
    ///     violation: { call_to: "Statement.execute" }
    ///     message: demo
    /// "#, "inline").unwrap();
    /// assert_eq!(cat.rules.len(), 1);
    /// ```
    pub fn from_yaml_str(src: &str, origin: &str) -> anyhow::Result<Catalog> {
        let doc: CatalogDoc = serde_yaml::from_str(src)
            .with_context(|| format!("Failed to parse catalog: {origin}"))?;
        compile_catalog(vec![(origin.to_string(), doc)])
    }

    /// Appends the rules of `other`, rejecting ids already present.
    pub fn merge(&mut self, other: Catalog) -> anyhow::Result<()> {
        let mut seen: HashSet<String> = self.rules.iter().map(|r| r.id.clone()).collect();
        for r in &other.rules {
            if !seen.insert(r.id.clone()) {
                anyhow::bail!("duplicate rule id: {}", r.id);
            }
        }
        self.rules.extend(other.rules);
        self.vocabulary.extend(other.vocabulary);
        for (k, v) in other.policies {
            self.policies.entry(k).or_insert(v);
        }
        if self.version.is_none() {
            self.version = other.version;
        }
        Ok(())
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Custom predicate names referenced by any rule.
    pub fn custom_predicates(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for r in &self.rules {
            out.extend(r.applies.custom_names());
            out.extend(r.violation.custom_names());
        }
        out
    }

    /// Filtered copy with selection applied: inactive rules removed and
    /// category severity overrides folded into each rule.
    pub fn select(&self, sel: &RuleSelection) -> Catalog {
        let rules = self
            .rules
            .iter()
            .filter(|r| sel.is_active(r))
            .map(|r| {
                let mut r = r.clone();
                if let Some(sev) = sel.severity.get(&r.category) {
                    r.severity = *sev;
                }
                r
            })
            .collect::<Vec<_>>();
        debug!(
            total = self.rules.len(),
            active = rules.len(),
            "Rule selection applied"
        );
        Catalog {
            version: self.version.clone(),
            rules,
            vocabulary: self.vocabulary.clone(),
            policies: self.policies.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Read-only filter over a catalog, built from configuration and flags.
pub struct RuleSelection {
    /// `--rules` filter: when non-empty only matching rules run.
    pub only: Vec<String>,
    /// Turns on rules that are disabled by default.
    pub enable: Vec<String>,
    pub disable: Vec<String>,
    pub severity: BTreeMap<Category, Severity>,
}

impl RuleSelection {
    /// Whether `rule` takes part in the run. Selectors are rule-id globs or
    /// category names.
    pub fn is_active(&self, rule: &Rule) -> bool {
        let hit = |list: &[String]| list.iter().any(|p| selector_matches(p, rule));
        (rule.enabled || hit(&self.enable))
            && !hit(&self.disable)
            && (self.only.is_empty() || hit(&self.only))
    }
}

fn selector_matches(pat: &str, rule: &Rule) -> bool {
    let pat = pat.trim();
    if pat.parse::<Category>().ok() == Some(rule.category) {
        return true;
    }
    glob_to_regex(pat)
        .map(|re| re.is_match(&rule.id))
        .unwrap_or(false)
}

/// Recursively reads a directory and compiles every catalog document found.
///
/// # Example
/// ```no_run
/// use loader::load_catalog;
/// let catalog = load_catalog(std::path::Path::new("catalog")).unwrap();
/// assert!(!catalog.rules.is_empty());
/// ```
pub fn load_catalog(dir: &Path) -> anyhow::Result<Catalog> {
    let mut docs: Vec<(PathBuf, CatalogDoc)> = Vec::new();
    let excl = |p: &Path| {
        // Exclude the .git folder
        p.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name == ".git")
            .unwrap_or(false)
    };
    visit(dir, &excl, &mut |path| {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            debug!(file = %path.display(), "Parsing catalog document");
            let data = fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
            let doc: CatalogDoc = serde_yaml::from_str(&data)
                .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;
            docs.push((path.to_path_buf(), doc));
        } else {
            debug!(file = %path.display(), "Skipping non-catalog file");
        }
        Ok(())
    })?;
    let sources = docs
        .into_iter()
        .map(|(path, doc)| {
            let origin = path
                .strip_prefix(dir)
                .ok()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            (origin, doc)
        })
        .collect();
    compile_catalog(sources)
}

fn compile_catalog(sources: Vec<(String, CatalogDoc)>) -> anyhow::Result<Catalog> {
    let mut catalog = Catalog::default();
    let mut library: BTreeMap<String, YamlValue> = BTreeMap::new();
    for (origin, doc) in &sources {
        for (name, body) in &doc.predicates {
            if library.insert(name.clone(), body.clone()).is_some() {
                anyhow::bail!("duplicate named predicate '{name}' in {origin}");
            }
        }
        for (k, v) in &doc.policies {
            catalog.policies.insert(k.clone(), *v);
        }
        let vocab = Vocabulary::compile(&doc.vocabulary)
            .with_context(|| format!("Failed to compile vocabulary: {origin}"))?;
        catalog.vocabulary.extend(vocab);
        if catalog.version.is_none() {
            catalog.version = doc.version.clone();
        }
    }

    let mut seen_ids: HashSet<String> = HashSet::new();
    for (origin, doc) in sources {
        for rd in doc.rules {
            let id = rd.id.clone();
            let rule = compile_rule(rd, &library, &catalog.policies, &origin, &mut seen_ids)
                .with_context(|| format!("Failed to compile rule '{id}' in {origin}"))?;
            catalog.rules.push(rule);
        }
    }
    debug!(rules = catalog.rules.len(), "Catalog compiled");
    Ok(catalog)
}

fn compile_rule(
    rd: RuleDoc,
    library: &BTreeMap<String, YamlValue>,
    policies: &BTreeMap<String, bool>,
    origin: &str,
    seen: &mut HashSet<String>,
) -> anyhow::Result<Rule> {
    if !seen.insert(rd.id.clone()) {
        anyhow::bail!("duplicate rule id: {}", rd.id);
    }
    let severity = rd
        .severity
        .as_deref()
        .unwrap_or("MEDIUM")
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let category = rd.category.parse().map_err(|e: String| anyhow!(e))?;
    let trigger = rd.trigger.parse().map_err(|e: String| anyhow!(e))?;
    let mut compiler = PredicateCompiler::new(library);
    let applies = match &rd.applies {
        Some(v) => compiler.compile(v).context("invalid 'applies' predicate")?,
        None => Predicate::Always(true),
    };
    let violation = compiler
        .compile(&rd.violation)
        .context("invalid 'violation' predicate")?;
    for name in applies
        .policy_names()
        .into_iter()
        .chain(violation.policy_names())
    {
        if !policies.contains_key(&name) {
            anyhow::bail!("unknown policy '{name}'");
        }
    }
    Ok(Rule {
        id: rd.id,
        category,
        severity,
        trigger,
        applies,
        violation,
        message: rd.message,
        compliant_message: rd.compliant_message,
        remediation: rd.remediation,
        enabled: rd.enabled,
        examples: rd.examples,
        source_file: Some(origin.to_string()),
    })
}
