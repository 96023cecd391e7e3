//! Composable rule predicates.
//!
//! Predicates are plain data: the loader compiles them from catalog YAML and
//! the engine interprets them against the current fact and tracker state.
//! The builder functions at the bottom construct the same values in code.

use crate::pattern::{NamePattern, SignaturePattern};
use crate::vocabulary::{HandleOp, TxOp};
use anyhow::{anyhow, bail, Context};
use ir::{DeclOrigin, HandleState, TargetKind};
use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which call argument a predicate inspects.
pub enum ArgSelector {
    Index(usize),
    Any,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Flags of the per-method transaction summary.
pub enum TxFlag {
    /// Any manual begin, commit or rollback.
    Manual,
    Declarative,
    UnmatchedBegin,
    UnmatchedEnd,
    ManualInDeclarative,
    /// Manual or declarative demarcation of any kind.
    Activity,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Always(bool),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    CallTo(SignaturePattern),
    ReceiverType(NamePattern),
    ArgCount(usize),
    ArgTainted(ArgSelector),
    ArgLiteral(ArgSelector),
    ArgMatches { arg: ArgSelector, pattern: Regex },
    PartTainted,
    PartMatches(Regex),
    Annotation(NamePattern),
    AnnotationArg { name: String, pattern: Regex },
    TargetKind(TargetKind),
    TargetHasModifier(Vec<String>),
    DeclaredType(NamePattern),
    DeclOrigin(DeclOrigin),
    SymbolName(Regex),
    ValueLiteral,
    ValueTainted,
    HandleState(HandleState),
    HandleKind(NamePattern),
    HandleOp(HandleOp),
    OpenDependents,
    TxOp(TxOp),
    InDeclarativeTx,
    InManualTx,
    TxDepthAtLeast(usize),
    TxSummary(TxFlag),
    ScopeKind(String),
    Imports(NamePattern),
    Policy(String),
    Custom(String),
}

impl Predicate {
    /// Visits this predicate and all nested ones.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Predicate)) {
        f(self);
        match self {
            Predicate::All(ps) | Predicate::Any(ps) => {
                for p in ps {
                    p.walk(f);
                }
            }
            Predicate::Not(p) => p.walk(f),
            _ => {}
        }
    }

    /// Names of custom predicates referenced anywhere inside.
    pub fn custom_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |p| {
            if let Predicate::Custom(name) = p {
                out.insert(name.clone());
            }
        });
        out
    }

    pub fn policy_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |p| {
            if let Predicate::Policy(name) = p {
                out.insert(name.clone());
            }
        });
        out
    }
}

const SCOPE_KINDS: &[&str] = &[
    "unit",
    "class",
    "method",
    "block",
    "branch",
    "arm",
    "loop",
    "lambda",
    "try",
    "catch",
    "finally",
    "resource_guard",
];

/// Compiles predicate YAML, resolving `ref:` entries against `library`.
pub(crate) struct PredicateCompiler<'a> {
    library: &'a BTreeMap<String, YamlValue>,
    resolving: Vec<String>,
}

impl<'a> PredicateCompiler<'a> {
    pub(crate) fn new(library: &'a BTreeMap<String, YamlValue>) -> Self {
        Self {
            library,
            resolving: Vec::new(),
        }
    }

    pub(crate) fn compile(&mut self, v: &YamlValue) -> anyhow::Result<Predicate> {
        match v {
            YamlValue::Bool(b) => Ok(Predicate::Always(*b)),
            YamlValue::String(name) => self.unit(name),
            YamlValue::Sequence(items) => Ok(Predicate::All(self.compile_list(items)?)),
            YamlValue::Mapping(map) => {
                if map.len() != 1 {
                    bail!("predicate must have exactly one key, found {}", map.len());
                }
                let (k, arg) = map.iter().next().ok_or_else(|| anyhow!("empty predicate"))?;
                let key = k
                    .as_str()
                    .ok_or_else(|| anyhow!("predicate key must be a string"))?;
                self.keyed(key, arg)
                    .with_context(|| format!("in predicate '{key}'"))
            }
            other => bail!("malformed predicate: {:?}", other),
        }
    }

    fn compile_list(&mut self, items: &[YamlValue]) -> anyhow::Result<Vec<Predicate>> {
        items.iter().map(|i| self.compile(i)).collect()
    }

    fn unit(&mut self, name: &str) -> anyhow::Result<Predicate> {
        Ok(match name {
            "always" => Predicate::Always(true),
            "never" => Predicate::Always(false),
            "part_tainted" => Predicate::PartTainted,
            "value_literal" => Predicate::ValueLiteral,
            "value_tainted" => Predicate::ValueTainted,
            "open_dependents" => Predicate::OpenDependents,
            "in_declarative_tx" => Predicate::InDeclarativeTx,
            "in_manual_tx" => Predicate::InManualTx,
            other => bail!("unknown predicate '{other}'"),
        })
    }

    fn keyed(&mut self, key: &str, arg: &YamlValue) -> anyhow::Result<Predicate> {
        Ok(match key {
            "all" => Predicate::All(self.compile_list(seq(arg)?)?),
            "any" => Predicate::Any(self.compile_list(seq(arg)?)?),
            "not" => Predicate::Not(Box::new(self.compile(arg)?)),
            "ref" => return self.resolve(string(arg)?),
            "always" => Predicate::Always(
                arg.as_bool()
                    .ok_or_else(|| anyhow!("expected a boolean"))?,
            ),
            "call_to" => Predicate::CallTo(SignaturePattern::new(string(arg)?)?),
            "receiver_type" => Predicate::ReceiverType(NamePattern::new(string(arg)?)?),
            "arg_count" => Predicate::ArgCount(number(arg)?),
            "arg_tainted" => Predicate::ArgTainted(selector(arg)?),
            "arg_literal" => Predicate::ArgLiteral(selector(arg)?),
            "arg_matches" => {
                let arg_sel = arg
                    .get("arg")
                    .map(selector)
                    .transpose()?
                    .unwrap_or(ArgSelector::Any);
                let pattern = regex_field(arg, "pattern")?;
                Predicate::ArgMatches {
                    arg: arg_sel,
                    pattern,
                }
            }
            "part_tainted" => flag(arg, Predicate::PartTainted)?,
            "part_matches" => Predicate::PartMatches(regex(string(arg)?)?),
            "annotation" => Predicate::Annotation(NamePattern::new(string(arg)?)?),
            "annotation_arg" => Predicate::AnnotationArg {
                name: string(
                    arg.get("name")
                        .ok_or_else(|| anyhow!("missing 'name'"))?,
                )?
                .to_string(),
                pattern: regex_field(arg, "pattern")?,
            },
            "target_kind" => Predicate::TargetKind(enum_value(arg)?),
            "target_has_modifier" => Predicate::TargetHasModifier(strings(arg)?),
            "declared_type" => Predicate::DeclaredType(NamePattern::new(string(arg)?)?),
            "decl_origin" => Predicate::DeclOrigin(enum_value(arg)?),
            "symbol_name" => Predicate::SymbolName(regex(string(arg)?)?),
            "value_literal" => flag(arg, Predicate::ValueLiteral)?,
            "value_tainted" => flag(arg, Predicate::ValueTainted)?,
            "handle_state" => Predicate::HandleState(
                string(arg)?
                    .parse()
                    .map_err(|e: String| anyhow!(e))?,
            ),
            "handle_kind" => Predicate::HandleKind(NamePattern::new(string(arg)?)?),
            "handle_op" => Predicate::HandleOp(string(arg)?.parse().map_err(|e: String| anyhow!(e))?),
            "open_dependents" => flag(arg, Predicate::OpenDependents)?,
            "tx_op" => Predicate::TxOp(string(arg)?.parse().map_err(|e: String| anyhow!(e))?),
            "in_declarative_tx" => flag(arg, Predicate::InDeclarativeTx)?,
            "in_manual_tx" => flag(arg, Predicate::InManualTx)?,
            "tx_depth_at_least" => Predicate::TxDepthAtLeast(number(arg)?),
            "tx_summary" => Predicate::TxSummary(match string(arg)? {
                "manual" => TxFlag::Manual,
                "declarative" => TxFlag::Declarative,
                "unmatched_begin" => TxFlag::UnmatchedBegin,
                "unmatched_end" => TxFlag::UnmatchedEnd,
                "manual_in_declarative" => TxFlag::ManualInDeclarative,
                "activity" => TxFlag::Activity,
                other => bail!("unknown transaction summary flag '{other}'"),
            }),
            "scope_kind" => {
                let s = string(arg)?;
                if !SCOPE_KINDS.contains(&s) {
                    bail!("unknown scope kind '{s}'");
                }
                Predicate::ScopeKind(s.to_string())
            }
            "imports" => Predicate::Imports(NamePattern::new(string(arg)?)?),
            "policy" => Predicate::Policy(string(arg)?.to_string()),
            "custom" => Predicate::Custom(string(arg)?.to_string()),
            other => bail!("unknown predicate '{other}'"),
        })
    }

    fn resolve(&mut self, name: &str) -> anyhow::Result<Predicate> {
        if self.resolving.iter().any(|n| n == name) {
            bail!("cyclic predicate reference '{name}'");
        }
        let body = self
            .library
            .get(name)
            .ok_or_else(|| anyhow!("unresolved predicate reference '{name}'"))?;
        self.resolving.push(name.to_string());
        let compiled = self
            .compile(body)
            .with_context(|| format!("in named predicate '{name}'"));
        self.resolving.pop();
        compiled
    }
}

fn seq(v: &YamlValue) -> anyhow::Result<&Vec<YamlValue>> {
    v.as_sequence().ok_or_else(|| anyhow!("expected a list"))
}

fn string(v: &YamlValue) -> anyhow::Result<&str> {
    v.as_str().ok_or_else(|| anyhow!("expected a string"))
}

fn strings(v: &YamlValue) -> anyhow::Result<Vec<String>> {
    match v {
        YamlValue::String(s) => Ok(vec![s.clone()]),
        YamlValue::Sequence(items) => items
            .iter()
            .map(|i| string(i).map(str::to_string))
            .collect(),
        _ => bail!("expected a string or a list of strings"),
    }
}

fn number(v: &YamlValue) -> anyhow::Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| anyhow!("expected a non-negative integer"))
}

fn selector(v: &YamlValue) -> anyhow::Result<ArgSelector> {
    if let Some(n) = v.as_u64() {
        return Ok(ArgSelector::Index(n as usize));
    }
    match v.as_str() {
        Some("any") => Ok(ArgSelector::Any),
        Some("last") => Ok(ArgSelector::Last),
        _ => bail!("argument selector must be an index, 'any' or 'last'"),
    }
}

fn regex(s: &str) -> anyhow::Result<Regex> {
    Regex::new(s).with_context(|| format!("invalid regex '{s}'"))
}

fn regex_field(v: &YamlValue, field: &str) -> anyhow::Result<Regex> {
    let s = v
        .get(field)
        .ok_or_else(|| anyhow!("missing '{field}'"))?;
    regex(string(s)?)
}

fn flag(v: &YamlValue, p: Predicate) -> anyhow::Result<Predicate> {
    match v.as_bool() {
        Some(true) => Ok(p),
        Some(false) => Ok(Predicate::Not(Box::new(p))),
        None => bail!("expected a boolean"),
    }
}

fn enum_value<T: serde::de::DeserializeOwned>(v: &YamlValue) -> anyhow::Result<T> {
    serde_yaml::from_value(v.clone()).map_err(|e| anyhow!("{e}"))
}

/// Matches calls whose signature matches `pattern` (`Type.method`, globs, `|`).
///
/// # Example
/// ```
/// use loader::predicate::{on_call_to, where_arg_tainted};
/// let p = on_call_to("Statement.executeQuery").unwrap().and(where_arg_tainted(0));
/// assert!(matches!(p, loader::Predicate::All(_)));
/// ```
pub fn on_call_to(pattern: &str) -> Result<Predicate, regex::Error> {
    Ok(Predicate::CallTo(SignaturePattern::new(pattern)?))
}

pub fn on_annotation(pattern: &str) -> Result<Predicate, regex::Error> {
    Ok(Predicate::Annotation(NamePattern::new(pattern)?))
}

pub fn where_arg_tainted(index: usize) -> Predicate {
    Predicate::ArgTainted(ArgSelector::Index(index))
}

pub fn where_receiver_type(pattern: &str) -> Result<Predicate, regex::Error> {
    Ok(Predicate::ReceiverType(NamePattern::new(pattern)?))
}

pub fn where_handle_state(state: HandleState) -> Predicate {
    Predicate::HandleState(state)
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::All(mut ps) => {
                ps.push(other);
                Predicate::All(ps)
            }
            p => Predicate::All(vec![p, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Any(mut ps) => {
                ps.push(other);
                Predicate::Any(ps)
            }
            p => Predicate::Any(vec![p, other]),
        }
    }

    pub fn negate(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}
