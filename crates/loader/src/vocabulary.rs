//! Domain vocabulary shared by every rule of a catalog: which calls acquire
//! and release resources, which produce or clean untrusted strings, how
//! transactions are demarcated and how types relate to each other.

use crate::pattern::{NamePattern, SignaturePattern};
use anyhow::Context;
use ir::Operand;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

fn default_release() -> Vec<String> {
    vec!["close".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDoc {
    pub kind: String,
    pub acquire: Vec<String>,
    /// Method names that release a handle of this kind when called on it.
    #[serde(default = "default_release")]
    pub release: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallSpecDoc {
    Plain(String),
    Detailed {
        call: String,
        #[serde(default)]
        arg: usize,
        equals: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransactionsDoc {
    #[serde(default)]
    pub begin: Vec<CallSpecDoc>,
    #[serde(default)]
    pub commit: Vec<CallSpecDoc>,
    #[serde(default)]
    pub rollback: Vec<CallSpecDoc>,
    /// Annotation names marking declarative demarcation.
    #[serde(default)]
    pub declarative: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
/// Vocabulary section as written in a catalog document.
pub struct VocabularyDoc {
    #[serde(default)]
    pub resources: Vec<ResourceDoc>,
    /// Static helpers releasing the handle passed as first argument.
    #[serde(default)]
    pub closers: Vec<String>,
    /// Calls taking ownership of handles passed as arguments.
    #[serde(default)]
    pub transfers: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub sanitizers: Vec<String>,
    /// Result type of well-known calls.
    #[serde(default)]
    pub returns: BTreeMap<String, String>,
    /// Direct supertypes of each type.
    #[serde(default)]
    pub types: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub transactions: TransactionsDoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Effect of a call on resource handles.
pub enum HandleOp {
    Acquire,
    Release,
    Transfer,
}

impl FromStr for HandleOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acquire" => Ok(HandleOp::Acquire),
            "release" => Ok(HandleOp::Release),
            "transfer" => Ok(HandleOp::Transfer),
            other => Err(format!("unknown handle operation '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Effect of a call on transaction demarcation.
pub enum TxOp {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxOp::Begin => "begin",
            TxOp::Commit => "commit",
            TxOp::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

impl FromStr for TxOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(TxOp::Begin),
            "commit" => Ok(TxOp::Commit),
            "rollback" => Ok(TxOp::Rollback),
            other => Err(format!("unknown transaction operation '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceKind {
    pub kind: String,
    pub acquire: Vec<SignaturePattern>,
    pub release: Vec<String>,
}

#[derive(Debug, Clone)]
/// Call pattern optionally constrained by a literal argument,
/// e.g. `Connection.setAutoCommit(false)`.
pub struct CallSpec {
    pub pattern: SignaturePattern,
    pub arg_equals: Option<(usize, String)>,
}

impl CallSpec {
    fn compile(doc: &CallSpecDoc) -> anyhow::Result<Self> {
        Ok(match doc {
            CallSpecDoc::Plain(p) => CallSpec {
                pattern: SignaturePattern::new(p)
                    .with_context(|| format!("invalid call pattern '{p}'"))?,
                arg_equals: None,
            },
            CallSpecDoc::Detailed { call, arg, equals } => CallSpec {
                pattern: SignaturePattern::new(call)
                    .with_context(|| format!("invalid call pattern '{call}'"))?,
                arg_equals: Some((*arg, equals.clone())),
            },
        })
    }

    pub fn matches(&self, types: Option<&[String]>, method: &str, args: &[Operand]) -> bool {
        if !self.pattern.matches(types, method) {
            return false;
        }
        match &self.arg_equals {
            None => true,
            Some((idx, expected)) => match args.get(*idx) {
                Some(Operand::Literal { value }) | Some(Operand::Constant { value }) => {
                    value == expected
                }
                _ => false,
            },
        }
    }
}

fn compile_all(list: &[String]) -> anyhow::Result<Vec<SignaturePattern>> {
    list.iter()
        .map(|p| SignaturePattern::new(p).with_context(|| format!("invalid call pattern '{p}'")))
        .collect()
}

#[derive(Debug, Clone, Default)]
/// Compiled vocabulary, merged across every document of a catalog.
pub struct Vocabulary {
    pub resources: Vec<ResourceKind>,
    pub closers: Vec<SignaturePattern>,
    pub transfers: Vec<SignaturePattern>,
    pub sources: Vec<SignaturePattern>,
    pub sanitizers: Vec<SignaturePattern>,
    pub returns: Vec<(SignaturePattern, String)>,
    pub parents: BTreeMap<String, Vec<String>>,
    pub begin: Vec<CallSpec>,
    pub commit: Vec<CallSpec>,
    pub rollback: Vec<CallSpec>,
    pub declarative: Vec<NamePattern>,
}

impl Vocabulary {
    pub fn compile(doc: &VocabularyDoc) -> anyhow::Result<Self> {
        let mut resources = Vec::new();
        for r in &doc.resources {
            resources.push(ResourceKind {
                kind: r.kind.clone(),
                acquire: compile_all(&r.acquire)
                    .with_context(|| format!("resource kind '{}'", r.kind))?,
                release: r.release.clone(),
            });
        }
        let mut returns = Vec::new();
        for (sig, ty) in &doc.returns {
            let p = SignaturePattern::new(sig)
                .with_context(|| format!("invalid call pattern '{sig}'"))?;
            returns.push((p, ty.clone()));
        }
        let tx = &doc.transactions;
        Ok(Self {
            resources,
            closers: compile_all(&doc.closers)?,
            transfers: compile_all(&doc.transfers)?,
            sources: compile_all(&doc.sources)?,
            sanitizers: compile_all(&doc.sanitizers)?,
            returns,
            parents: doc.types.clone(),
            begin: tx.begin.iter().map(CallSpec::compile).collect::<Result<_, _>>()?,
            commit: tx.commit.iter().map(CallSpec::compile).collect::<Result<_, _>>()?,
            rollback: tx
                .rollback
                .iter()
                .map(CallSpec::compile)
                .collect::<Result<_, _>>()?,
            declarative: tx
                .declarative
                .iter()
                .map(|n| {
                    NamePattern::new(n).with_context(|| format!("invalid annotation name '{n}'"))
                })
                .collect::<Result<_, _>>()?,
        })
    }

    /// Appends the entries of `other`; parents of the same type are unioned.
    pub fn extend(&mut self, other: Vocabulary) {
        self.resources.extend(other.resources);
        self.closers.extend(other.closers);
        self.transfers.extend(other.transfers);
        self.sources.extend(other.sources);
        self.sanitizers.extend(other.sanitizers);
        self.returns.extend(other.returns);
        for (ty, parents) in other.parents {
            let entry = self.parents.entry(ty).or_default();
            for p in parents {
                if !entry.contains(&p) {
                    entry.push(p);
                }
            }
        }
        self.begin.extend(other.begin);
        self.commit.extend(other.commit);
        self.rollback.extend(other.rollback);
        self.declarative.extend(other.declarative);
    }

    /// `ty` followed by all its known supertypes, nearest first.
    pub fn ancestors(&self, ty: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([ty.to_string()]);
        while let Some(t) = queue.pop_front() {
            if !seen.insert(t.clone()) {
                continue;
            }
            if let Some(ps) = self.parents.get(&t) {
                queue.extend(ps.iter().cloned());
            }
            out.push(t);
        }
        out
    }

    /// Nearest type both `a` and `b` are, if the hierarchy knows one.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        if a == b {
            return Some(a.to_string());
        }
        let theirs = self.ancestors(b);
        self.ancestors(a).into_iter().find(|t| theirs.contains(t))
    }

    pub fn acquisition(&self, types: Option<&[String]>, method: &str) -> Option<&ResourceKind> {
        self.resources
            .iter()
            .find(|r| r.acquire.iter().any(|p| p.matches(types, method)))
    }

    pub fn resource_kind(&self, kind: &str) -> Option<&ResourceKind> {
        self.resources.iter().find(|r| r.kind == kind)
    }

    pub fn return_type(&self, types: Option<&[String]>, method: &str) -> Option<&str> {
        self.returns
            .iter()
            .find(|(p, _)| p.matches(types, method))
            .map(|(_, t)| t.as_str())
    }

    pub fn is_closer(&self, types: Option<&[String]>, method: &str) -> bool {
        self.closers.iter().any(|p| p.matches(types, method))
    }

    pub fn is_transfer(&self, types: Option<&[String]>, method: &str) -> bool {
        self.transfers.iter().any(|p| p.matches(types, method))
    }

    pub fn is_source(&self, types: Option<&[String]>, method: &str) -> bool {
        self.sources.iter().any(|p| p.matches(types, method))
    }

    pub fn is_sanitizer(&self, types: Option<&[String]>, method: &str) -> bool {
        self.sanitizers.iter().any(|p| p.matches(types, method))
    }

    pub fn tx_op(&self, types: Option<&[String]>, method: &str, args: &[Operand]) -> Option<TxOp> {
        if self.begin.iter().any(|c| c.matches(types, method, args)) {
            Some(TxOp::Begin)
        } else if self.commit.iter().any(|c| c.matches(types, method, args)) {
            Some(TxOp::Commit)
        } else if self.rollback.iter().any(|c| c.matches(types, method, args)) {
            Some(TxOp::Rollback)
        } else {
            None
        }
    }

    pub fn is_declarative(&self, annotation: &str) -> bool {
        self.declarative.iter().any(|p| p.matches(annotation))
    }
}
