//! Pre-extracted fact streams (`*.facts.json`).
//!
//! Any external front-end can hand the engine a serialized [`SourceUnit`].
//! The stream is re-indexed and its scope structure checked before use.

use anyhow::{bail, Context, Result};
use ir::{FactKind, ScopeId, SourceUnit};

/// Deserializes a fact stream. A unit without a path takes `path`.
pub fn parse_facts(content: &str, path: &str) -> Result<SourceUnit> {
    let mut unit: SourceUnit = serde_json::from_str(content)
        .with_context(|| format!("invalid fact stream: {path}"))?;
    if unit.path.is_empty() {
        unit.path = path.to_string();
    }
    unit.reindex();
    check_scopes(&unit).with_context(|| format!("malformed fact stream: {path}"))?;
    Ok(unit)
}

/// Every `scope_exit` must close the innermost open scope; scopes left open
/// at the end of the stream are an error too.
fn check_scopes(unit: &SourceUnit) -> Result<()> {
    let mut open: Vec<ScopeId> = Vec::new();
    for fact in &unit.facts {
        match &fact.kind {
            FactKind::ScopeEnter { id, .. } => open.push(*id),
            FactKind::ScopeExit { id, .. } => match open.pop() {
                Some(top) if top == *id => {}
                Some(top) => bail!(
                    "fact {} closes scope {} while scope {} is open",
                    fact.index,
                    id,
                    top
                ),
                None => bail!("fact {} closes scope {} which is not open", fact.index, id),
            },
            _ => {}
        }
    }
    if let Some(id) = open.last() {
        bail!("scope {id} is never closed");
    }
    Ok(())
}
