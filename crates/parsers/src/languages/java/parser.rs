use anyhow::{bail, Context, Result};
use ir::SourceUnit;
use tree_sitter::Node;

use super::lower::Lowerer;

/// Lowers one Java compilation unit.
///
/// A tree with syntax errors is rejected: partial facts would make the
/// lifecycle and transaction trackers report paths that do not exist.
/// Lines containing `suppress_comment` are recorded in
/// [`SourceUnit::suppressed`].
pub fn parse_java(content: &str, path: &str, suppress_comment: Option<&str>) -> Result<SourceUnit> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(tree_sitter_java::language())
        .context("load java grammar")?;
    let Some(tree) = parser.parse(content, None) else {
        tracing::warn!("failed to parse java source: {}", path);
        bail!("failed to parse java source: {path}");
    };
    let root = tree.root_node();
    if root.has_error() || root.is_error() {
        let (line, col) = first_error(root).unwrap_or((1, 1));
        tracing::warn!("java source contains parse errors: {}", path);
        bail!("syntax error in {path} at {line}:{col}");
    }

    let mut lower = Lowerer::new(content, path);
    lower.program(root);
    let mut unit = lower.finish();
    if let Some(marker) = suppress_comment {
        unit.suppressed.extend(
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains(marker))
                .map(|(idx, _)| idx + 1),
        );
    }
    tracing::debug!(file = path, facts = unit.facts.len(), "java unit lowered");
    Ok(unit)
}

/// Location (1-based) of the first error or missing node.
fn first_error(node: Node) -> Option<(usize, usize)> {
    if node.is_error() || node.is_missing() {
        let p = node.start_position();
        return Some((p.row + 1, p.column + 1));
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error() || c.is_missing())
        .find_map(first_error)
}
