//! Lowering of a tree-sitter Java tree into facts.
//!
//! Expressions are flattened so that every `call` argument is a simple
//! operand: nested calls and string expressions are hoisted into `$tN`
//! temporaries declared right before their use. Structured control flow
//! becomes nested scopes.

use ir::{DeclOrigin, Meta, NullCheck, Operand, ScopeKind, SourceUnit, TargetKind, UnitBuilder};
use std::collections::{BTreeMap, HashMap};
use tree_sitter::Node;

const BUILDER_TYPES: &[&str] = &["StringBuilder", "StringBuffer"];
const STRING_STATICS: &[&str] = &["format", "join", "valueOf", "copyValueOf"];
const TYPE_DECLARATIONS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
    "annotation_type_declaration",
];

fn named_children<'t>(n: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = n.walk();
    n.named_children(&mut cursor)
        .filter(|c| !is_comment(*c))
        .collect()
}

fn field_children<'t>(n: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = n.walk();
    n.children_by_field_name(field, &mut cursor).collect()
}

fn is_comment(n: Node) -> bool {
    matches!(n.kind(), "line_comment" | "block_comment" | "comment")
}

fn strip_parens(mut n: Node) -> Node {
    while n.kind() == "parenthesized_expression" {
        match named_children(n).into_iter().next() {
            Some(inner) => n = inner,
            None => break,
        }
    }
    n
}

fn starts_upper(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn is_constant_name(s: &str) -> bool {
    starts_upper(s)
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Content of a string literal or text block without quotes, with the
/// common escapes resolved.
pub(crate) fn unquote(raw: &str) -> String {
    let inner = if raw.len() >= 6 && raw.starts_with("\"\"\"") && raw.ends_with("\"\"\"") {
        raw[3..raw.len() - 3].trim_start_matches(['\r', '\n'])
    } else if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other @ ('"' | '\\' | '\'')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub(crate) struct Lowerer<'s> {
    src: &'s str,
    lines: Vec<&'s str>,
    b: UnitBuilder,
    /// Declared type of every name seen so far (fields, parameters, locals).
    types: HashMap<String, String>,
    /// Temporaries holding the result of a fluent builder call, mapped to
    /// the builder they alias.
    builders: HashMap<String, String>,
}

impl<'s> Lowerer<'s> {
    pub(crate) fn new(src: &'s str, path: &str) -> Self {
        Self {
            src,
            lines: src.lines().collect(),
            b: UnitBuilder::new(path, "java"),
            types: HashMap::new(),
            builders: HashMap::new(),
        }
    }

    pub(crate) fn finish(self) -> SourceUnit {
        self.b.finish()
    }

    fn text(&self, n: Node) -> &'s str {
        n.utf8_text(self.src.as_bytes()).unwrap_or("")
    }

    /// Moves the cursor to `n`; the evidence is the source line it starts on.
    fn at(&mut self, n: Node) {
        let p = n.start_position();
        let excerpt = self.lines.get(p.row).map(|l| l.trim()).unwrap_or("");
        self.b.at_with(Meta::new(p.row + 1, p.column + 1), excerpt);
    }

    fn temp(&mut self) -> String {
        let t = self.b.temp();
        self.b.declare(t.clone(), None, DeclOrigin::Temp);
        t
    }

    fn declare(&mut self, name: &str, ty: Option<&str>, origin: DeclOrigin) {
        if let Some(t) = ty {
            self.types.insert(name.to_string(), t.to_string());
        }
        self.b.declare(name, ty, origin);
    }

    fn is_builder(&self, name: &str) -> bool {
        self.builders.contains_key(name)
            || self
                .types
                .get(name)
                .map(|t| ir::simple_type_name(t))
                .is_some_and(|t| BUILDER_TYPES.contains(&t.as_str()))
    }

    pub(crate) fn program(&mut self, root: Node) {
        self.collect_hints(root);
        for child in named_children(root) {
            match child.kind() {
                "import_declaration" => self.import(child),
                k if TYPE_DECLARATIONS.contains(&k) => self.class(child),
                _ => {}
            }
        }
    }

    /// Records the declared type of every field up front so uses before the
    /// declaration still resolve.
    fn collect_hints(&mut self, n: Node) {
        if matches!(n.kind(), "field_declaration" | "constant_declaration") {
            let Some(ty) = n.child_by_field_name("type") else {
                return;
            };
            let ty = self.text(ty).to_string();
            for d in field_children(n, "declarator") {
                if let Some(name) = d.child_by_field_name("name") {
                    let name = self.text(name).to_string();
                    self.b.hint(name.clone(), ty.clone());
                    self.types.insert(name, ty.clone());
                }
            }
            return;
        }
        for c in named_children(n) {
            self.collect_hints(c);
        }
    }

    fn import(&mut self, n: Node) {
        self.at(n);
        let raw = self
            .text(n)
            .trim()
            .trim_start_matches("import")
            .trim()
            .trim_start_matches("static ")
            .trim()
            .trim_end_matches(';')
            .trim()
            .replace(char::is_whitespace, "");
        if !raw.is_empty() {
            self.b.import(raw);
        }
    }

    /// Keyword modifiers and annotation nodes of a declaration.
    fn modifiers<'t>(&self, n: Node<'t>) -> (Vec<String>, Vec<Node<'t>>) {
        let mut words = Vec::new();
        let mut anns = Vec::new();
        let mut cursor = n.walk();
        let mods = n.children(&mut cursor).find(|k| k.kind() == "modifiers");
        if let Some(m) = mods {
            let mut inner = m.walk();
            for k in m.children(&mut inner) {
                match k.kind() {
                    "marker_annotation" | "annotation" => anns.push(k),
                    _ if is_comment(k) => {}
                    _ => words.push(self.text(k).to_string()),
                }
            }
        }
        (words, anns)
    }

    fn annotations(&mut self, target: &str, kind: TargetKind, anns: &[Node], modifiers: &[String]) {
        for a in anns {
            self.at(*a);
            let name = a
                .child_by_field_name("name")
                .map(|x| self.text(x).to_string())
                .unwrap_or_default();
            let mut args = BTreeMap::new();
            if let Some(list) = a.child_by_field_name("arguments") {
                for arg in named_children(list) {
                    if arg.kind() == "element_value_pair" {
                        let key = arg
                            .child_by_field_name("key")
                            .map(|k| self.text(k).to_string())
                            .unwrap_or_default();
                        if let Some(v) = arg.child_by_field_name("value") {
                            args.insert(key, self.constant(v));
                        }
                    } else {
                        args.insert("value".to_string(), self.constant(arg));
                    }
                }
            }
            self.b
                .annotate(target, kind, name, args, modifiers.to_vec());
        }
    }

    fn constant(&self, n: Node) -> Operand {
        match n.kind() {
            "string_literal" | "text_block" => Operand::literal(unquote(self.text(n))),
            _ => Operand::Constant {
                value: self.text(n).to_string(),
            },
        }
    }

    fn class(&mut self, n: Node) {
        let name = n
            .child_by_field_name("name")
            .map(|x| self.text(x).to_string())
            .unwrap_or_default();
        let (mods, anns) = self.modifiers(n);
        self.at(n.child_by_field_name("name").unwrap_or(n));
        let id = self.b.enter(ScopeKind::Class { name: name.clone() });
        self.annotations(&name, TargetKind::Class, &anns, &mods);
        if let Some(body) = n.child_by_field_name("body") {
            for member in named_children(body) {
                self.member(member);
            }
        }
        self.b.exit_to(id);
    }

    fn member(&mut self, m: Node) {
        match m.kind() {
            "field_declaration" | "constant_declaration" => self.field(m),
            "method_declaration" | "constructor_declaration" | "compact_constructor_declaration" => {
                self.method(m)
            }
            "enum_body_declarations" => {
                for c in named_children(m) {
                    self.member(c);
                }
            }
            "static_initializer" | "block" => {
                let (name, modifiers) = if m.kind() == "static_initializer" {
                    ("<clinit>", vec!["static".to_string()])
                } else {
                    ("<init>", Vec::new())
                };
                self.at(m);
                let id = self.b.enter(ScopeKind::Method {
                    name: name.to_string(),
                    modifiers,
                });
                let body = if m.kind() == "block" {
                    Some(m)
                } else {
                    named_children(m).into_iter().find(|c| c.kind() == "block")
                };
                if let Some(b) = body {
                    self.block_statements(b);
                }
                self.b.exit_to(id);
            }
            k if TYPE_DECLARATIONS.contains(&k) => self.class(m),
            _ => {}
        }
    }

    fn field(&mut self, m: Node) {
        let (mods, anns) = self.modifiers(m);
        let ty = m
            .child_by_field_name("type")
            .map(|t| self.text(t).to_string());
        for d in field_children(m, "declarator") {
            let Some(name_node) = d.child_by_field_name("name") else {
                continue;
            };
            let name = self.text(name_node).to_string();
            self.at(d);
            self.declare(&name, ty.as_deref(), DeclOrigin::Field);
            self.annotations(&name, TargetKind::Field, &anns, &mods);
            if let Some(v) = d.child_by_field_name("value") {
                self.at(d);
                self.assign_expr(&name, v);
            }
        }
    }

    fn method(&mut self, m: Node) {
        let name = m
            .child_by_field_name("name")
            .map(|x| self.text(x).to_string())
            .unwrap_or_else(|| "<init>".to_string());
        let (mods, anns) = self.modifiers(m);
        self.at(m.child_by_field_name("name").unwrap_or(m));
        let id = self.b.enter(ScopeKind::Method {
            name: name.clone(),
            modifiers: mods.clone(),
        });
        self.annotations(&name, TargetKind::Method, &anns, &mods);
        if let Some(params) = m.child_by_field_name("parameters") {
            for p in named_children(params) {
                self.parameter(p);
            }
        }
        if let Some(body) = m.child_by_field_name("body") {
            self.block_statements(body);
        }
        self.b.exit_to(id);
    }

    fn parameter(&mut self, p: Node) {
        let (mods, anns) = self.modifiers(p);
        let (ty, name) = match p.kind() {
            "formal_parameter" => (
                p.child_by_field_name("type").map(|t| self.text(t).to_string()),
                p.child_by_field_name("name").map(|n| self.text(n).to_string()),
            ),
            "spread_parameter" => {
                let kids = named_children(p);
                let ty = kids
                    .iter()
                    .find(|c| c.kind() != "modifiers" && c.kind() != "variable_declarator")
                    .map(|t| format!("{}[]", self.text(*t)));
                let name = kids
                    .iter()
                    .find(|c| c.kind() == "variable_declarator")
                    .and_then(|d| d.child_by_field_name("name"))
                    .map(|n| self.text(n).to_string());
                (ty, name)
            }
            _ => return,
        };
        let Some(name) = name else {
            return;
        };
        self.at(p);
        self.declare(&name, ty.as_deref(), DeclOrigin::Parameter);
        self.annotations(&name, TargetKind::Parameter, &anns, &mods);
    }

    fn block_statements(&mut self, block: Node) {
        for s in named_children(block) {
            self.stmt(s);
        }
    }

    /// Statements of a body; a block does not open a scope of its own here.
    fn body(&mut self, s: Node) {
        if s.kind() == "block" {
            self.block_statements(s);
        } else {
            self.stmt(s);
        }
    }

    fn arm(&mut self, s: Node) {
        let id = self.b.enter(ScopeKind::Arm);
        self.body(s);
        self.b.exit_to(id);
    }

    fn stmt(&mut self, n: Node) {
        match n.kind() {
            "block" => {
                self.at(n);
                let id = self.b.enter(ScopeKind::Block);
                self.block_statements(n);
                self.b.exit_to(id);
            }
            "local_variable_declaration" => self.local(n),
            "expression_statement" => {
                if let Some(e) = named_children(n).into_iter().next() {
                    self.at(e);
                    self.effect(e);
                }
            }
            "if_statement" => self.if_stmt(n),
            "while_statement" => {
                if let Some(c) = n.child_by_field_name("condition") {
                    self.at(c);
                    self.expr(c);
                }
                self.at(n);
                let id = self.b.enter(ScopeKind::Loop);
                if let Some(body) = n.child_by_field_name("body") {
                    self.body(body);
                }
                self.b.exit_to(id);
            }
            "do_statement" => {
                self.at(n);
                let id = self.b.enter(ScopeKind::Loop);
                if let Some(body) = n.child_by_field_name("body") {
                    self.body(body);
                }
                if let Some(c) = n.child_by_field_name("condition") {
                    self.at(c);
                    self.expr(c);
                }
                self.b.exit_to(id);
            }
            "for_statement" => self.for_stmt(n),
            "enhanced_for_statement" => self.foreach(n),
            "try_statement" => self.try_stmt(n, None),
            "try_with_resources_statement" => {
                self.try_stmt(n, n.child_by_field_name("resources"))
            }
            "return_statement" => {
                self.at(n);
                let value = named_children(n).into_iter().next().map(|e| self.expr(e));
                self.at(n);
                self.b.ret(value);
            }
            "throw_statement" => {
                self.at(n);
                let value = named_children(n).into_iter().next().map(|e| self.expr(e));
                self.at(n);
                self.b.throw(value);
            }
            "switch_expression" | "switch_statement" => self.switch(n),
            "synchronized_statement" => {
                for c in named_children(n) {
                    if c.kind() == "block" {
                        self.stmt(c);
                    } else {
                        self.at(c);
                        self.expr(c);
                    }
                }
            }
            "labeled_statement" => {
                for c in named_children(n) {
                    if c.kind() != "identifier" {
                        self.stmt(c);
                    }
                }
            }
            "yield_statement" => {
                if let Some(e) = named_children(n).into_iter().next() {
                    self.at(e);
                    self.expr(e);
                }
            }
            "explicit_constructor_invocation" => {
                self.at(n);
                let target = n
                    .child_by_field_name("constructor")
                    .map(|c| self.text(c).to_string())
                    .unwrap_or_else(|| "super".to_string());
                let args = self.arguments(n);
                self.at(n);
                self.b.call(None, target, args, None);
            }
            k if TYPE_DECLARATIONS.contains(&k) => self.class(n),
            "local_class_declaration" => self.class(n),
            _ => {}
        }
    }

    fn local(&mut self, n: Node) {
        let ty = n
            .child_by_field_name("type")
            .map(|t| self.text(t).to_string());
        for d in field_children(n, "declarator") {
            let Some(name_node) = d.child_by_field_name("name") else {
                continue;
            };
            let name = self.text(name_node).to_string();
            self.at(d);
            self.declare(&name, ty.as_deref(), DeclOrigin::Local);
            if let Some(v) = d.child_by_field_name("value") {
                self.assign_expr(&name, v);
            }
        }
    }

    /// `x != null` / `x == null` conditions refine the branch arms.
    fn null_check(&self, cond: Node) -> Option<NullCheck> {
        let c = strip_parens(cond);
        if c.kind() != "binary_expression" {
            return None;
        }
        let op = self.text(c.child_by_field_name("operator")?);
        if op != "!=" && op != "==" {
            return None;
        }
        let (l, r) = (c.child_by_field_name("left")?, c.child_by_field_name("right")?);
        let subject = if r.kind() == "null_literal" {
            l
        } else if l.kind() == "null_literal" {
            r
        } else {
            return None;
        };
        if !matches!(subject.kind(), "identifier" | "field_access") {
            return None;
        }
        let symbol = self.text(subject).trim_start_matches("this.").to_string();
        Some(NullCheck {
            symbol,
            non_null_in_first: op == "!=",
        })
    }

    fn if_stmt(&mut self, n: Node) {
        let cond = n.child_by_field_name("condition");
        if let Some(c) = cond {
            self.at(c);
            self.expr(c);
        }
        let alternative = n.child_by_field_name("alternative");
        let null_check = cond.and_then(|c| self.null_check(c));
        self.at(n);
        let id = self.b.enter(ScopeKind::Branch {
            exhaustive: alternative.is_some(),
            null_check,
        });
        if let Some(c) = n.child_by_field_name("consequence") {
            self.arm(c);
        }
        if let Some(a) = alternative {
            self.arm(a);
        }
        self.b.exit_to(id);
    }

    fn for_stmt(&mut self, n: Node) {
        for init in field_children(n, "init") {
            if init.kind() == "local_variable_declaration" {
                self.local(init);
            } else {
                self.at(init);
                self.effect(init);
            }
        }
        if let Some(c) = n.child_by_field_name("condition") {
            self.at(c);
            self.expr(c);
        }
        self.at(n);
        let id = self.b.enter(ScopeKind::Loop);
        if let Some(body) = n.child_by_field_name("body") {
            self.body(body);
        }
        for update in field_children(n, "update") {
            self.at(update);
            self.effect(update);
        }
        self.b.exit_to(id);
    }

    fn foreach(&mut self, n: Node) {
        let source = n.child_by_field_name("value").map(|v| {
            self.at(v);
            self.expr(v)
        });
        self.at(n);
        let id = self.b.enter(ScopeKind::Loop);
        let ty = n
            .child_by_field_name("type")
            .map(|t| self.text(t).to_string());
        if let Some(name) = n.child_by_field_name("name") {
            let name = self.text(name).to_string();
            self.declare(&name, ty.as_deref(), DeclOrigin::Local);
            if let Some(src) = source {
                self.b.assign(name, src);
            }
        }
        if let Some(body) = n.child_by_field_name("body") {
            self.body(body);
        }
        self.b.exit_to(id);
    }

    fn switch(&mut self, n: Node) {
        if let Some(c) = n.child_by_field_name("condition") {
            self.at(c);
            self.expr(c);
        }
        let Some(body) = n.child_by_field_name("body") else {
            return;
        };
        let groups = named_children(body);
        let exhaustive = groups.iter().any(|g| {
            named_children(*g)
                .iter()
                .any(|l| l.kind() == "switch_label" && self.text(*l).trim().starts_with("default"))
        });
        self.at(n);
        let id = self.b.enter(ScopeKind::Branch {
            exhaustive,
            null_check: None,
        });
        for g in groups {
            let arm = self.b.enter(ScopeKind::Arm);
            for s in named_children(g) {
                match s.kind() {
                    "switch_label" => {}
                    "expression_statement" | "block" | "throw_statement" => self.stmt(s),
                    k if k.ends_with("_statement") || k == "local_variable_declaration" => {
                        self.stmt(s)
                    }
                    _ => {
                        self.at(s);
                        self.expr(s);
                    }
                }
            }
            self.b.exit_to(arm);
        }
        self.b.exit_to(id);
    }

    fn try_stmt(&mut self, n: Node, resources: Option<Node>) {
        let kids = named_children(n);
        let catches: Vec<Node> = kids
            .iter()
            .copied()
            .filter(|c| c.kind() == "catch_clause")
            .collect();
        let finally = kids.iter().copied().find(|c| c.kind() == "finally_clause");
        let has_catch = !catches.is_empty();
        let has_finally = finally.is_some();

        self.at(n);
        let wrap = resources.is_none() || has_catch || has_finally;
        let scopes = wrap.then(|| {
            let t = self.b.enter(ScopeKind::Try {
                has_catch,
                has_finally,
            });
            (t, self.b.enter(ScopeKind::Arm))
        });

        match resources {
            Some(spec) => self.guarded(spec, n.child_by_field_name("body")),
            None => {
                if let Some(body) = n.child_by_field_name("body") {
                    self.body(body);
                }
            }
        }

        if let Some((try_id, arm_id)) = scopes {
            self.b.exit_to(arm_id);
            for c in catches {
                self.catch_clause(c);
            }
            self.b.exit_to(try_id);
        }
        if let Some(f) = finally {
            self.at(f);
            let id = self.b.enter(ScopeKind::Finally);
            for b in named_children(f) {
                self.body(b);
            }
            self.b.exit_to(id);
        }
    }

    /// Try-with-resources: every resource is closed on every exit of the body.
    fn guarded(&mut self, spec: Node, body: Option<Node>) {
        let resources = named_children(spec);
        let guarded = resources
            .iter()
            .map(|r| match r.child_by_field_name("name") {
                Some(name) => self.text(name).to_string(),
                None => self.text(*r).trim_start_matches("this.").to_string(),
            })
            .collect();
        self.at(spec);
        let id = self.b.enter(ScopeKind::ResourceGuard { guarded });
        for r in resources {
            let Some(name) = r.child_by_field_name("name") else {
                continue;
            };
            let name = self.text(name).to_string();
            let ty = r
                .child_by_field_name("type")
                .map(|t| self.text(t).to_string());
            self.at(r);
            self.declare(&name, ty.as_deref(), DeclOrigin::Resource);
            if let Some(v) = r.child_by_field_name("value") {
                self.assign_expr(&name, v);
            }
        }
        if let Some(b) = body {
            self.body(b);
        }
        self.b.exit_to(id);
    }

    fn catch_clause(&mut self, c: Node) {
        self.at(c);
        let id = self.b.enter(ScopeKind::Catch);
        let param = named_children(c)
            .into_iter()
            .find(|p| p.kind() == "catch_formal_parameter");
        if let Some(p) = param {
            let ty = named_children(p)
                .into_iter()
                .find(|t| t.kind() == "catch_type")
                .map(|t| self.text(t).replace(char::is_whitespace, ""));
            if let Some(name) = p.child_by_field_name("name") {
                let name = self.text(name).to_string();
                self.declare(&name, ty.as_deref(), DeclOrigin::Catch);
            }
        }
        if let Some(b) = c.child_by_field_name("body") {
            self.block_statements(b);
        }
        self.b.exit_to(id);
    }

    /// Expression evaluated for its side effects only.
    fn effect(&mut self, e: Node) {
        match e.kind() {
            "assignment_expression" => self.assignment(e),
            "method_invocation" => self.invocation(e, None),
            "object_creation_expression" => {
                self.new_object(e, None);
            }
            "update_expression" => {}
            _ => {
                self.expr(e);
            }
        }
    }

    /// Lowers `target = v` without an intermediate temporary.
    fn assign_expr(&mut self, target: &str, v: Node) {
        match v.kind() {
            "parenthesized_expression" => self.assign_expr(target, strip_parens(v)),
            "cast_expression" => match v.child_by_field_name("value") {
                Some(inner) => self.assign_expr(target, inner),
                None => {
                    let op = Operand::Opaque {
                        text: self.text(v).to_string(),
                    };
                    self.b.assign(target, op);
                }
            },
            "method_invocation" => self.invocation(v, Some(target)),
            "object_creation_expression" => {
                self.new_object(v, Some(target));
            }
            "binary_expression" if self.is_concat(v) => {
                let mut parts = Vec::new();
                self.concat_parts(v, &mut parts);
                self.at(v);
                self.b.string_build(target, parts);
            }
            _ => {
                let op = self.expr(v);
                self.at(v);
                self.b.assign(target, op);
            }
        }
    }

    fn assignment(&mut self, n: Node) {
        let (Some(left), Some(right)) = (n.child_by_field_name("left"), n.child_by_field_name("right"))
        else {
            return;
        };
        let op = n
            .child_by_field_name("operator")
            .map(|o| self.text(o))
            .unwrap_or("=");
        match left.kind() {
            "identifier" => {
                let name = self.text(left).to_string();
                match op {
                    "=" => self.assign_expr(&name, right),
                    "+=" => {
                        let mut parts = vec![Operand::symbol(name.as_str())];
                        self.concat_parts(right, &mut parts);
                        self.at(n);
                        self.b.string_build(name, parts);
                    }
                    _ => {
                        self.expr(right);
                        self.at(n);
                        let text = self.text(n).to_string();
                        self.b.assign(name, Operand::Opaque { text });
                    }
                }
            }
            "field_access" => {
                let object = left.child_by_field_name("object");
                let field = left
                    .child_by_field_name("field")
                    .map(|f| self.text(f).to_string())
                    .unwrap_or_default();
                let target = match object {
                    Some(o) if o.kind() == "this" => field,
                    _ => self.text(left).to_string(),
                };
                let value = if op == "=" {
                    self.expr(right)
                } else {
                    self.expr(right);
                    Operand::Opaque {
                        text: self.text(n).to_string(),
                    }
                };
                self.at(n);
                self.b.field_store(target, value);
            }
            _ => {
                self.expr(left);
                self.expr(right);
            }
        }
    }

    fn arguments(&mut self, call: Node) -> Vec<Operand> {
        let nodes = call
            .child_by_field_name("arguments")
            .map(named_children)
            .unwrap_or_default();
        let mut args = Vec::with_capacity(nodes.len());
        for a in nodes {
            args.push(self.expr(a));
        }
        args
    }

    /// Operand naming the receiver of a call. Capitalized names that are not
    /// declared anywhere in the unit are type references (static calls).
    fn receiver(&mut self, o: Node) -> Operand {
        match o.kind() {
            "identifier" => {
                let name = self.text(o);
                if starts_upper(name) && !self.types.contains_key(name) {
                    Operand::type_ref(name)
                } else {
                    Operand::symbol(name)
                }
            }
            "this" | "super" => Operand::symbol("this"),
            "field_access" | "scoped_identifier" => {
                let text = self.text(o);
                let last = text.rsplit('.').next().unwrap_or(text);
                let first = text.split('.').next().unwrap_or(text);
                if starts_upper(last)
                    && !is_constant_name(last)
                    && !starts_upper(first)
                    && !self.types.contains_key(first)
                    && first != "this"
                {
                    Operand::type_ref(text.replace(char::is_whitespace, ""))
                } else {
                    self.expr(o)
                }
            }
            _ => self.expr(o),
        }
    }

    fn invocation(&mut self, n: Node, dest: Option<&str>) {
        let method = n
            .child_by_field_name("name")
            .map(|x| self.text(x).to_string())
            .unwrap_or_default();
        let receiver = n.child_by_field_name("object").map(|o| self.receiver(o));
        let args = self.arguments(n);
        self.at(n);

        let receiver_name = receiver.as_ref().and_then(Operand::as_symbol).map(str::to_string);
        if let Some(sb) = receiver_name.filter(|r| {
            matches!(method.as_str(), "append" | "insert") && self.is_builder(r)
        }) {
            let root = self.builders.get(&sb).cloned().unwrap_or(sb);
            let mut parts = vec![Operand::symbol(root.as_str())];
            parts.extend(args);
            self.b.string_build(root.as_str(), parts);
            if let Some(d) = dest {
                self.b.assign(d, Operand::symbol(root.as_str()));
                self.builders.insert(d.to_string(), root);
            }
            return;
        }

        let string_static = matches!(&receiver, Some(Operand::TypeRef { name }) if name == "String")
            && STRING_STATICS.contains(&method.as_str());
        if string_static || (method == "concat" && receiver.is_some()) {
            let mut parts = Vec::new();
            if !string_static {
                parts.extend(receiver);
            }
            parts.extend(args);
            let target = match dest {
                Some(d) => d.to_string(),
                None => self.temp(),
            };
            self.b.string_build(target, parts);
            return;
        }

        self.b.call(receiver, method, args, dest);
    }

    /// `new T(..)`; string builders become `string_build` facts.
    fn new_object(&mut self, n: Node, dest: Option<&str>) -> Operand {
        let ty = n
            .child_by_field_name("type")
            .map(|t| self.text(t).to_string())
            .unwrap_or_default();
        let args = self.arguments(n);
        self.at(n);
        let simple = ir::simple_type_name(&ty);
        if BUILDER_TYPES.contains(&simple.as_str()) {
            let target = match dest {
                Some(d) => d.to_string(),
                None => self.temp(),
            };
            self.types.insert(target.clone(), simple);
            self.b.string_build(target.as_str(), args);
            return Operand::symbol(target);
        }
        match dest {
            Some(d) => {
                self.b.call(Some(Operand::type_ref(ty)), "new", args, Some(d));
                Operand::symbol(d)
            }
            None => {
                self.b.call(Some(Operand::type_ref(ty)), "new", args, None);
                Operand::Opaque {
                    text: self.text(n).to_string(),
                }
            }
        }
    }

    fn is_concat(&self, n: Node) -> bool {
        n.kind() == "binary_expression"
            && n.child_by_field_name("operator")
                .is_some_and(|o| self.text(o) == "+")
    }

    fn concat_parts(&mut self, n: Node, out: &mut Vec<Operand>) {
        let n = strip_parens(n);
        if self.is_concat(n) {
            if let Some(l) = n.child_by_field_name("left") {
                self.concat_parts(l, out);
            }
            if let Some(r) = n.child_by_field_name("right") {
                self.concat_parts(r, out);
            }
        } else {
            out.push(self.expr(n));
        }
    }

    fn field_operand(&mut self, n: Node) -> Operand {
        let field = n
            .child_by_field_name("field")
            .map(|f| self.text(f).to_string())
            .unwrap_or_default();
        match n.child_by_field_name("object") {
            Some(o) if o.kind() == "this" => Operand::symbol(format!("this.{field}")),
            Some(o) if o.kind() == "identifier" => {
                let owner = self.text(o);
                if starts_upper(owner) && !self.types.contains_key(owner) {
                    if is_constant_name(&field) {
                        Operand::symbol(field)
                    } else {
                        Operand::Constant {
                            value: self.text(n).to_string(),
                        }
                    }
                } else {
                    Operand::symbol(self.text(n))
                }
            }
            Some(o) => {
                self.expr(o);
                Operand::Opaque {
                    text: self.text(n).to_string(),
                }
            }
            None => Operand::symbol(field),
        }
    }

    /// Lowers an expression to a simple operand, hoisting calls and string
    /// expressions into temporaries.
    fn expr(&mut self, n: Node) -> Operand {
        match n.kind() {
            "parenthesized_expression" => {
                let inner = strip_parens(n);
                if inner.id() == n.id() {
                    Operand::Opaque {
                        text: self.text(n).to_string(),
                    }
                } else {
                    self.expr(inner)
                }
            }
            "string_literal" | "text_block" => Operand::literal(unquote(self.text(n))),
            "null_literal" => Operand::Null,
            "true"
            | "false"
            | "decimal_integer_literal"
            | "hex_integer_literal"
            | "octal_integer_literal"
            | "binary_integer_literal"
            | "decimal_floating_point_literal"
            | "hex_floating_point_literal"
            | "character_literal"
            | "class_literal" => Operand::Constant {
                value: self.text(n).to_string(),
            },
            "identifier" => Operand::symbol(self.text(n)),
            "this" => Operand::symbol("this"),
            "field_access" => self.field_operand(n),
            "method_invocation" => {
                let t = self.temp();
                self.invocation(n, Some(&t));
                Operand::symbol(t)
            }
            "object_creation_expression" => {
                let t = self.temp();
                self.new_object(n, Some(&t))
            }
            "binary_expression" if self.is_concat(n) => {
                let mut parts = Vec::new();
                self.concat_parts(n, &mut parts);
                let t = self.temp();
                self.at(n);
                self.b.string_build(t.as_str(), parts);
                Operand::symbol(t)
            }
            "ternary_expression" => self.ternary(n),
            "cast_expression" => match n.child_by_field_name("value") {
                Some(v) => self.expr(v),
                None => Operand::Opaque {
                    text: self.text(n).to_string(),
                },
            },
            "assignment_expression" => {
                self.assignment(n);
                match n.child_by_field_name("left") {
                    Some(l) if l.kind() == "identifier" => Operand::symbol(self.text(l)),
                    _ => Operand::Opaque {
                        text: self.text(n).to_string(),
                    },
                }
            }
            "lambda_expression" => self.lambda(n),
            "array_access" => {
                if let Some(i) = n.child_by_field_name("index") {
                    self.expr(i);
                }
                match n.child_by_field_name("array") {
                    Some(a) => self.expr(a),
                    None => Operand::Opaque {
                        text: self.text(n).to_string(),
                    },
                }
            }
            "method_reference" => Operand::Opaque {
                text: self.text(n).to_string(),
            },
            "switch_expression" => {
                self.switch(n);
                Operand::Opaque {
                    text: self.text(n).to_string(),
                }
            }
            _ => {
                // Comparisons, arithmetic, array creation and the like: the
                // operands may still contain calls.
                for c in named_children(n) {
                    if !matches!(c.kind(), "dimensions" | "dimensions_expr") && !c.kind().ends_with("_type") {
                        self.expr(c);
                    }
                }
                Operand::Opaque {
                    text: self.text(n).to_string(),
                }
            }
        }
    }

    fn ternary(&mut self, n: Node) -> Operand {
        let t = self.temp();
        let cond = n.child_by_field_name("condition");
        if let Some(c) = cond {
            self.expr(c);
        }
        let null_check = cond.and_then(|c| self.null_check(c));
        self.at(n);
        let id = self.b.enter(ScopeKind::Branch {
            exhaustive: true,
            null_check,
        });
        for field in ["consequence", "alternative"] {
            let arm = self.b.enter(ScopeKind::Arm);
            if let Some(v) = n.child_by_field_name(field) {
                self.assign_expr(&t, v);
            }
            self.b.exit_to(arm);
        }
        self.b.exit_to(id);
        Operand::symbol(t)
    }

    fn lambda(&mut self, n: Node) -> Operand {
        self.at(n);
        let id = self.b.enter(ScopeKind::Lambda);
        if let Some(params) = n.child_by_field_name("parameters") {
            if params.kind() == "identifier" {
                let name = self.text(params).to_string();
                self.declare(&name, None, DeclOrigin::Local);
            } else {
                for p in named_children(params) {
                    match p.kind() {
                        "identifier" => {
                            let name = self.text(p).to_string();
                            self.declare(&name, None, DeclOrigin::Local);
                        }
                        "formal_parameter" => {
                            let ty = p
                                .child_by_field_name("type")
                                .map(|t| self.text(t).to_string());
                            if let Some(name) = p.child_by_field_name("name") {
                                let name = self.text(name).to_string();
                                self.declare(&name, ty.as_deref(), DeclOrigin::Local);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if let Some(body) = n.child_by_field_name("body") {
            if body.kind() == "block" {
                self.block_statements(body);
            } else {
                self.at(body);
                let value = self.expr(body);
                self.b.ret(Some(value));
            }
        }
        self.b.exit_to(id);
        Operand::Opaque {
            text: "lambda".to_string(),
        }
    }
}
