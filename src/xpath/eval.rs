//! Evaluation of compiled expressions over a `roxmltree` document.
//!
//! Name tests are namespace-unaware: an unprefixed name matches the local
//! name of an element or attribute in any namespace.

use std::collections::HashMap;

use roxmltree::{Document, Node, NodeId, NodeType};

use crate::error::EvaluationError;

use super::ast::{
    ArithOp, Axis, CompareOp, Expr, Function, KindTest, NodeTest, PathExpr, PathStart, Step,
};

/// A node selected by an expression: a tree node or an attribute of one.
#[derive(Debug, Clone, Copy)]
pub(crate) enum XNode<'a, 'input> {
    Tree(Node<'a, 'input>),
    Attribute { owner: Node<'a, 'input>, index: usize },
}

impl<'a, 'input> XNode<'a, 'input> {
    fn owner(self) -> Node<'a, 'input> {
        match self {
            Self::Tree(node) | Self::Attribute { owner: node, .. } => node,
        }
    }

    pub(crate) fn string_value(self) -> String {
        match self {
            Self::Tree(node) => match node.node_type() {
                NodeType::Root | NodeType::Element => {
                    let mut out = String::new();
                    collect_text(node, &mut out);
                    out
                }
                NodeType::Text | NodeType::Comment => node.text().unwrap_or_default().to_string(),
                NodeType::PI => node
                    .pi()
                    .and_then(|pi| pi.value)
                    .unwrap_or_default()
                    .to_string(),
            },
            Self::Attribute { owner, index } => owner
                .attributes()
                .nth(index)
                .map(|a| a.value().to_string())
                .unwrap_or_default(),
        }
    }

    fn local_name(self) -> String {
        match self {
            Self::Tree(node) => match node.node_type() {
                NodeType::Element => node.tag_name().name().to_string(),
                NodeType::PI => node.pi().map(|pi| pi.target.to_string()).unwrap_or_default(),
                _ => String::new(),
            },
            Self::Attribute { owner, index } => owner
                .attributes()
                .nth(index)
                .map(|a| a.name().to_string())
                .unwrap_or_default(),
        }
    }

    fn namespace_uri(self) -> String {
        match self {
            Self::Tree(node) if node.is_element() => {
                node.tag_name().namespace().unwrap_or_default().to_string()
            }
            Self::Tree(_) => String::new(),
            Self::Attribute { owner, index } => owner
                .attributes()
                .nth(index)
                .and_then(|a| a.namespace())
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub(crate) fn prefix(self) -> Option<&'input str> {
        let (owner, namespace) = match self {
            Self::Tree(node) if node.is_element() => (node, node.tag_name().namespace()),
            Self::Tree(_) => return None,
            Self::Attribute { owner, index } => {
                (owner, owner.attributes().nth(index).and_then(|a| a.namespace()))
            }
        };
        namespace
            .and_then(|ns| owner.lookup_prefix(ns))
            .filter(|prefix| !prefix.is_empty())
    }

    pub(crate) fn qualified_name(self) -> String {
        let local = self.local_name();
        match self.prefix() {
            Some(prefix) => format!("{prefix}:{local}"),
            None => local,
        }
    }
}

fn collect_text(node: Node<'_, '_>, out: &mut String) {
    for child in node.children() {
        match child.node_type() {
            NodeType::Text => out.push_str(child.text().unwrap_or_default()),
            NodeType::Element => collect_text(child, out),
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Value<'a, 'input> {
    NodeSet(Vec<XNode<'a, 'input>>),
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Value<'_, '_> {
    pub(crate) fn to_boolean(&self) -> bool {
        match self {
            Self::NodeSet(nodes) => !nodes.is_empty(),
            Self::Boolean(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
        }
    }

    pub(crate) fn to_number(&self) -> f64 {
        match self {
            Self::NodeSet(_) => string_to_number(&self.to_xpath_string()),
            Self::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(n) => *n,
            Self::String(s) => string_to_number(s),
        }
    }

    pub(crate) fn to_xpath_string(&self) -> String {
        match self {
            Self::NodeSet(nodes) => nodes.first().map(|n| n.string_value()).unwrap_or_default(),
            Self::Boolean(b) => b.to_string(),
            Self::Number(n) => number_to_string(*n),
            Self::String(s) => s.clone(),
        }
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let well_formed = !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|&c| c == '.').count() <= 1
        && digits != ".";
    if !well_formed {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else {
        format!("{n}")
    }
}

#[derive(Debug, Clone, Copy)]
struct Context<'a, 'input> {
    node: XNode<'a, 'input>,
    position: usize,
    size: usize,
}

/// Evaluator bound to one parsed document.
pub(crate) struct Evaluator<'a, 'input> {
    doc: &'a Document<'input>,
    order: HashMap<NodeId, usize>,
}

impl<'a, 'input> Evaluator<'a, 'input> {
    pub(crate) fn new(doc: &'a Document<'input>) -> Self {
        let order = doc
            .descendants()
            .enumerate()
            .map(|(idx, node)| (node.id(), idx))
            .collect();
        Self { doc, order }
    }

    /// Evaluates `expr` with the document root as context node.
    pub(crate) fn evaluate(&self, expr: &Expr) -> Result<Value<'a, 'input>, EvaluationError> {
        let ctx = Context {
            node: XNode::Tree(self.doc.root()),
            position: 1,
            size: 1,
        };
        self.eval(expr, ctx)
    }

    fn order_key(&self, node: XNode<'a, 'input>) -> (usize, usize) {
        match node {
            XNode::Tree(n) => (self.order.get(&n.id()).copied().unwrap_or(usize::MAX), 0),
            XNode::Attribute { owner, index } => {
                (self.order.get(&owner.id()).copied().unwrap_or(usize::MAX), index + 1)
            }
        }
    }

    fn sort_dedup(&self, nodes: &mut Vec<XNode<'a, 'input>>) {
        nodes.sort_by_key(|n| self.order_key(*n));
        nodes.dedup_by_key(|n| self.order_key(*n));
    }

    fn eval(&self, expr: &Expr, ctx: Context<'a, 'input>) -> Result<Value<'a, 'input>, EvaluationError> {
        match expr {
            Expr::Or(left, right) => {
                let value = self.eval(left, ctx)?.to_boolean() || self.eval(right, ctx)?.to_boolean();
                Ok(Value::Boolean(value))
            }
            Expr::And(left, right) => {
                let value = self.eval(left, ctx)?.to_boolean() && self.eval(right, ctx)?.to_boolean();
                Ok(Value::Boolean(value))
            }
            Expr::Compare(op, left, right) => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(Value::Boolean(compare_values(*op, &left, &right)))
            }
            Expr::Arith(op, left, right) => {
                let l = self.eval(left, ctx)?.to_number();
                let r = self.eval(right, ctx)?.to_number();
                let value = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => l / r,
                    ArithOp::Mod => l % r,
                };
                Ok(Value::Number(value))
            }
            Expr::Negate(inner) => Ok(Value::Number(-self.eval(inner, ctx)?.to_number())),
            Expr::Union(left, right) => {
                let (Value::NodeSet(mut l), Value::NodeSet(r)) = (self.eval(left, ctx)?, self.eval(right, ctx)?)
                else {
                    return Err(EvaluationError::UnionOfNonNodeSets);
                };
                l.extend(r);
                self.sort_dedup(&mut l);
                Ok(Value::NodeSet(l))
            }
            Expr::Literal(s) => Ok(Value::String(s.clone())),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Call(function, args) => self.call(*function, args, ctx),
            Expr::Path(path) => self.eval_path(path, ctx),
        }
    }

    fn eval_path(&self, path: &PathExpr, ctx: Context<'a, 'input>) -> Result<Value<'a, 'input>, EvaluationError> {
        let mut nodes = match &path.start {
            PathStart::Root => vec![XNode::Tree(self.doc.root())],
            PathStart::Context => vec![ctx.node],
            PathStart::Filter { primary, predicates } => {
                let value = self.eval(primary, ctx)?;
                if predicates.is_empty() && path.steps.is_empty() {
                    return Ok(value);
                }
                let Value::NodeSet(mut nodes) = value else {
                    return Err(if predicates.is_empty() {
                        EvaluationError::PathOnNonNodeSet
                    } else {
                        EvaluationError::PredicateOnNonNodeSet
                    });
                };
                self.sort_dedup(&mut nodes);
                for predicate in predicates {
                    nodes = self.filter(nodes, predicate)?;
                }
                nodes
            }
        };

        for step in &path.steps {
            let mut next = Vec::new();
            for node in &nodes {
                next.extend(self.eval_step(step, *node)?);
            }
            self.sort_dedup(&mut next);
            nodes = next;
        }

        Ok(Value::NodeSet(nodes))
    }

    fn eval_step(&self, step: &Step, node: XNode<'a, 'input>) -> Result<Vec<XNode<'a, 'input>>, EvaluationError> {
        let mut candidates: Vec<XNode<'a, 'input>> = axis_nodes(step.axis, node)
            .into_iter()
            .filter(|n| node_test_matches(&step.test, step.axis, *n))
            .collect();

        // Proximity positions: document order, reversed for reverse axes.
        self.sort_dedup(&mut candidates);
        if step.axis.is_reverse() {
            candidates.reverse();
        }
        for predicate in &step.predicates {
            candidates = self.filter(candidates, predicate)?;
        }
        Ok(candidates)
    }

    #[allow(clippy::cast_precision_loss)]
    fn filter(
        &self,
        nodes: Vec<XNode<'a, 'input>>,
        predicate: &Expr,
    ) -> Result<Vec<XNode<'a, 'input>>, EvaluationError> {
        let size = nodes.len();
        let mut kept = Vec::with_capacity(size);
        for (idx, node) in nodes.into_iter().enumerate() {
            let ctx = Context {
                node,
                position: idx + 1,
                size,
            };
            let keep = match self.eval(predicate, ctx)? {
                Value::Number(n) => n == ctx.position as f64,
                other => other.to_boolean(),
            };
            if keep {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    fn node_set_arg(
        &self,
        function: &str,
        arg: &Expr,
        ctx: Context<'a, 'input>,
    ) -> Result<Vec<XNode<'a, 'input>>, EvaluationError> {
        match self.eval(arg, ctx)? {
            Value::NodeSet(nodes) => Ok(nodes),
            _ => Err(EvaluationError::NodeSetExpected {
                function: function.to_string(),
            }),
        }
    }

    /// Node named by an optional node-set argument, defaulting to the context node.
    fn optional_node(
        &self,
        function: &str,
        args: &[Expr],
        ctx: Context<'a, 'input>,
    ) -> Result<Option<XNode<'a, 'input>>, EvaluationError> {
        match args.first() {
            Some(arg) => Ok(self.node_set_arg(function, arg, ctx)?.first().copied()),
            None => Ok(Some(ctx.node)),
        }
    }

    fn string_arg(&self, args: &[Expr], idx: usize, ctx: Context<'a, 'input>) -> Result<String, EvaluationError> {
        match args.get(idx) {
            Some(arg) => Ok(self.eval(arg, ctx)?.to_xpath_string()),
            None => Ok(ctx.node.string_value()),
        }
    }

    fn number_arg(&self, args: &[Expr], idx: usize, ctx: Context<'a, 'input>) -> Result<f64, EvaluationError> {
        match args.get(idx) {
            Some(arg) => Ok(self.eval(arg, ctx)?.to_number()),
            None => Ok(Value::String(ctx.node.string_value()).to_number()),
        }
    }

    #[allow(clippy::too_many_lines, clippy::cast_precision_loss)]
    fn call(
        &self,
        function: Function,
        args: &[Expr],
        ctx: Context<'a, 'input>,
    ) -> Result<Value<'a, 'input>, EvaluationError> {
        let value = match function {
            Function::Last => Value::Number(ctx.size as f64),
            Function::Position => Value::Number(ctx.position as f64),
            Function::Count => Value::Number(self.node_set_arg("count", &args[0], ctx)?.len() as f64),
            Function::LocalName => Value::String(
                self.optional_node("local-name", args, ctx)?
                    .map(XNode::local_name)
                    .unwrap_or_default(),
            ),
            Function::NamespaceUri => Value::String(
                self.optional_node("namespace-uri", args, ctx)?
                    .map(XNode::namespace_uri)
                    .unwrap_or_default(),
            ),
            Function::Name => Value::String(
                self.optional_node("name", args, ctx)?
                    .map(XNode::qualified_name)
                    .unwrap_or_default(),
            ),
            Function::String => Value::String(self.string_arg(args, 0, ctx)?),
            Function::Concat => {
                let mut out = String::new();
                for arg in args {
                    out.push_str(&self.eval(arg, ctx)?.to_xpath_string());
                }
                Value::String(out)
            }
            Function::StartsWith => {
                let s = self.string_arg(args, 0, ctx)?;
                let prefix = self.string_arg(args, 1, ctx)?;
                Value::Boolean(s.starts_with(&prefix))
            }
            Function::Contains => {
                let s = self.string_arg(args, 0, ctx)?;
                let needle = self.string_arg(args, 1, ctx)?;
                Value::Boolean(s.contains(&needle))
            }
            Function::SubstringBefore => {
                let s = self.string_arg(args, 0, ctx)?;
                let needle = self.string_arg(args, 1, ctx)?;
                Value::String(s.find(&needle).map(|idx| s[..idx].to_string()).unwrap_or_default())
            }
            Function::SubstringAfter => {
                let s = self.string_arg(args, 0, ctx)?;
                let needle = self.string_arg(args, 1, ctx)?;
                Value::String(
                    s.find(&needle)
                        .map(|idx| s[idx + needle.len()..].to_string())
                        .unwrap_or_default(),
                )
            }
            Function::Substring => {
                let s = self.string_arg(args, 0, ctx)?;
                let start = round_half_up(self.number_arg(args, 1, ctx)?);
                let end = match args.get(2) {
                    Some(_) => start + round_half_up(self.number_arg(args, 2, ctx)?),
                    None => f64::INFINITY,
                };
                let out: String = s
                    .chars()
                    .enumerate()
                    .filter(|(idx, _)| {
                        let pos = (*idx + 1) as f64;
                        pos >= start && pos < end
                    })
                    .map(|(_, c)| c)
                    .collect();
                Value::String(out)
            }
            Function::StringLength => Value::Number(self.string_arg(args, 0, ctx)?.chars().count() as f64),
            Function::NormalizeSpace => {
                let s = self.string_arg(args, 0, ctx)?;
                Value::String(s.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            Function::Translate => {
                let s = self.string_arg(args, 0, ctx)?;
                let from: Vec<char> = self.string_arg(args, 1, ctx)?.chars().collect();
                let to: Vec<char> = self.string_arg(args, 2, ctx)?.chars().collect();
                let out: String = s
                    .chars()
                    .filter_map(|c| match from.iter().position(|&f| f == c) {
                        Some(idx) => to.get(idx).copied(),
                        None => Some(c),
                    })
                    .collect();
                Value::String(out)
            }
            Function::Boolean => Value::Boolean(self.eval(&args[0], ctx)?.to_boolean()),
            Function::Not => Value::Boolean(!self.eval(&args[0], ctx)?.to_boolean()),
            Function::True => Value::Boolean(true),
            Function::False => Value::Boolean(false),
            Function::Number => Value::Number(self.number_arg(args, 0, ctx)?),
            Function::Sum => {
                let nodes = self.node_set_arg("sum", &args[0], ctx)?;
                Value::Number(nodes.iter().map(|n| string_to_number(&n.string_value())).sum())
            }
            Function::Floor => Value::Number(self.number_arg(args, 0, ctx)?.floor()),
            Function::Ceiling => Value::Number(self.number_arg(args, 0, ctx)?.ceil()),
            Function::Round => Value::Number(round_half_up(self.number_arg(args, 0, ctx)?)),
        };
        Ok(value)
    }
}

fn round_half_up(n: f64) -> f64 {
    if n.is_finite() {
        (n + 0.5).floor()
    } else {
        n
    }
}

#[derive(Debug, Clone)]
enum Atom {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Atom {
    fn number(&self) -> f64 {
        match self {
            Self::Boolean(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::String(s) => string_to_number(s),
        }
    }

    fn boolean(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
        }
    }

    fn string(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::Number(n) => number_to_string(*n),
            Self::String(s) => s.clone(),
        }
    }
}

fn compare_atoms(op: CompareOp, left: &Atom, right: &Atom) -> bool {
    match op {
        CompareOp::Eq | CompareOp::NotEq => {
            let equal = if matches!(left, Atom::Boolean(_)) || matches!(right, Atom::Boolean(_)) {
                left.boolean() == right.boolean()
            } else if matches!(left, Atom::Number(_)) || matches!(right, Atom::Number(_)) {
                left.number() == right.number()
            } else {
                left.string() == right.string()
            };
            if op == CompareOp::Eq {
                equal
            } else {
                !equal
            }
        }
        CompareOp::Lt => left.number() < right.number(),
        CompareOp::Le => left.number() <= right.number(),
        CompareOp::Gt => left.number() > right.number(),
        CompareOp::Ge => left.number() >= right.number(),
    }
}

fn to_atom(value: &Value<'_, '_>) -> Atom {
    match value {
        Value::Boolean(b) => Atom::Boolean(*b),
        Value::Number(n) => Atom::Number(*n),
        Value::String(s) => Atom::String(s.clone()),
        Value::NodeSet(_) => Atom::String(value.to_xpath_string()),
    }
}

fn compare_values(op: CompareOp, left: &Value<'_, '_>, right: &Value<'_, '_>) -> bool {
    match (left, right) {
        (Value::NodeSet(l), Value::NodeSet(r)) => {
            let right_values: Vec<Atom> = r.iter().map(|n| Atom::String(n.string_value())).collect();
            l.iter().any(|ln| {
                let la = Atom::String(ln.string_value());
                right_values.iter().any(|ra| compare_atoms(op, &la, ra))
            })
        }
        (Value::NodeSet(_), Value::Boolean(b)) => {
            compare_atoms(op, &Atom::Boolean(left.to_boolean()), &Atom::Boolean(*b))
        }
        (Value::Boolean(b), Value::NodeSet(_)) => {
            compare_atoms(op, &Atom::Boolean(*b), &Atom::Boolean(right.to_boolean()))
        }
        (Value::NodeSet(l), other) => {
            let ra = to_atom(other);
            l.iter()
                .any(|n| compare_atoms(op, &node_atom(n, &ra), &ra))
        }
        (other, Value::NodeSet(r)) => {
            let la = to_atom(other);
            r.iter()
                .any(|n| compare_atoms(op, &la, &node_atom(n, &la)))
        }
        (l, r) => compare_atoms(op, &to_atom(l), &to_atom(r)),
    }
}

/// Converts a node to the atom type it is compared as against `other`.
fn node_atom(node: &XNode<'_, '_>, other: &Atom) -> Atom {
    let value = node.string_value();
    match other {
        Atom::Number(_) => Atom::Number(string_to_number(&value)),
        _ => Atom::String(value),
    }
}

fn axis_nodes<'a, 'input>(axis: Axis, node: XNode<'a, 'input>) -> Vec<XNode<'a, 'input>> {
    let mut out = Vec::new();
    match axis {
        Axis::SelfAxis => out.push(node),
        Axis::Attribute => {
            if let XNode::Tree(n) = node {
                if n.is_element() {
                    out.extend((0..n.attributes().len()).map(|index| XNode::Attribute { owner: n, index }));
                }
            }
        }
        Axis::Child => {
            if let XNode::Tree(n) = node {
                out.extend(n.children().map(XNode::Tree));
            }
        }
        Axis::Descendant => {
            if let XNode::Tree(n) = node {
                push_descendants(n, &mut out);
            }
        }
        Axis::DescendantOrSelf => {
            out.push(node);
            if let XNode::Tree(n) = node {
                push_descendants(n, &mut out);
            }
        }
        Axis::Parent => {
            if let Some(parent) = parent_of(node) {
                out.push(XNode::Tree(parent));
            }
        }
        Axis::Ancestor | Axis::AncestorOrSelf => {
            if axis == Axis::AncestorOrSelf {
                out.push(node);
            }
            let mut current = parent_of(node);
            while let Some(n) = current {
                out.push(XNode::Tree(n));
                current = n.parent();
            }
        }
        Axis::FollowingSibling => {
            if let XNode::Tree(n) = node {
                let mut current = n.next_sibling();
                while let Some(s) = current {
                    out.push(XNode::Tree(s));
                    current = s.next_sibling();
                }
            }
        }
        Axis::PrecedingSibling => {
            if let XNode::Tree(n) = node {
                let mut current = n.prev_sibling();
                while let Some(s) = current {
                    out.push(XNode::Tree(s));
                    current = s.prev_sibling();
                }
            }
        }
        Axis::Following => {
            let start = match node {
                XNode::Tree(n) => n,
                XNode::Attribute { owner, .. } => {
                    push_descendants(owner, &mut out);
                    owner
                }
            };
            let mut current = Some(start);
            while let Some(n) = current {
                let mut sibling = n.next_sibling();
                while let Some(s) = sibling {
                    out.push(XNode::Tree(s));
                    push_descendants(s, &mut out);
                    sibling = s.next_sibling();
                }
                current = n.parent();
            }
        }
        Axis::Preceding => {
            let start = node.owner();
            let mut current = Some(start);
            while let Some(n) = current {
                let mut sibling = n.prev_sibling();
                while let Some(s) = sibling {
                    out.push(XNode::Tree(s));
                    push_descendants(s, &mut out);
                    sibling = s.prev_sibling();
                }
                current = n.parent();
            }
        }
    }
    out
}

fn parent_of<'a, 'input>(node: XNode<'a, 'input>) -> Option<Node<'a, 'input>> {
    match node {
        XNode::Tree(n) => n.parent(),
        XNode::Attribute { owner, .. } => Some(owner),
    }
}

fn push_descendants<'a, 'input>(node: Node<'a, 'input>, out: &mut Vec<XNode<'a, 'input>>) {
    for child in node.children() {
        out.push(XNode::Tree(child));
        push_descendants(child, out);
    }
}

fn node_test_matches(test: &NodeTest, axis: Axis, node: XNode<'_, '_>) -> bool {
    let principal = |n: XNode<'_, '_>| match n {
        XNode::Attribute { .. } => axis == Axis::Attribute,
        XNode::Tree(t) => axis != Axis::Attribute && t.is_element(),
    };

    match test {
        NodeTest::Wildcard { prefix } => {
            principal(node) && prefix.as_deref().map_or(true, |p| node.prefix() == Some(p))
        }
        NodeTest::Name { prefix, local } => {
            principal(node)
                && node.local_name() == *local
                && prefix.as_deref().map_or(true, |p| node.prefix() == Some(p))
        }
        NodeTest::Kind(kind) => {
            let XNode::Tree(n) = node else {
                return matches!(kind, KindTest::Node);
            };
            match kind {
                KindTest::Node => true,
                KindTest::Text => n.is_text(),
                KindTest::Comment => n.is_comment(),
                KindTest::ProcessingInstruction(target) => match n.pi() {
                    Some(pi) => target.as_deref().map_or(true, |t| pi.target == t),
                    None => false,
                },
            }
        }
    }
}
