//! Compiled form of an XPath expression.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Axis {
    Ancestor,
    AncestorOrSelf,
    Attribute,
    Child,
    Descendant,
    DescendantOrSelf,
    Following,
    FollowingSibling,
    Parent,
    Preceding,
    PrecedingSibling,
    SelfAxis,
}

impl Axis {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let axis = match name {
            "ancestor" => Self::Ancestor,
            "ancestor-or-self" => Self::AncestorOrSelf,
            "attribute" => Self::Attribute,
            "child" => Self::Child,
            "descendant" => Self::Descendant,
            "descendant-or-self" => Self::DescendantOrSelf,
            "following" => Self::Following,
            "following-sibling" => Self::FollowingSibling,
            "parent" => Self::Parent,
            "preceding" => Self::Preceding,
            "preceding-sibling" => Self::PrecedingSibling,
            "self" => Self::SelfAxis,
            _ => return None,
        };
        Some(axis)
    }

    /// Reverse axes number their nodes in reverse document order.
    pub(crate) const fn is_reverse(self) -> bool {
        matches!(
            self,
            Self::Ancestor | Self::AncestorOrSelf | Self::Preceding | Self::PrecedingSibling
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KindTest {
    Node,
    Text,
    Comment,
    ProcessingInstruction(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeTest {
    /// `*` or `prefix:*`.
    Wildcard { prefix: Option<String> },
    Name { prefix: Option<String>, local: String },
    Kind(KindTest),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    pub(crate) fn descendant_or_self() -> Self {
        Self {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Kind(KindTest::Node),
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathStart {
    /// Absolute path: starts at the document root.
    Root,
    /// Relative path: starts at the context node.
    Context,
    /// Filter expression: a primary expression with predicates.
    Filter { primary: Box<Expr>, predicates: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PathExpr {
    pub start: PathStart,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Last,
    Position,
    Count,
    LocalName,
    NamespaceUri,
    Name,
    String,
    Concat,
    StartsWith,
    Contains,
    SubstringBefore,
    SubstringAfter,
    Substring,
    StringLength,
    NormalizeSpace,
    Translate,
    Boolean,
    Not,
    True,
    False,
    Number,
    Sum,
    Floor,
    Ceiling,
    Round,
}

impl Function {
    /// Looks up a core library function and its accepted arity range.
    pub(crate) fn lookup(name: &str) -> Option<(Self, usize, Option<usize>)> {
        let entry = match name {
            "last" => (Self::Last, 0, Some(0)),
            "position" => (Self::Position, 0, Some(0)),
            "count" => (Self::Count, 1, Some(1)),
            "local-name" => (Self::LocalName, 0, Some(1)),
            "namespace-uri" => (Self::NamespaceUri, 0, Some(1)),
            "name" => (Self::Name, 0, Some(1)),
            "string" => (Self::String, 0, Some(1)),
            "concat" => (Self::Concat, 2, None),
            "starts-with" => (Self::StartsWith, 2, Some(2)),
            "contains" => (Self::Contains, 2, Some(2)),
            "substring-before" => (Self::SubstringBefore, 2, Some(2)),
            "substring-after" => (Self::SubstringAfter, 2, Some(2)),
            "substring" => (Self::Substring, 2, Some(3)),
            "string-length" => (Self::StringLength, 0, Some(1)),
            "normalize-space" => (Self::NormalizeSpace, 0, Some(1)),
            "translate" => (Self::Translate, 3, Some(3)),
            "boolean" => (Self::Boolean, 1, Some(1)),
            "not" => (Self::Not, 1, Some(1)),
            "true" => (Self::True, 0, Some(0)),
            "false" => (Self::False, 0, Some(0)),
            "number" => (Self::Number, 0, Some(1)),
            "sum" => (Self::Sum, 1, Some(1)),
            "floor" => (Self::Floor, 1, Some(1)),
            "ceiling" => (Self::Ceiling, 1, Some(1)),
            "round" => (Self::Round, 1, Some(1)),
            _ => return None,
        };
        Some(entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Literal(String),
    Number(f64),
    Call(Function, Vec<Expr>),
    Path(PathExpr),
}
