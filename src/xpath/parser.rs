//! Recursive-descent parser producing the compiled [`Expr`] tree.
//!
//! Grammar follows XPath 1.0 section 3, lowest precedence first:
//! `or`, `and`, equality, relational, additive, multiplicative, unary,
//! union, path.

use super::ast::{
    ArithOp, Axis, CompareOp, Expr, Function, KindTest, NodeTest, PathExpr, PathStart, Step,
};
use super::lexer::{tokenize, Token};

/// Deepest sub-expression nesting accepted. Parentheses, predicates,
/// function arguments, unary minus and each chained binary operator count
/// one level.
pub(crate) const MAX_NESTING: usize = 128;

pub(crate) fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("expression is empty".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(format!("unexpected token {token:?}"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(found) => format!("expected {expected:?}, found {found:?}"),
                None => format!("expected {expected:?}, found end of expression"),
            })
        }
    }

    /// Takes one nesting level; released by [`leave`](Self::leave).
    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!("expression nests deeper than {MAX_NESTING} levels"));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        self.enter()?;
        let mut levels = 1;
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            self.enter()?;
            levels += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            self.enter()?;
            levels += 1;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CompareOp::Eq,
                Some(Token::NotEq) => CompareOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CompareOp::Lt,
                Some(Token::Le) => CompareOp::Le,
                Some(Token::Gt) => CompareOp::Gt,
                Some(Token::Ge) => CompareOp::Ge,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.parse_additive()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Multiply) => ArithOp::Mul,
                Some(Token::Div) => ArithOp::Div,
                Some(Token::Mod) => ArithOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        let mut negations = 0;
        while self.eat(&Token::Minus) {
            self.enter()?;
            negations += 1;
        }
        let mut expr = self.parse_union()?;
        for _ in 0..negations {
            expr = Expr::Negate(Box::new(expr));
        }
        self.leave(negations);
        Ok(expr)
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let mut levels = 0;
        let mut left = self.parse_path()?;
        while self.eat(&Token::Pipe) {
            self.enter()?;
            levels += 1;
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                let steps = if self.at_step_start() {
                    self.parse_relative_steps()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Root,
                    steps,
                }))
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                let mut steps = vec![Step::descendant_or_self()];
                steps.extend(self.parse_relative_steps()?);
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Root,
                    steps,
                }))
            }
            Some(
                Token::Literal(_)
                | Token::Number(_)
                | Token::FunctionName(_)
                | Token::LParen
                | Token::Variable(_),
            ) => self.parse_filter_path(),
            Some(_) if self.at_step_start() => {
                let steps = self.parse_relative_steps()?;
                Ok(Expr::Path(PathExpr {
                    start: PathStart::Context,
                    steps,
                }))
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_filter_path(&mut self) -> Result<Expr, String> {
        let primary = self.parse_primary()?;
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            predicates.push(self.parse_predicate()?);
        }

        let mut steps = Vec::new();
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                steps = self.parse_relative_steps()?;
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                steps.extend(self.parse_relative_steps()?);
            }
            _ => {}
        }

        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(Expr::Path(PathExpr {
            start: PathStart::Filter {
                primary: Box::new(primary),
                predicates,
            },
            steps,
        }))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Variable(name)) => {
                Err(format!("variable reference '${name}' is not supported"))
            }
            Some(Token::FunctionName(name)) => self.parse_call(&name),
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, String> {
        let (function, min, max) =
            Function::lookup(name).ok_or_else(|| format!("unknown function '{name}()'"))?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::RParen)?;
                break;
            }
        }
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(format!(
                "function '{name}()' called with {} argument(s)",
                args.len()
            ));
        }
        Ok(Expr::Call(function, args))
    }

    fn at_step_start(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Token::NameTest { .. }
                    | Token::NodeType(_)
                    | Token::AxisName(_)
                    | Token::At
                    | Token::Dot
                    | Token::DotDot
            )
        )
    }

    fn parse_relative_steps(&mut self) -> Result<Vec<Step>, String> {
        let mut steps = vec![self.parse_step()?];
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step()?);
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(Step::descendant_or_self());
                    steps.push(self.parse_step()?);
                }
                _ => return Ok(steps),
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Kind(KindTest::Node),
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Kind(KindTest::Node),
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let Some(Token::AxisName(axis)) = self.peek() {
            let axis = *axis;
            self.pos += 1;
            self.expect(&Token::DoubleColon)?;
            axis
        } else {
            Axis::Child
        };

        let test = self.parse_node_test()?;
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            predicates.push(self.parse_predicate()?);
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_node_test(&mut self) -> Result<NodeTest, String> {
        match self.next() {
            Some(Token::NameTest {
                prefix,
                local: Some(local),
            }) => Ok(NodeTest::Name { prefix, local }),
            Some(Token::NameTest {
                prefix,
                local: None,
            }) => Ok(NodeTest::Wildcard { prefix }),
            Some(Token::NodeType(kind)) => {
                self.expect(&Token::LParen)?;
                let kind = match kind {
                    KindTest::ProcessingInstruction(_) => {
                        if let Some(Token::Literal(target)) = self.peek() {
                            let target = target.clone();
                            self.pos += 1;
                            KindTest::ProcessingInstruction(Some(target))
                        } else {
                            KindTest::ProcessingInstruction(None)
                        }
                    }
                    other => other,
                };
                self.expect(&Token::RParen)?;
                Ok(NodeTest::Kind(kind))
            }
            Some(token) => Err(format!("expected a node test, found {token:?}")),
            None => Err("expected a node test, found end of expression".to_string()),
        }
    }

    fn parse_predicate(&mut self) -> Result<Expr, String> {
        self.expect(&Token::LBracket)?;
        if self.peek() == Some(&Token::RBracket) {
            return Err("empty predicate".to_string());
        }
        let expr = self.parse_or()?;
        self.expect(&Token::RBracket)?;
        Ok(expr)
    }
}
