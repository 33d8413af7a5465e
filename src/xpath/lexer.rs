//! Tokenizer for XPath 1.0 expressions.
//!
//! Disambiguation of `*` and operator names follows the XPath 1.0 lexical
//! rules: whether a token is an operator depends on the token before it.

use super::ast::{Axis, KindTest};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Dot,
    DotDot,
    Pipe,
    Plus,
    Minus,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Multiply,
    And,
    Or,
    Div,
    Mod,
    DoubleColon,
    Literal(String),
    Number(f64),
    /// `*`, `prefix:*`, `name` or `prefix:name`.
    NameTest {
        prefix: Option<String>,
        local: Option<String>,
    },
    NodeType(KindTest),
    FunctionName(String),
    AxisName(Axis),
    Variable(String),
}

impl Token {
    /// True when a following `*` or NCName must be read as an operator.
    fn allows_operator_after(&self) -> bool {
        !matches!(
            self,
            Self::At
                | Self::DoubleColon
                | Self::LParen
                | Self::LBracket
                | Self::Comma
                | Self::And
                | Self::Or
                | Self::Div
                | Self::Mod
                | Self::Multiply
                | Self::Slash
                | Self::DoubleSlash
                | Self::Pipe
                | Self::Plus
                | Self::Minus
                | Self::Eq
                | Self::NotEq
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
        )
    }
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let operator_context = tokens.last().is_some_and(Token::allows_operator_after);

        let token = match c {
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    i += 2;
                    Token::DoubleSlash
                } else {
                    i += 1;
                    Token::Slash
                }
            }
            '[' => {
                i += 1;
                Token::LBracket
            }
            ']' => {
                i += 1;
                Token::RBracket
            }
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            '@' => {
                i += 1;
                Token::At
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            '|' => {
                i += 1;
                Token::Pipe
            }
            '+' => {
                i += 1;
                Token::Plus
            }
            '-' => {
                i += 1;
                Token::Minus
            }
            '=' => {
                i += 1;
                Token::Eq
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    Token::NotEq
                } else {
                    return Err(format!("unexpected '!' at offset {i}"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    Token::Le
                } else {
                    i += 1;
                    Token::Lt
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    Token::Ge
                } else {
                    i += 1;
                    Token::Gt
                }
            }
            ':' => {
                if chars.get(i + 1) == Some(&':') {
                    i += 2;
                    Token::DoubleColon
                } else {
                    return Err(format!("unexpected ':' at offset {i}"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let Some(len) = chars[start..].iter().position(|&ch| ch == quote) else {
                    return Err(format!("unterminated string literal at offset {i}"));
                };
                i = start + len + 1;
                Token::Literal(chars[start..start + len].iter().collect())
            }
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    i += 2;
                    Token::DotDot
                } else if chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                    let (number, next) = read_number(&chars, i)?;
                    i = next;
                    Token::Number(number)
                } else {
                    i += 1;
                    Token::Dot
                }
            }
            '$' => {
                let (name, next) = read_qname(&chars, i + 1)
                    .ok_or_else(|| format!("expected variable name at offset {}", i + 1))?;
                i = next;
                Token::Variable(name)
            }
            '*' => {
                i += 1;
                if operator_context {
                    Token::Multiply
                } else {
                    Token::NameTest {
                        prefix: None,
                        local: None,
                    }
                }
            }
            c if c.is_ascii_digit() => {
                let (number, next) = read_number(&chars, i)?;
                i = next;
                Token::Number(number)
            }
            c if is_name_start(c) => {
                let (name, next) = read_ncname(&chars, i);
                i = next;
                if operator_context {
                    match name.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "div" => Token::Div,
                        "mod" => Token::Mod,
                        other => {
                            return Err(format!("expected an operator, found '{other}'"));
                        }
                    }
                } else {
                    let (token, next) = classify_name(&chars, name, i)?;
                    i = next;
                    token
                }
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
        };

        tokens.push(token);
    }

    Ok(tokens)
}

/// Resolves an NCName that is not in operator position into a name test,
/// node type, function name or axis name.
fn classify_name(chars: &[char], name: String, mut i: usize) -> Result<(Token, usize), String> {
    // Qualified name or `prefix:*`.
    if chars.get(i) == Some(&':') && chars.get(i + 1) != Some(&':') {
        if chars.get(i + 1) == Some(&'*') {
            return Ok((
                Token::NameTest {
                    prefix: Some(name),
                    local: None,
                },
                i + 2,
            ));
        }
        if chars.get(i + 1).copied().is_some_and(is_name_start) {
            let (local, next) = read_ncname(chars, i + 1);
            i = next;
            let token = if next_non_space(chars, i) == Some('(') {
                Token::FunctionName(format!("{name}:{local}"))
            } else {
                Token::NameTest {
                    prefix: Some(name),
                    local: Some(local),
                }
            };
            return Ok((token, i));
        }
        return Err(format!("malformed qualified name '{name}:'"));
    }

    let lookahead = next_non_space(chars, i);
    if lookahead == Some('(') {
        let token = match name.as_str() {
            "node" => Token::NodeType(KindTest::Node),
            "text" => Token::NodeType(KindTest::Text),
            "comment" => Token::NodeType(KindTest::Comment),
            "processing-instruction" => Token::NodeType(KindTest::ProcessingInstruction(None)),
            _ => Token::FunctionName(name),
        };
        return Ok((token, i));
    }

    if lookahead == Some(':') {
        let offset = chars[i..].iter().position(|c| !c.is_whitespace()).unwrap_or(0);
        if chars.get(i + offset + 1) == Some(&':') {
            let axis = Axis::from_name(&name).ok_or_else(|| format!("unknown axis '{name}'"))?;
            return Ok((Token::AxisName(axis), i));
        }
    }

    Ok((
        Token::NameTest {
            prefix: None,
            local: Some(name),
        },
        i,
    ))
}

fn next_non_space(chars: &[char], from: usize) -> Option<char> {
    chars[from..].iter().copied().find(|c| !c.is_whitespace())
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '\u{b7}')
}

fn read_ncname(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && is_name_char(chars[end]) {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn read_qname(chars: &[char], start: usize) -> Option<(String, usize)> {
    if !chars.get(start).copied().is_some_and(is_name_start) {
        return None;
    }
    let (mut name, mut end) = read_ncname(chars, start);
    if chars.get(end) == Some(&':') && chars.get(end + 1).copied().is_some_and(is_name_start) {
        let (local, next) = read_ncname(chars, end + 1);
        name = format!("{name}:{local}");
        end = next;
    }
    Some((name, end))
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    if chars.get(end) == Some(&'.') {
        end += 1;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
    }
    let text: String = chars[start..end].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, end))
        .map_err(|e| format!("invalid number '{text}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_is_name_test_at_start_and_multiply_after_operand() {
        let tokens = tokenize("* * 2").unwrap();
        assert_eq!(
            tokens[0],
            Token::NameTest {
                prefix: None,
                local: None
            }
        );
        assert_eq!(tokens[1], Token::Multiply);
        assert_eq!(tokens[2], Token::Number(2.0));
    }

    #[test]
    fn operator_names_depend_on_position() {
        let tokens = tokenize("and and div").unwrap();
        assert_eq!(
            tokens[0],
            Token::NameTest {
                prefix: None,
                local: Some("and".to_string())
            }
        );
        assert_eq!(tokens[1], Token::And);
        assert_eq!(
            tokens[2],
            Token::NameTest {
                prefix: None,
                local: Some("div".to_string())
            }
        );
    }

    #[test]
    fn axis_and_function_names() {
        let tokens = tokenize("child::foo[count(bar) > 1]").unwrap();
        assert_eq!(tokens[0], Token::AxisName(Axis::Child));
        assert_eq!(tokens[1], Token::DoubleColon);
        assert_eq!(tokens[4], Token::FunctionName("count".to_string()));
    }

    #[test]
    fn qualified_names_and_prefix_wildcards() {
        let tokens = tokenize("//ns:item/ns:*").unwrap();
        assert_eq!(
            tokens[1],
            Token::NameTest {
                prefix: Some("ns".to_string()),
                local: Some("item".to_string())
            }
        );
        assert_eq!(
            tokens[3],
            Token::NameTest {
                prefix: Some("ns".to_string()),
                local: None
            }
        );
    }

    #[test]
    fn literals_and_numbers() {
        let tokens = tokenize("'a\"b' = .5").unwrap();
        assert_eq!(tokens[0], Token::Literal("a\"b".to_string()));
        assert_eq!(tokens[2], Token::Number(0.5));
    }

    #[test]
    fn rejects_unterminated_literal() {
        assert!(tokenize("'abc").is_err());
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(tokenize("foo # bar").is_err());
        assert!(tokenize("a ! b").is_err());
    }
}
