//! XPath 1.0 filtering and extraction over XML event payloads.
//!
//! An [`XPathFilter`] is compiled once, when a subscription declaration is
//! loaded, and evaluated for every published item on the node. Two
//! expressions have fixed meanings:
//!
//! - the empty expression is the identity filter: any non-empty payload
//!   matches and extraction returns the payload unchanged;
//! - `/` matches any non-empty payload, well-formed or not, and extraction
//!   also returns the payload unchanged.
//!
//! Otherwise the payload is parsed into a DOM. Malformed XML never raises:
//! it is simply a non-match. Neither does XML nested deeper than
//! [`MAX_XML_DEPTH`] elements, which is refused before it reaches the parser.

mod ast;
mod eval;
mod lexer;
mod parser;
mod serialize;

use std::fmt;
use std::sync::Arc;

use roxmltree::Document;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{EvaluationError, ValidationError};

use ast::Expr;
use eval::{Evaluator, Value};

/// Deepest element nesting accepted in an XML payload.
pub const MAX_XML_DEPTH: usize = 256;

/// Parses `xml`, refusing documents nested deeper than [`MAX_XML_DEPTH`].
pub(crate) fn parse_document(xml: &str) -> Result<Document<'_>, String> {
    if nesting_exceeds(xml.as_bytes(), MAX_XML_DEPTH) {
        debug!(limit = MAX_XML_DEPTH, "xml payload refused: nesting too deep");
        return Err(format!("elements nest deeper than {MAX_XML_DEPTH} levels"));
    }
    let doc = Document::parse(xml).map_err(|e| e.to_string())?;
    // Entity expansion can nest elements the byte scan never saw.
    if tree_exceeds(&doc, MAX_XML_DEPTH + 1) {
        debug!(limit = MAX_XML_DEPTH, "xml payload refused: expanded nesting too deep");
        return Err(format!("elements nest deeper than {MAX_XML_DEPTH} levels"));
    }
    Ok(doc)
}

/// Byte scan over start and end tags. Comments, CDATA, processing
/// instructions and declarations are skipped; quoted attribute values may
/// contain `>`.
fn nesting_exceeds(bytes: &[u8], limit: usize) -> bool {
    let skip_past = |from: usize, end: &[u8]| {
        bytes[from..]
            .windows(end.len())
            .position(|w| w == end)
            .map_or(bytes.len(), |p| from + p + end.len())
    };
    let mut depth = 0usize;
    let mut i = 0;
    while let Some(offset) = bytes[i..].iter().position(|&b| b == b'<') {
        let start = i + offset;
        let rest = &bytes[start..];
        i = if rest.starts_with(b"<!--") {
            skip_past(start + 4, b"-->")
        } else if rest.starts_with(b"<![CDATA[") {
            skip_past(start + 9, b"]]>")
        } else if rest.starts_with(b"<?") {
            skip_past(start + 2, b"?>")
        } else if rest.starts_with(b"<!") {
            skip_past(start + 2, b">")
        } else if rest.starts_with(b"</") {
            depth = depth.saturating_sub(1);
            skip_past(start + 2, b">")
        } else {
            let mut j = start + 1;
            let mut quote = None;
            while j < bytes.len() {
                match (quote, bytes[j]) {
                    (None, b'"' | b'\'') => quote = Some(bytes[j]),
                    (Some(q), b) if b == q => quote = None,
                    (None, b'>') => break,
                    _ => {}
                }
                j += 1;
            }
            if j >= bytes.len() {
                return false;
            }
            if bytes[j - 1] != b'/' {
                depth += 1;
                if depth > limit {
                    return true;
                }
            }
            j + 1
        };
    }
    false
}

/// Iterative walk; text leaves count one level below their element.
fn tree_exceeds(doc: &Document<'_>, limit: usize) -> bool {
    let mut node = doc.root();
    let mut depth = 0usize;
    loop {
        if let Some(child) = node.first_child() {
            depth += 1;
            if depth > limit {
                return true;
            }
            node = child;
            continue;
        }
        loop {
            if let Some(next) = node.next_sibling() {
                node = next;
                break;
            }
            match node.parent() {
                Some(parent) => {
                    node = parent;
                    depth -= 1;
                }
                None => return false,
            }
        }
    }
}

#[derive(Clone)]
enum FilterKind {
    Identity,
    Root,
    Compiled(Arc<Expr>),
}

/// A compiled XPath expression used as a boolean filter or value extractor.
#[derive(Clone)]
pub struct XPathFilter {
    expression: String,
    kind: FilterKind,
}

impl XPathFilter {
    /// Compiles `expression`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidExpression`] when the expression is
    /// not valid XPath 1.0 or uses variable references.
    pub fn compile(expression: impl Into<String>) -> Result<Self, ValidationError> {
        let expression = expression.into();
        let trimmed = expression.trim();
        let kind = if trimmed.is_empty() {
            FilterKind::Identity
        } else if trimmed == "/" {
            FilterKind::Root
        } else {
            let expr = parser::parse(trimmed).map_err(|reason| ValidationError::InvalidExpression {
                expression: expression.clone(),
                reason,
            })?;
            FilterKind::Compiled(Arc::new(expr))
        };
        Ok(Self { expression, kind })
    }

    /// The identity filter.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            expression: String::new(),
            kind: FilterKind::Identity,
        }
    }

    /// The source text this filter was compiled from.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True for the empty expression.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        matches!(self.kind, FilterKind::Identity)
    }

    /// Returns true when the payload matches.
    ///
    /// Evaluation errors count as no match.
    #[must_use]
    pub fn test(&self, xml: &str) -> bool {
        self.try_test(xml).unwrap_or(false)
    }

    /// Returns the serialized matches, or the empty string.
    ///
    /// Evaluation errors yield the empty string.
    #[must_use]
    pub fn evaluate(&self, xml: &str) -> String {
        self.try_evaluate(xml).unwrap_or_default()
    }

    /// Like [`test`](Self::test) but reports runtime type errors.
    ///
    /// # Errors
    ///
    /// Returns an [`EvaluationError`] when the expression applies an
    /// operation to a value of the wrong type.
    pub fn try_test(&self, xml: &str) -> Result<bool, EvaluationError> {
        let expr = match &self.kind {
            FilterKind::Identity | FilterKind::Root => return Ok(!xml.is_empty()),
            FilterKind::Compiled(expr) => expr,
        };
        let Ok(doc) = parse_document(xml) else {
            return Ok(false);
        };
        Ok(Evaluator::new(&doc).evaluate(expr)?.to_boolean())
    }

    /// Like [`evaluate`](Self::evaluate) but reports runtime type errors.
    ///
    /// # Errors
    ///
    /// Returns an [`EvaluationError`] when the expression applies an
    /// operation to a value of the wrong type.
    pub fn try_evaluate(&self, xml: &str) -> Result<String, EvaluationError> {
        let expr = match &self.kind {
            FilterKind::Identity | FilterKind::Root => return Ok(xml.to_string()),
            FilterKind::Compiled(expr) => expr,
        };
        let Ok(doc) = parse_document(xml) else {
            return Ok(String::new());
        };
        let value = Evaluator::new(&doc).evaluate(expr)?;
        let out = match value {
            Value::NodeSet(nodes) => {
                let mut out = String::new();
                for node in nodes {
                    serialize::write_node(node, &mut out);
                }
                out
            }
            other => other.to_xpath_string(),
        };
        Ok(out)
    }
}

impl Default for XPathFilter {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for XPathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("XPathFilter").field(&self.expression).finish()
    }
}

impl fmt::Display for XPathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for XPathFilter {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for XPathFilter {}

impl Serialize for XPathFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for XPathFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        Self::compile(expression).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO: &str = r#"<foo id="1"><bar id="1">baz</bar><bar id="2"/></foo>"#;

    #[test]
    fn empty_expression_is_identity() {
        let filter = XPathFilter::compile("").unwrap();
        assert!(filter.is_identity());
        assert!(filter.test(FOO));
        assert!(!filter.test(""));
        assert_eq!(filter.evaluate(FOO), FOO);
        assert_eq!(XPathFilter::compile("   ").unwrap(), XPathFilter::compile("   ").unwrap());
    }

    #[test]
    fn root_matches_any_non_empty_input() {
        let filter = XPathFilter::compile("/").unwrap();
        assert!(filter.test(FOO));
        assert!(filter.test("<foo></bar>"));
        assert!(!filter.test(""));
        assert_eq!(filter.evaluate(FOO), FOO);
    }

    #[test]
    fn root_element_reproduces_input() {
        let filter = XPathFilter::compile("/foo").unwrap();
        assert!(filter.test(FOO));
        assert_eq!(filter.evaluate(FOO), FOO);
    }

    #[test]
    fn non_matching_filter() {
        let filter = XPathFilter::compile("/bar").unwrap();
        assert!(!filter.test(FOO));
        assert_eq!(filter.evaluate(FOO), "");
    }

    #[test]
    fn multiple_matches_are_concatenated() {
        let filter = XPathFilter::compile("//bar").unwrap();
        assert!(filter.test(FOO));
        assert_eq!(filter.evaluate(FOO), r#"<bar id="1">baz</bar><bar id="2"/>"#);
    }

    #[test]
    fn attribute_and_text_extraction() {
        assert_eq!(XPathFilter::compile("//bar[2]/@id").unwrap().evaluate(FOO), "2");
        assert_eq!(XPathFilter::compile("//bar/text()").unwrap().evaluate(FOO), "baz");
    }

    #[test]
    fn default_namespace_is_ignored() {
        let xml = r#"<message xmlns="mynamespace"><foo><bar>bar1</bar><bar>bar2</bar></foo></message>"#;
        let filter = XPathFilter::compile("//foo").unwrap();
        assert!(filter.test(xml));
        assert_eq!(filter.evaluate(xml), "<foo><bar>bar1</bar><bar>bar2</bar></foo>");
    }

    #[test]
    fn malformed_xml_never_matches() {
        let filter = XPathFilter::compile("//bar").unwrap();
        let xml = "<foo></bar>baz<bar></foo>";
        assert!(!filter.test(xml));
        assert_eq!(filter.evaluate(xml), "");
    }

    fn nested(depth: usize) -> String {
        format!("{}x{}", "<a>".repeat(depth), "</a>".repeat(depth))
    }

    #[test]
    fn deeply_nested_xml_never_matches() {
        let xml = nested(5000);
        assert!(!XPathFilter::compile("true()").unwrap().test(&xml));
        assert_eq!(XPathFilter::compile("//a").unwrap().evaluate(&xml), "");
        assert!(parse_document(&xml).is_err());

        let shallow = nested(100);
        assert!(XPathFilter::compile("count(//a) = 100").unwrap().test(&shallow));
        assert!(parse_document(&nested(MAX_XML_DEPTH)).is_ok());
        assert!(parse_document(&nested(MAX_XML_DEPTH + 1)).is_err());
    }

    #[test]
    fn nesting_scan_skips_markup_that_is_not_a_tag() {
        let deep_comment = format!("<r><!--{}--></r>", "<a>".repeat(1000));
        assert!(!nesting_exceeds(deep_comment.as_bytes(), 8));
        let deep_cdata = format!("<r><![CDATA[{}]]></r>", "<a>".repeat(1000));
        assert!(!nesting_exceeds(deep_cdata.as_bytes(), 8));
        let attrs = format!("<r>{}</r>", r#"<a v="x>y"/>"#.repeat(1000));
        assert!(!nesting_exceeds(attrs.as_bytes(), 8));
        assert!(nesting_exceeds(nested(9).as_bytes(), 8));
    }

    #[test]
    fn scalar_results_are_coerced() {
        assert!(XPathFilter::compile("count(//bar) = 2").unwrap().test(FOO));
        assert!(!XPathFilter::compile("count(//bar) > 2").unwrap().test(FOO));
        assert_eq!(XPathFilter::compile("count(//bar)").unwrap().evaluate(FOO), "2");
        assert!(!XPathFilter::compile("string(//missing)").unwrap().test(FOO));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expr in ["//foo[", "foo]", "$x", "bogus(1)", "//"] {
            let err = XPathFilter::compile(expr).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidExpression { ref expression, .. } if expression == expr),
                "{expr}: {err:?}"
            );
        }
    }

    #[test]
    fn deeply_nested_expressions_are_rejected() {
        let deep = format!("{}1{}", "(".repeat(1000), ")".repeat(1000));
        let err = XPathFilter::compile(deep.as_str()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidExpression { ref reason, .. } if reason.contains("nests deeper")));
        let predicates = format!("//a{}", "[b".repeat(1000) + &"]".repeat(1000));
        assert!(XPathFilter::compile(predicates).is_err());
        assert!(XPathFilter::compile(format!("{}1{}", "(".repeat(50), ")".repeat(50))).is_ok());
    }

    #[test]
    fn runtime_type_errors_are_reported_by_fallible_forms() {
        let filter = XPathFilter::compile("count('a')").unwrap();
        assert!(filter.try_test(FOO).is_err());
        assert!(!filter.test(FOO));
        assert_eq!(filter.evaluate(FOO), "");
    }

    #[test]
    fn serde_uses_the_expression_text() {
        let filter: XPathFilter = serde_json::from_str("\"//bar\"").unwrap();
        assert_eq!(filter.expression(), "//bar");
        assert_eq!(serde_json::to_string(&filter).unwrap(), "\"//bar\"");
        assert!(serde_json::from_str::<XPathFilter>("\"//bar[\"").is_err());
    }
}
