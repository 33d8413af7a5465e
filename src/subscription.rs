//! Job subscription declarations.
//!
//! A job declares an ordered list of [`SubscriptionProperties`]: the PubSub
//! node to listen on, an XPath filter that decides whether a published item
//! triggers the job, and named variables extracted from the item. The
//! declarations are pure data, validated when constructed or deserialized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EvaluationError, ValidationError};
use crate::xpath::XPathFilter;

fn variable_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid variable name pattern"))
}

/// Identity of a CI job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A named value extracted from each matching event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVariable")]
pub struct Variable {
    name: String,
    expression: XPathFilter,
}

#[derive(Deserialize)]
struct RawVariable {
    name: String,
    #[serde(default)]
    expression: String,
}

impl TryFrom<RawVariable> for Variable {
    type Error = ValidationError;

    fn try_from(raw: RawVariable) -> Result<Self, Self::Error> {
        Self::new(raw.name, &raw.expression)
    }
}

impl Variable {
    /// Creates a variable after validating its name and compiling the
    /// expression.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidVariableName`] or
    /// [`ValidationError::InvalidExpression`].
    pub fn new(name: impl Into<String>, expression: &str) -> Result<Self, ValidationError> {
        let name = name.into();
        if !variable_name_pattern().is_match(&name) {
            return Err(ValidationError::InvalidVariableName { name });
        }
        Ok(Self {
            name,
            expression: XPathFilter::compile(expression)?,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn expression(&self) -> &XPathFilter {
        &self.expression
    }

    /// Extracts the variable's value from an event payload.
    ///
    /// # Errors
    ///
    /// Returns the [`EvaluationError`] of the variable's expression.
    pub fn resolve(&self, xml: &str) -> Result<String, EvaluationError> {
        self.expression.try_evaluate(xml)
    }
}

/// One (node, filter, variables) subscription entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSubscription")]
pub struct SubscriptionProperties {
    node: String,
    filter: XPathFilter,
    variables: Vec<Variable>,
}

#[derive(Deserialize)]
struct RawSubscription {
    node: String,
    #[serde(default)]
    filter: XPathFilter,
    #[serde(default)]
    variables: Vec<Variable>,
}

impl TryFrom<RawSubscription> for SubscriptionProperties {
    type Error = ValidationError;

    fn try_from(raw: RawSubscription) -> Result<Self, Self::Error> {
        Self::new(raw.node, raw.filter, raw.variables)
    }
}

impl SubscriptionProperties {
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyNodeName`] when `node` is blank.
    pub fn new(
        node: impl Into<String>,
        filter: XPathFilter,
        variables: Vec<Variable>,
    ) -> Result<Self, ValidationError> {
        let node = node.into();
        if node.trim().is_empty() {
            return Err(ValidationError::EmptyNodeName);
        }
        Ok(Self { node, filter, variables })
    }

    /// Convenience constructor compiling the filter from text.
    ///
    /// # Errors
    ///
    /// Returns the validation error of the node or the filter.
    pub fn with_filter(node: impl Into<String>, filter: &str) -> Result<Self, ValidationError> {
        Self::new(node, XPathFilter::compile(filter)?, Vec::new())
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    #[must_use]
    pub fn filter(&self) -> &XPathFilter {
        &self.filter
    }

    #[must_use]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Resolves every variable against `xml`, later names overriding earlier
    /// ones.
    ///
    /// # Errors
    ///
    /// Returns the first variable's [`EvaluationError`].
    pub fn resolve_variables(&self, xml: &str) -> Result<BTreeMap<String, String>, EvaluationError> {
        self.variables
            .iter()
            .map(|v| Ok((v.name().to_string(), v.resolve(xml)?)))
            .collect()
    }
}

/// Ordered subscription entries of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionRegistry {
    entries: Vec<SubscriptionProperties>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(entries: Vec<SubscriptionProperties>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[SubscriptionProperties] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries declared for `node`, in declaration order.
    pub fn lookup_by_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a SubscriptionProperties> + 'a {
        self.entries.iter().filter(move |e| e.node == node)
    }

    /// Distinct node names in declaration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !nodes.contains(&entry.node()) {
                nodes.push(entry.node());
            }
        }
        nodes
    }
}

impl FromIterator<SubscriptionProperties> for SubscriptionRegistry {
    fn from_iter<I: IntoIterator<Item = SubscriptionProperties>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A job together with its trigger declaration, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTriggerConfig {
    pub job: JobName,
    #[serde(default)]
    pub subscriptions: SubscriptionRegistry,
}

impl JobTriggerConfig {
    /// Parses a TOML job trigger file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::Parse`] when the document is not
    /// valid TOML or a declaration fails validation.
    pub fn from_toml(text: &str) -> Result<Self, crate::error::ConfigError> {
        toml::from_str(text).map_err(|e| crate::error::ConfigError::Parse { message: e.to_string() })
    }
}
