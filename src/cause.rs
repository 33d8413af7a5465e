//! Build cause attached to builds scheduled by an XMPP event.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a build was scheduled: the event, the filter that matched it and the
/// variables extracted from it.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCause {
    pub node: String,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_xml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl TriggerCause {
    #[must_use]
    pub fn new(node: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            item_id: item_id.into(),
            event_xml: None,
            filter: None,
            variables: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, xml: impl Into<String>) -> Self {
        self.event_xml = Some(xml.into());
        self
    }

    /// Records the filter; the identity filter is not recorded.
    #[must_use]
    pub fn with_filter(mut self, expression: &str) -> Self {
        self.filter = (!expression.trim().is_empty()).then(|| expression.to_string());
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// One-line description shown in build history.
    #[must_use]
    pub fn short_description(&self) -> &'static str {
        "El Oyente received an XMPP event"
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.short_description())?;
        writeln!(f, "  node: {}", self.node)?;
        writeln!(f, "  item: {}", self.item_id)?;
        if let Some(filter) = &self.filter {
            writeln!(f, "  filter: {filter}")?;
        }
        for (name, value) in &self.variables {
            writeln!(f, "  {name} = {value}")?;
        }
        write!(f, "  received: {}", self.received_at.to_rfc3339())
    }
}
