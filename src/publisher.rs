//! ElBoca: publishes build events onto PubSub nodes.
//!
//! The payload is an XML template. Build variables are substituted into it,
//! the result must be well-formed, and it is published under a fresh
//! `Message_<millis>` item id through the shared connection.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connection::ConnectionManager;
use crate::error::{ElOyenteResult, TransportError, ValidationError};
use crate::nodes::NodeSubscriptionCoordinator;
use crate::xmpp::PublishedItem;
use crate::xpath::parse_document;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("valid reference pattern")
    })
}

fn element_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9._-]*(:[A-Za-z_][A-Za-z0-9._-]*)?$").expect("valid element name pattern")
    })
}

/// What to publish after a build.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub node: String,
    /// Element wrapping the payload; empty publishes the payload as is.
    #[serde(default)]
    pub element: String,
    pub payload: String,
}

/// Substitutes `${NAME}` and `$NAME` references with `vars`. Unknown
/// references are left untouched.
#[must_use]
pub fn render_payload(template: &str, vars: &BTreeMap<String, String>) -> String {
    reference_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[derive(Debug)]
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    nodes: NodeSubscriptionCoordinator,
    create_missing_nodes: bool,
}

impl EventPublisher {
    pub fn new(connection: Arc<ConnectionManager>, create_missing_nodes: bool) -> Self {
        Self {
            nodes: NodeSubscriptionCoordinator::new(Arc::clone(&connection), create_missing_nodes),
            connection,
            create_missing_nodes,
        }
    }

    /// Renders and publishes `request`, returning the item id.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty node or a payload that is not
    /// well-formed once rendered, and the transport error if publishing
    /// fails.
    pub fn publish(&self, request: &PublishRequest, vars: &BTreeMap<String, String>) -> ElOyenteResult<String> {
        let node = request.node.trim();
        if node.is_empty() {
            return Err(ValidationError::EmptyNodeName.into());
        }

        let payload = build_payload(node, &request.element, &render_payload(&request.payload, vars))?;

        if self.create_missing_nodes {
            self.nodes.ensure_node_exists(node)?;
        } else if !self.nodes.node_exists(node)? {
            return Err(TransportError::NodeNotFound { node: node.to_string() }.into());
        }

        let id = format!("Message_{}", Utc::now().timestamp_millis());
        self.connection
            .client()?
            .publish(node, PublishedItem::new(id.clone(), payload))?;
        info!(node = %node, item = %id, "published event");
        Ok(id)
    }
}

fn build_payload(node: &str, element: &str, rendered: &str) -> Result<String, ValidationError> {
    let malformed = |reason: String| ValidationError::MalformedPayload {
        node: node.to_string(),
        reason,
    };
    let element = element.trim();
    if !element.is_empty() && !element_name_pattern().is_match(element) {
        return Err(malformed(format!("`{element}` is not a valid element name")));
    }

    let doc = parse_document(rendered).map_err(malformed)?;
    let root = doc.root_element().tag_name();
    let qualified = match root.namespace().and_then(|ns| doc.root_element().lookup_prefix(ns)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", root.name()),
        _ => root.name().to_string(),
    };
    if element.is_empty() || qualified == element {
        return Ok(rendered.to_string());
    }

    let wrapped = format!("<{element}>{rendered}</{element}>");
    parse_document(&wrapped).map_err(malformed)?;
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::XmppSettings;
    use crate::xmpp::InMemoryPubSub;

    fn vars() -> BTreeMap<String, String> {
        [("BUILD_NUMBER", "17"), ("JOB_NAME", "core")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn publisher(create_missing_nodes: bool) -> (InMemoryPubSub, EventPublisher) {
        let service = InMemoryPubSub::new("xmpp.test");
        service.add_account("ci", "pw");
        let connection = Arc::new(ConnectionManager::new(Arc::new(service.session()), Duration::from_secs(1)));
        connection.open(&XmppSettings::new("xmpp.test", "ci", "pw")).unwrap();
        (service, EventPublisher::new(connection, create_missing_nodes))
    }

    #[test]
    fn renders_both_reference_forms() {
        let out = render_payload(r#"<build job="${JOB_NAME}" n="$BUILD_NUMBER">$UNKNOWN ${ALSO}</build>"#, &vars());
        assert_eq!(out, r#"<build job="core" n="17">$UNKNOWN ${ALSO}</build>"#);
    }

    #[test]
    fn publishes_to_a_created_node() {
        let (service, publisher) = publisher(true);
        let request = PublishRequest {
            node: "builds".to_string(),
            element: "build".to_string(),
            payload: r#"<build job="$JOB_NAME"/>"#.to_string(),
        };
        let id = publisher.publish(&request, &vars()).unwrap();
        assert!(id.starts_with("Message_"));
        assert!(service.has_node("builds"));

        let items = service.items("builds");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].payload, r#"<build job="core"/>"#);
    }

    #[test]
    fn wraps_payload_in_element() {
        let (service, publisher) = publisher(true);
        let request = PublishRequest {
            node: "builds".to_string(),
            element: "event".to_string(),
            payload: "<result>ok</result>".to_string(),
        };
        publisher.publish(&request, &BTreeMap::new()).unwrap();
        assert_eq!(service.items("builds")[0].payload, "<event><result>ok</result></event>");
    }

    #[test]
    fn rejects_malformed_payload_and_empty_node() {
        let (service, publisher) = publisher(true);
        let bad = PublishRequest {
            node: "builds".to_string(),
            element: String::new(),
            payload: "<a><b></a>".to_string(),
        };
        let err = publisher.publish(&bad, &vars()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ElOyenteError::Validation(ValidationError::MalformedPayload { .. })
        ));
        assert!(!service.has_node("builds"));

        let empty = PublishRequest {
            node: " ".to_string(),
            element: String::new(),
            payload: "<a/>".to_string(),
        };
        assert!(publisher.publish(&empty, &vars()).unwrap_err().is_validation());
    }

    #[test]
    fn rejects_invalid_wrapping_element() {
        let (service, publisher) = publisher(true);
        for element in ["a b", "x>", "1build", "<event>", "a\"b"] {
            let request = PublishRequest {
                node: "builds".to_string(),
                element: element.to_string(),
                payload: "<result>ok</result>".to_string(),
            };
            let err = publisher.publish(&request, &BTreeMap::new()).unwrap_err();
            assert!(
                matches!(
                    err,
                    crate::error::ElOyenteError::Validation(ValidationError::MalformedPayload { .. })
                ),
                "{element}: {err:?}"
            );
        }
        assert!(!service.has_node("builds"));

        let prefixed = PublishRequest {
            node: "builds".to_string(),
            element: "ci:event".to_string(),
            payload: "<result>ok</result>".to_string(),
        };
        assert!(publisher.publish(&prefixed, &BTreeMap::new()).is_err());
        let declared = PublishRequest {
            node: "builds".to_string(),
            element: "ci:event".to_string(),
            payload: r#"<ci:event xmlns:ci="urn:ci"><result/></ci:event>"#.to_string(),
        };
        publisher.publish(&declared, &BTreeMap::new()).unwrap();
        assert_eq!(service.items("builds")[0].payload, declared.payload);
    }

    #[test]
    fn rejects_deeply_nested_payload() {
        let (service, publisher) = publisher(true);
        let request = PublishRequest {
            node: "builds".to_string(),
            element: String::new(),
            payload: format!("{}{}", "<a>".repeat(5000), "</a>".repeat(5000)),
        };
        assert!(publisher.publish(&request, &BTreeMap::new()).unwrap_err().is_validation());
        assert!(!service.has_node("builds"));
    }

    #[test]
    fn missing_node_without_creation() {
        let (_service, publisher) = publisher(false);
        let request = PublishRequest {
            node: "absent".to_string(),
            element: String::new(),
            payload: "<a/>".to_string(),
        };
        assert!(publisher.publish(&request, &vars()).unwrap_err().is_transport());
    }
}
