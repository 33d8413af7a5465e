//! Server-side node subscriptions.
//!
//! The shared session holds at most one subscription per (node, bare JID).
//! Subscribing is check-then-act against the server's subscription list.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{ElOyenteResult, TransportError, ValidationError};
use crate::xmpp::{Jid, NodeConfig, PubSubClient};

/// Result of [`NodeSubscriptionCoordinator::subscribe_if_necessary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// A new subscription was created.
    Subscribed,
    AlreadySubscribed,
    /// The node does not exist and node creation is disabled.
    Missing,
}

#[derive(Debug)]
pub struct NodeSubscriptionCoordinator {
    connection: Arc<ConnectionManager>,
    create_missing_nodes: bool,
    node_config: NodeConfig,
}

impl NodeSubscriptionCoordinator {
    pub fn new(connection: Arc<ConnectionManager>, create_missing_nodes: bool) -> Self {
        Self {
            connection,
            create_missing_nodes,
            node_config: NodeConfig::default(),
        }
    }

    fn session(&self) -> Result<(Arc<dyn PubSubClient>, Jid), TransportError> {
        let client = self.connection.client()?;
        let jid = self.connection.bare_jid().ok_or(TransportError::NotAuthenticated)?;
        Ok((client, jid))
    }

    /// Discovery query only.
    ///
    /// # Errors
    ///
    /// Returns the transport error when discovery fails.
    pub fn node_exists(&self, node: &str) -> Result<bool, TransportError> {
        let client = self.connection.client()?;
        Ok(client.discover_nodes()?.iter().any(|n| n == node))
    }

    /// Creates `node` with the default configuration when it is absent.
    ///
    /// # Errors
    ///
    /// Returns the transport error of discovery or creation.
    pub fn ensure_node_exists(&self, node: &str) -> Result<(), TransportError> {
        if self.node_exists(node)? {
            return Ok(());
        }
        let client = self.connection.client()?;
        client.create_node(node, &self.node_config)?;
        info!(node = %node, "created node");
        Ok(())
    }

    /// True if the bare JID already holds a subscription on `node`.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the subscription list is unavailable.
    pub fn is_subscribed(&self, node: &str, jid: &Jid) -> Result<bool, TransportError> {
        let client = self.connection.client()?;
        Ok(client
            .subscriptions()?
            .iter()
            .any(|s| s.node == node && s.jid.bare() == jid.bare()))
    }

    /// Makes sure this session is subscribed to `node` exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyNodeName`] for a blank node, or the
    /// transport error of the failing step.
    pub fn subscribe_if_necessary(&self, node: &str) -> ElOyenteResult<NodeOutcome> {
        if node.trim().is_empty() {
            return Err(ValidationError::EmptyNodeName.into());
        }
        let (client, jid) = self.session()?;

        if self.create_missing_nodes {
            self.ensure_node_exists(node)?;
        } else if !self.node_exists(node)? {
            warn!(node = %node, "node does not exist, skipping subscription");
            return Ok(NodeOutcome::Missing);
        }

        if self.is_subscribed(node, &jid)? {
            debug!(node = %node, jid = %jid, "already subscribed");
            return Ok(NodeOutcome::AlreadySubscribed);
        }
        let subscription = client.subscribe(node, &jid)?;
        info!(node = %node, jid = %jid, subscription = %subscription.id, "subscribed");
        Ok(NodeOutcome::Subscribed)
    }

    /// Removes this session's subscription to `node`.
    ///
    /// A missing subscription is logged and treated as success.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the server rejects the request.
    pub fn unsubscribe(&self, node: &str) -> Result<(), TransportError> {
        let (client, jid) = self.session()?;
        let existing: Vec<_> = client
            .subscriptions()?
            .into_iter()
            .filter(|s| s.node == node && s.jid.bare() == jid.bare())
            .collect();
        if existing.is_empty() {
            warn!(node = %node, jid = %jid, "no subscription to remove");
            return Ok(());
        }
        for subscription in existing {
            client.unsubscribe(node, &subscription.jid, &subscription.id)?;
            info!(node = %node, jid = %jid, subscription = %subscription.id, "unsubscribed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::config::XmppSettings;
    use crate::xmpp::InMemoryPubSub;

    fn setup(create_missing_nodes: bool) -> (InMemoryPubSub, NodeSubscriptionCoordinator) {
        let service = InMemoryPubSub::new("xmpp.test");
        service.add_account("ci", "pw");
        let connection = Arc::new(ConnectionManager::new(Arc::new(service.session()), Duration::from_secs(1)));
        connection.open(&XmppSettings::new("xmpp.test", "ci", "pw")).unwrap();
        (service, NodeSubscriptionCoordinator::new(connection, create_missing_nodes))
    }

    #[test]
    fn redundant_subscribes_create_one_subscription() {
        let (service, nodes) = setup(true);
        assert_eq!(nodes.subscribe_if_necessary("builds").unwrap(), NodeOutcome::Subscribed);
        assert_eq!(nodes.subscribe_if_necessary("builds").unwrap(), NodeOutcome::AlreadySubscribed);
        assert_eq!(nodes.subscribe_if_necessary("builds").unwrap(), NodeOutcome::AlreadySubscribed);
        assert_eq!(service.subscriptions("builds").len(), 1);
        assert_eq!(service.counters().subscribe_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_nodes_are_created_with_default_config() {
        let (service, nodes) = setup(true);
        assert!(!nodes.node_exists("fresh").unwrap());
        nodes.ensure_node_exists("fresh").unwrap();
        nodes.ensure_node_exists("fresh").unwrap();
        assert_eq!(service.node_config("fresh"), Some(NodeConfig::default()));
        assert_eq!(service.counters().create_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_nodes_are_skipped_when_creation_is_disabled() {
        let (service, nodes) = setup(false);
        assert_eq!(nodes.subscribe_if_necessary("absent").unwrap(), NodeOutcome::Missing);
        assert!(!service.has_node("absent"));
    }

    #[test]
    fn empty_node_is_rejected() {
        let (_service, nodes) = setup(true);
        assert!(nodes.subscribe_if_necessary("").unwrap_err().is_validation());
    }

    #[test]
    fn unsubscribe_removes_the_subscription() {
        let (service, nodes) = setup(true);
        nodes.subscribe_if_necessary("builds").unwrap();
        nodes.unsubscribe("builds").unwrap();
        assert!(service.subscriptions("builds").is_empty());
        nodes.unsubscribe("builds").unwrap();
    }

    #[test]
    fn discovery_failure_leaves_node_unsubscribed() {
        let (service, nodes) = setup(true);
        service.fail_discovery(true);
        let err = nodes.subscribe_if_necessary("builds").unwrap_err();
        assert!(matches!(
            err,
            crate::error::ElOyenteError::Transport(TransportError::DiscoveryFailed { .. })
        ));
        assert!(err.is_retryable());
        assert!(!service.has_node("builds"));
        assert_eq!(service.counters().subscribe_calls.load(Ordering::Relaxed), 0);

        service.fail_discovery(false);
        assert_eq!(nodes.subscribe_if_necessary("builds").unwrap(), NodeOutcome::Subscribed);
    }

    #[test]
    fn requires_authentication() {
        let service = InMemoryPubSub::new("xmpp.test");
        let connection = Arc::new(ConnectionManager::new(Arc::new(service.session()), Duration::from_secs(1)));
        let nodes = NodeSubscriptionCoordinator::new(connection, true);
        assert!(nodes.subscribe_if_necessary("builds").unwrap_err().is_transport());
    }
}
