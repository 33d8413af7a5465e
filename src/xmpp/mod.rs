//! XMPP PubSub collaborator interfaces.
//!
//! The service never speaks the XMPP wire protocol itself. Everything it
//! needs from the server is expressed by [`PubSubClient`], and inbound item
//! notifications arrive through [`ItemEventListener`]. An in-process
//! implementation is provided in [`memory`].

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

pub use memory::{InMemoryPubSub, InMemorySession};

/// A Jabber ID: `user@domain` with an optional `/resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    #[must_use]
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    /// Builds `user@domain/resource`; a `user` that already carries a domain
    /// keeps it.
    #[must_use]
    pub fn from_parts(user: &str, domain: &str, resource: &str) -> Self {
        let bare = if user.contains('@') {
            user.to_string()
        } else {
            format!("{user}@{domain}")
        };
        if resource.is_empty() {
            Self(bare)
        } else {
            Self(format!("{bare}/{resource}"))
        }
    }

    /// The JID without its resource part.
    #[must_use]
    pub fn bare(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(bare, _)| bare)
    }

    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    #[must_use]
    pub fn to_bare(&self) -> Self {
        Self(self.bare().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One item carried by a PubSub publish notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedItem {
    pub id: String,
    /// The item's XML payload.
    pub payload: String,
}

impl PublishedItem {
    #[must_use]
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// A server-side node subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub node: String,
    pub jid: Jid,
    pub id: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessModel {
    Open,
    Presence,
    Roster,
    Authorize,
    Whitelist,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishModel {
    Open,
    Publishers,
    Subscribers,
}

/// Configuration submitted when a node is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub access_model: AccessModel,
    pub deliver_payloads: bool,
    pub notify_retract: bool,
    pub subscribe: bool,
    pub persist_items: bool,
    pub publish_model: PublishModel,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            access_model: AccessModel::Open,
            deliver_payloads: true,
            notify_retract: true,
            subscribe: true,
            persist_items: true,
            publish_model: PublishModel::Open,
        }
    }
}

/// Handle of an attached item listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives item-publish notifications for a node.
///
/// Called on transport I/O threads; implementations must not block for long.
pub trait ItemEventListener: Send + Sync {
    fn handle_published_items(&self, node: &str, items: &[PublishedItem]);
}

/// One authenticated session with an XMPP PubSub service.
///
/// Listener registration is in-process bookkeeping and must not perform
/// network round-trips; every other call may.
pub trait PubSubClient: Send + Sync {
    fn connect(&self, server: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Returns the full JID bound for this session.
    fn authenticate(&self, user: &str, password: &str, resource: &str) -> Result<Jid, TransportError>;

    fn disconnect(&self);

    /// Names of every node known to the service.
    fn discover_nodes(&self) -> Result<Vec<String>, TransportError>;

    fn create_node(&self, node: &str, config: &NodeConfig) -> Result<(), TransportError>;

    /// Subscriptions held by this session's bare JID.
    fn subscriptions(&self) -> Result<Vec<Subscription>, TransportError>;

    fn subscribe(&self, node: &str, jid: &Jid) -> Result<Subscription, TransportError>;

    fn unsubscribe(&self, node: &str, jid: &Jid, subscription_id: &str) -> Result<(), TransportError>;

    fn publish(&self, node: &str, item: PublishedItem) -> Result<(), TransportError>;

    fn add_item_listener(
        &self,
        node: &str,
        listener: Arc<dyn ItemEventListener>,
    ) -> Result<ListenerId, TransportError>;

    /// Returns false when no such listener was attached.
    fn remove_item_listener(&self, node: &str, id: ListenerId) -> bool;
}
