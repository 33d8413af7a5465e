//! In-process PubSub service.
//!
//! `InMemoryPubSub` plays the XMPP server: it holds accounts, nodes, items
//! and subscriptions. Each [`InMemorySession`] is one client connection
//! implementing [`PubSubClient`]. Publishing fans items out synchronously to
//! the listeners of every authenticated session whose bare JID is subscribed
//! to the node.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::TransportError;

use super::{ItemEventListener, Jid, ListenerId, NodeConfig, PubSubClient, PublishedItem, Subscription};

#[derive(Debug)]
struct NodeState {
    config: NodeConfig,
    items: Vec<PublishedItem>,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Default)]
struct ServerState {
    accounts: HashMap<String, String>,
    nodes: BTreeMap<String, NodeState>,
}

/// Call counters, for asserting on collaborator traffic in tests.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub connects: AtomicU64,
    pub listener_attaches: AtomicU64,
    pub subscribe_calls: AtomicU64,
    pub unsubscribe_calls: AtomicU64,
    pub create_calls: AtomicU64,
    pub publish_calls: AtomicU64,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_listener_attach: AtomicBool,
    fail_discovery: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    domain: String,
    state: Mutex<ServerState>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    counters: CallCounters,
    faults: Faults,
    last_connect_timeout: Mutex<Option<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handle on an in-process PubSub service. Clones share the same service.
#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    shared: Arc<Shared>,
}

impl InMemoryPubSub {
    /// Creates a service answering for `domain`.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                domain: domain.into(),
                state: Mutex::new(ServerState::default()),
                sessions: Mutex::new(Vec::new()),
                counters: CallCounters::default(),
                faults: Faults::default(),
                last_connect_timeout: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn add_account(&self, user: impl Into<String>, password: impl Into<String>) {
        lock(&self.shared.state).accounts.insert(user.into(), password.into());
    }

    /// Opens a new, disconnected client session.
    #[must_use]
    pub fn session(&self) -> InMemorySession {
        let inner = Arc::new(SessionInner {
            shared: Arc::clone(&self.shared),
            state: Mutex::new(SessionState::default()),
            listeners: Mutex::new(HashMap::new()),
        });
        let mut sessions = lock(&self.shared.sessions);
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&inner));
        InMemorySession { inner }
    }

    /// Makes connection attempts fail as if the host were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.shared.faults.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listener_attach(&self, fail: bool) {
        self.shared.faults.fail_listener_attach.store(fail, Ordering::SeqCst);
    }

    /// Makes disco#items queries fail with an error reply.
    pub fn fail_discovery(&self, fail: bool) {
        self.shared.faults.fail_discovery.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn counters(&self) -> &CallCounters {
        &self.shared.counters
    }

    /// Timeout passed by the most recent connection attempt.
    #[must_use]
    pub fn last_connect_timeout(&self) -> Option<Duration> {
        *lock(&self.shared.last_connect_timeout)
    }

    /// Creates a node directly on the service.
    pub fn create_node(&self, node: &str) {
        lock(&self.shared.state).nodes.entry(node.to_string()).or_insert_with(|| NodeState {
            config: NodeConfig::default(),
            items: Vec::new(),
            subscriptions: Vec::new(),
        });
    }

    #[must_use]
    pub fn has_node(&self, node: &str) -> bool {
        lock(&self.shared.state).nodes.contains_key(node)
    }

    #[must_use]
    pub fn node_config(&self, node: &str) -> Option<NodeConfig> {
        lock(&self.shared.state).nodes.get(node).map(|n| n.config.clone())
    }

    #[must_use]
    pub fn items(&self, node: &str) -> Vec<PublishedItem> {
        lock(&self.shared.state)
            .nodes
            .get(node)
            .map(|n| n.items.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscriptions(&self, node: &str) -> Vec<Subscription> {
        lock(&self.shared.state)
            .nodes
            .get(node)
            .map(|n| n.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Number of listeners attached to `node` across all sessions.
    #[must_use]
    pub fn listener_count(&self, node: &str) -> usize {
        self.live_sessions()
            .iter()
            .map(|s| lock(&s.listeners).get(node).map_or(0, Vec::len))
            .sum()
    }

    /// Publishes a batch of items as one notification, as another client
    /// on the service would.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NodeNotFound`] when the node does not exist.
    pub fn publish_batch(&self, node: &str, items: Vec<PublishedItem>) -> Result<(), TransportError> {
        self.shared.counters.publish_calls.fetch_add(1, Ordering::Relaxed);
        let subscribers: Vec<String> = {
            let mut state = lock(&self.shared.state);
            let Some(entry) = state.nodes.get_mut(node) else {
                return Err(TransportError::NodeNotFound { node: node.to_string() });
            };
            if entry.config.persist_items {
                entry.items.extend(items.iter().cloned());
            }
            entry.subscriptions.iter().map(|s| s.jid.bare().to_string()).collect()
        };

        let mut targets: Vec<Arc<dyn ItemEventListener>> = Vec::new();
        for session in self.live_sessions() {
            let bound = lock(&session.state).jid.as_ref().map(|j| j.bare().to_string());
            let Some(bare) = bound else { continue };
            if !subscribers.contains(&bare) {
                continue;
            }
            if let Some(listeners) = lock(&session.listeners).get(node) {
                targets.extend(listeners.iter().map(|(_, l)| Arc::clone(l)));
            }
        }

        debug!(node = %node, items = items.len(), listeners = targets.len(), "delivering items");
        for listener in targets {
            listener.handle_published_items(node, &items);
        }
        Ok(())
    }

    /// Publishes a single item.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NodeNotFound`] when the node does not exist.
    pub fn publish(&self, node: &str, item: PublishedItem) -> Result<(), TransportError> {
        self.publish_batch(node, vec![item])
    }

    fn live_sessions(&self) -> Vec<Arc<SessionInner>> {
        lock(&self.shared.sessions).iter().filter_map(Weak::upgrade).collect()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    jid: Option<Jid>,
}

type ListenerTable = HashMap<String, Vec<(ListenerId, Arc<dyn ItemEventListener>)>>;

struct SessionInner {
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
    listeners: Mutex<ListenerTable>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner").field("state", &self.state).finish_non_exhaustive()
    }
}

/// One client connection to an [`InMemoryPubSub`].
#[derive(Debug, Clone)]
pub struct InMemorySession {
    inner: Arc<SessionInner>,
}

impl InMemorySession {
    fn service(&self) -> InMemoryPubSub {
        InMemoryPubSub {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    fn bound_jid(&self) -> Result<Jid, TransportError> {
        let state = lock(&self.inner.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.jid.clone().ok_or(TransportError::NotAuthenticated)
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.inner.shared.state)
    }
}

impl PubSubClient for InMemorySession {
    fn connect(&self, server: &str, timeout: Duration) -> Result<(), TransportError> {
        let shared = &self.inner.shared;
        shared.counters.connects.fetch_add(1, Ordering::Relaxed);
        *lock(&shared.last_connect_timeout) = Some(timeout);
        if shared.faults.unreachable.load(Ordering::SeqCst) || server != shared.domain {
            return Err(TransportError::ConnectFailed {
                server: server.to_string(),
                message: "host unreachable".to_string(),
            });
        }
        lock(&self.inner.state).connected = true;
        Ok(())
    }

    fn authenticate(&self, user: &str, password: &str, resource: &str) -> Result<Jid, TransportError> {
        if !lock(&self.inner.state).connected {
            return Err(TransportError::NotConnected);
        }
        let accepted = self.state().accounts.get(user).is_some_and(|p| p == password);
        if !accepted {
            return Err(TransportError::AuthFailed { user: user.to_string() });
        }
        let jid = Jid::from_parts(user, &self.inner.shared.domain, resource);
        lock(&self.inner.state).jid = Some(jid.clone());
        Ok(jid)
    }

    fn disconnect(&self) {
        let mut state = lock(&self.inner.state);
        state.connected = false;
        state.jid = None;
    }

    fn discover_nodes(&self) -> Result<Vec<String>, TransportError> {
        self.bound_jid()?;
        if self.inner.shared.faults.fail_discovery.load(Ordering::SeqCst) {
            return Err(TransportError::DiscoveryFailed {
                message: "service-unavailable".to_string(),
            });
        }
        Ok(self.state().nodes.keys().cloned().collect())
    }

    fn create_node(&self, node: &str, config: &NodeConfig) -> Result<(), TransportError> {
        self.bound_jid()?;
        self.inner.shared.counters.create_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if state.nodes.contains_key(node) {
            return Err(TransportError::RequestFailed {
                operation: "create_node".to_string(),
                message: format!("node '{node}' already exists"),
            });
        }
        state.nodes.insert(
            node.to_string(),
            NodeState {
                config: config.clone(),
                items: Vec::new(),
                subscriptions: Vec::new(),
            },
        );
        Ok(())
    }

    fn subscriptions(&self) -> Result<Vec<Subscription>, TransportError> {
        let jid = self.bound_jid()?;
        let state = self.state();
        Ok(state
            .nodes
            .values()
            .flat_map(|n| n.subscriptions.iter())
            .filter(|s| s.jid.bare() == jid.bare())
            .cloned()
            .collect())
    }

    fn subscribe(&self, node: &str, jid: &Jid) -> Result<Subscription, TransportError> {
        self.bound_jid()?;
        self.inner.shared.counters.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.shared.faults.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::RequestFailed {
                operation: "subscribe".to_string(),
                message: "service unavailable".to_string(),
            });
        }
        let mut state = self.state();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| TransportError::NodeNotFound { node: node.to_string() })?;
        let subscription = Subscription {
            node: node.to_string(),
            jid: jid.clone(),
            id: Uuid::new_v4().to_string(),
        };
        entry.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    fn unsubscribe(&self, node: &str, jid: &Jid, subscription_id: &str) -> Result<(), TransportError> {
        self.bound_jid()?;
        self.inner.shared.counters.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| TransportError::NodeNotFound { node: node.to_string() })?;
        let before = entry.subscriptions.len();
        entry
            .subscriptions
            .retain(|s| !(s.id == subscription_id && s.jid.bare() == jid.bare()));
        if entry.subscriptions.len() == before {
            return Err(TransportError::RequestFailed {
                operation: "unsubscribe".to_string(),
                message: format!("no subscription '{subscription_id}' on '{node}'"),
            });
        }
        Ok(())
    }

    fn publish(&self, node: &str, item: PublishedItem) -> Result<(), TransportError> {
        self.bound_jid()?;
        self.service().publish(node, item)
    }

    fn add_item_listener(
        &self,
        node: &str,
        listener: Arc<dyn ItemEventListener>,
    ) -> Result<ListenerId, TransportError> {
        self.bound_jid()?;
        if self.inner.shared.faults.fail_listener_attach.load(Ordering::SeqCst) {
            return Err(TransportError::RequestFailed {
                operation: "add_item_listener".to_string(),
                message: "node handle unavailable".to_string(),
            });
        }
        self.inner.shared.counters.listener_attaches.fetch_add(1, Ordering::Relaxed);
        let id = ListenerId::new();
        lock(&self.inner.listeners)
            .entry(node.to_string())
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    fn remove_item_listener(&self, node: &str, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(attached) = listeners.get_mut(node) else {
            return false;
        };
        let before = attached.len();
        attached.retain(|(existing, _)| *existing != id);
        let removed = attached.len() != before;
        if attached.is_empty() {
            listeners.remove(node);
        }
        removed
    }
}
