//! Per-node event dispatch.
//!
//! Each node with at least one interested job has exactly one
//! [`EventDispatcher`], attached to the transport as the node's item
//! listener. A published item is evaluated against every subscription entry
//! of every bound job; matching entries become build requests handed to the
//! [`BuildSubmitter`] without blocking the delivering thread.
//!
//! A delivery that raced a lifecycle change waits on the [`LifecycleGate`].
//! If its dispatcher was detached meanwhile, the items go to whichever
//! dispatcher serves the node now, or are dropped when none does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, info, warn};

use crate::cause::TriggerCause;
use crate::config::BatchPolicy;
use crate::connection::ConnectionManager;
use crate::error::{EvaluationError, TransportError};
use crate::scheduler::BuildSubmitter;
use crate::subscription::{JobName, SubscriptionProperties, SubscriptionRegistry};
use crate::xmpp::{ItemEventListener, ListenerId, PublishedItem};

/// Separates event dispatch (shared) from lifecycle changes (exclusive).
#[derive(Debug, Default)]
pub struct LifecycleGate {
    lock: RwLock<()>,
}

impl LifecycleGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A job's registered interest, owned by the dispatchers it is bound to.
#[derive(Debug)]
pub struct TriggerBinding {
    job: JobName,
    registry: SubscriptionRegistry,
    active: AtomicBool,
}

impl TriggerBinding {
    #[must_use]
    pub fn new(job: JobName, registry: SubscriptionRegistry) -> Self {
        Self {
            job,
            registry,
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn job(&self) -> &JobName {
        &self.job
    }

    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Cleared once the binding is removed from its dispatcher.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Dispatch counters shared by every dispatcher of a registry.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub events_received: AtomicU64,
    pub builds_submitted: AtomicU64,
    pub evaluation_failures: AtomicU64,
}

/// Runs one subscription entry against one published item.
///
/// Returns the build cause when the entry's filter matches.
///
/// # Errors
///
/// Returns the [`EvaluationError`] of the filter or of a variable.
pub fn evaluate_entry(
    node: &str,
    entry: &SubscriptionProperties,
    item: &PublishedItem,
) -> Result<Option<TriggerCause>, EvaluationError> {
    if !entry.filter().try_test(&item.payload)? {
        return Ok(None);
    }
    let variables = entry.resolve_variables(&item.payload)?;
    Ok(Some(
        TriggerCause::new(node, item.id.clone())
            .with_event(item.payload.clone())
            .with_filter(entry.filter().expression())
            .with_variables(variables),
    ))
}

type DispatcherMap = HashMap<String, Arc<EventDispatcher>>;

/// Fan-out of one node's events to the jobs bound to it.
pub struct EventDispatcher {
    node: String,
    triggers: RwLock<Vec<Arc<TriggerBinding>>>,
    listener: Mutex<Option<ListenerId>>,
    detached: AtomicBool,
    peers: Weak<Mutex<DispatcherMap>>,
    gate: Arc<LifecycleGate>,
    submitter: Arc<dyn BuildSubmitter>,
    batch_policy: BatchPolicy,
    counters: Arc<DispatchCounters>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("node", &self.node)
            .field("jobs", &self.jobs())
            .field("batch_policy", &self.batch_policy)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    fn triggers(&self) -> RwLockReadGuard<'_, Vec<Arc<TriggerBinding>>> {
        self.triggers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn triggers_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<TriggerBinding>>> {
        self.triggers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> MutexGuard<'_, Option<ListenerId>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Binds a job. Returns false if the job is already bound.
    pub fn add_trigger(&self, binding: Arc<TriggerBinding>) -> bool {
        let mut triggers = self.triggers_mut();
        if triggers.iter().any(|t| t.job() == binding.job()) {
            return false;
        }
        triggers.push(binding);
        true
    }

    /// Unbinds a job, returning the number of jobs left, or `None` if the job
    /// was not bound.
    fn remove_trigger(&self, job: &JobName) -> Option<usize> {
        let mut triggers = self.triggers_mut();
        let idx = triggers.iter().position(|t| t.job() == job)?;
        let removed = triggers.remove(idx);
        removed.deactivate();
        Some(triggers.len())
    }

    /// True once the registry dropped this dispatcher.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// The node's current dispatcher, when it is not this one.
    fn replacement(&self) -> Option<Arc<EventDispatcher>> {
        let peers = self.peers.upgrade()?;
        let live = peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.node)
            .cloned()?;
        (!std::ptr::eq(Arc::as_ptr(&live), self)).then_some(live)
    }

    #[must_use]
    pub fn trigger_count(&self) -> usize {
        self.triggers().len()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<JobName> {
        self.triggers().iter().map(|t| t.job().clone()).collect()
    }

    #[must_use]
    pub fn has_job(&self, job: &JobName) -> bool {
        self.triggers().iter().any(|t| t.job() == job)
    }

    fn dispatch_item(&self, node: &str, item: &PublishedItem, snapshot: &[Arc<TriggerBinding>]) {
        for binding in snapshot {
            for entry in binding.registry().lookup_by_node(node) {
                match evaluate_entry(node, entry, item) {
                    Ok(Some(cause)) => {
                        if !binding.is_active() {
                            debug!(node = %node, job = %binding.job(), "binding removed, skipping build");
                            continue;
                        }
                        if self.submitter.submit(binding.job(), cause) {
                            self.counters.builds_submitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {
                        debug!(
                            node = %node,
                            job = %binding.job(),
                            filter = %entry.filter(),
                            "filter did not match"
                        );
                    }
                    Err(e) => {
                        self.counters.evaluation_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            node = %node,
                            job = %binding.job(),
                            filter = %entry.filter(),
                            error = %e,
                            "evaluation failed"
                        );
                    }
                }
            }
        }
    }

    /// Dispatches a batch; the caller holds the shared gate.
    fn dispatch_locked(&self, node: &str, items: &[PublishedItem]) {
        let items = match self.batch_policy {
            BatchPolicy::FirstItem => items.get(..1).unwrap_or_default(),
            BatchPolicy::AllItems => items,
        };
        if items.is_empty() {
            debug!(node = %node, "empty notification");
            return;
        }

        let snapshot: Vec<Arc<TriggerBinding>> = self.triggers().clone();
        for item in items {
            self.dispatch_item(node, item, &snapshot);
        }
    }
}

impl ItemEventListener for EventDispatcher {
    fn handle_published_items(&self, node: &str, items: &[PublishedItem]) {
        let _gate = self.gate.shared();
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        if !self.is_detached() {
            self.dispatch_locked(node, items);
            return;
        }
        match self.replacement() {
            Some(live) => {
                debug!(node = %node, items = items.len(), "dispatcher detached, forwarding to current dispatcher");
                live.dispatch_locked(node, items);
            }
            None => debug!(node = %node, items = items.len(), "dispatcher detached, no job bound, dropping"),
        }
    }
}

/// Outcome of [`DispatcherRegistry::remove_trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRemoval {
    /// The last job left; the listener was detached and the dispatcher
    /// dropped.
    Detached,
    Remaining(usize),
    NotRegistered,
}

/// Node name to dispatcher map; at most one dispatcher per node.
pub struct DispatcherRegistry {
    connection: Arc<ConnectionManager>,
    dispatchers: Arc<Mutex<DispatcherMap>>,
    gate: Arc<LifecycleGate>,
    submitter: Arc<dyn BuildSubmitter>,
    batch_policy: BatchPolicy,
    counters: Arc<DispatchCounters>,
}

impl std::fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("nodes", &self.nodes())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl DispatcherRegistry {
    pub fn new(
        connection: Arc<ConnectionManager>,
        gate: Arc<LifecycleGate>,
        submitter: Arc<dyn BuildSubmitter>,
        batch_policy: BatchPolicy,
    ) -> Self {
        Self {
            connection,
            dispatchers: Arc::new(Mutex::new(HashMap::new())),
            gate,
            submitter,
            batch_policy,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    fn dispatchers(&self) -> MutexGuard<'_, DispatcherMap> {
        self.dispatchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_locked(
        &self,
        dispatchers: &mut DispatcherMap,
        node: &str,
    ) -> Result<Arc<EventDispatcher>, TransportError> {
        if let Some(existing) = dispatchers.get(node) {
            return Ok(Arc::clone(existing));
        }
        let dispatcher = Arc::new(EventDispatcher {
            node: node.to_string(),
            triggers: RwLock::new(Vec::new()),
            listener: Mutex::new(None),
            detached: AtomicBool::new(false),
            peers: Arc::downgrade(&self.dispatchers),
            gate: Arc::clone(&self.gate),
            submitter: Arc::clone(&self.submitter),
            batch_policy: self.batch_policy,
            counters: Arc::clone(&self.counters),
        });
        let client = self.connection.client()?;
        let id = client.add_item_listener(node, Arc::clone(&dispatcher) as Arc<dyn ItemEventListener>)?;
        *dispatcher.listener() = Some(id);
        dispatchers.insert(node.to_string(), Arc::clone(&dispatcher));
        info!(node = %node, listener = %id, "dispatcher attached");
        Ok(dispatcher)
    }

    /// Returns the node's dispatcher, creating and attaching it if needed.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the listener cannot be attached; no
    /// registry entry is left behind.
    pub fn register(&self, node: &str) -> Result<Arc<EventDispatcher>, TransportError> {
        let mut dispatchers = self.dispatchers();
        self.register_locked(&mut dispatchers, node)
    }

    /// Binds `binding` to the node's dispatcher. Returns false if the job was
    /// already bound.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the listener cannot be attached.
    pub fn register_trigger(&self, node: &str, binding: Arc<TriggerBinding>) -> Result<bool, TransportError> {
        let mut dispatchers = self.dispatchers();
        let dispatcher = self.register_locked(&mut dispatchers, node)?;
        let added = dispatcher.add_trigger(binding);
        Ok(added)
    }

    /// Unbinds `job` from the node; the last job out detaches the listener.
    pub fn remove_trigger(&self, node: &str, job: &JobName) -> TriggerRemoval {
        let mut dispatchers = self.dispatchers();
        let Some(dispatcher) = dispatchers.get(node).cloned() else {
            return TriggerRemoval::NotRegistered;
        };
        let Some(remaining) = dispatcher.remove_trigger(job) else {
            return TriggerRemoval::NotRegistered;
        };
        if remaining > 0 {
            return TriggerRemoval::Remaining(remaining);
        }

        dispatchers.remove(node);
        dispatcher.detached.store(true, Ordering::SeqCst);
        if let Some(id) = dispatcher.listener().take() {
            if !self.connection.transport().remove_item_listener(node, id) {
                warn!(node = %node, listener = %id, "listener was already detached");
            }
        }
        info!(node = %node, "dispatcher detached");
        TriggerRemoval::Detached
    }

    #[must_use]
    pub fn get(&self, node: &str) -> Option<Arc<EventDispatcher>> {
        self.dispatchers().get(node).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatchers().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatchers().is_empty()
    }

    /// Registered node names, sorted.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.dispatchers().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    #[must_use]
    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }
}
