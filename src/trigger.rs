//! The ElOyente service: job trigger lifecycle over the shared connection.
//!
//! Starting a job subscribes the shared session to each node the job
//! declares and binds the job to the node's dispatcher. Stopping it unbinds
//! the job and drops the server subscription once no job is left on the
//! node. Lifecycle operations run under the exclusive side of the
//! [`LifecycleGate`], so dispatch never observes a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::config::{ElOyenteConfig, XmppSettings};
use crate::connection::ConnectionManager;
use crate::dispatcher::{
    DispatchCounters, DispatcherRegistry, EventDispatcher, LifecycleGate, TriggerBinding, TriggerRemoval,
};
use crate::error::ElOyenteResult;
use crate::nodes::{NodeOutcome, NodeSubscriptionCoordinator};
use crate::scheduler::{BuildQueue, BuildQueueConfig, BuildScheduler, BuildSubmitter, Sleeper, ThreadSleeper};
use crate::subscription::{JobName, SubscriptionRegistry};
use crate::xmpp::PubSubClient;

/// The CI system's job model.
pub trait JobCatalog: Send + Sync {
    fn list_all_jobs(&self) -> Vec<JobName>;

    /// The job's trigger declaration, or `None` if the job has no XMPP
    /// trigger.
    fn trigger_config(&self, job: &JobName) -> Option<SubscriptionRegistry>;
}

/// Per-node result of [`ElOyente::start_job`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Nodes the job is now bound to.
    pub bound: Vec<String>,
    /// Nodes that do not exist and were not created.
    pub skipped: Vec<String>,
    /// Nodes that failed, with the error.
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.bound.is_empty()
    }
}

#[derive(Debug)]
struct StartedJob {
    nodes: Vec<String>,
}

/// Coordinates job triggers, node subscriptions and dispatch.
pub struct ElOyente {
    settings: Mutex<XmppSettings>,
    gate: Arc<LifecycleGate>,
    connection: Arc<ConnectionManager>,
    nodes: NodeSubscriptionCoordinator,
    dispatchers: DispatcherRegistry,
    catalog: Arc<dyn JobCatalog>,
    builds: Arc<BuildQueue>,
    started: Mutex<HashMap<JobName, StartedJob>>,
}

impl std::fmt::Debug for ElOyente {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElOyente")
            .field("settings", &*self.settings())
            .field("connection", &self.connection)
            .field("dispatchers", &self.dispatchers)
            .finish_non_exhaustive()
    }
}

impl ElOyente {
    pub fn new(
        config: ElOyenteConfig,
        client: Arc<dyn PubSubClient>,
        catalog: Arc<dyn JobCatalog>,
        scheduler: Arc<dyn BuildScheduler>,
    ) -> Self {
        Self::with_sleeper(config, client, catalog, scheduler, Arc::new(ThreadSleeper))
    }

    /// Like [`new`](Self::new) with a custom sleeper for retry backoff.
    pub fn with_sleeper(
        config: ElOyenteConfig,
        client: Arc<dyn PubSubClient>,
        catalog: Arc<dyn JobCatalog>,
        scheduler: Arc<dyn BuildScheduler>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let gate = Arc::new(LifecycleGate::new());
        let connection = Arc::new(ConnectionManager::new(client, config.connect_timeout()));
        let builds = Arc::new(BuildQueue::new(
            BuildQueueConfig {
                workers: config.build_queue.workers,
                capacity: config.build_queue.capacity,
                backoff: config.retry.to_policy(),
            },
            scheduler,
            sleeper,
        ));
        let nodes = NodeSubscriptionCoordinator::new(Arc::clone(&connection), config.create_missing_nodes);
        let dispatchers = DispatcherRegistry::new(
            Arc::clone(&connection),
            Arc::clone(&gate),
            Arc::clone(&builds) as Arc<dyn BuildSubmitter>,
            config.batch_policy,
        );
        Self {
            settings: Mutex::new(config.xmpp),
            gate,
            connection,
            nodes,
            dispatchers,
            catalog,
            builds,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self) -> MutexGuard<'_, XmppSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn started(&self) -> MutexGuard<'_, HashMap<JobName, StartedJob>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the connection with the current settings and starts every job
    /// of the catalog.
    ///
    /// # Errors
    ///
    /// Returns the connection error; the service then stays inactive until
    /// the next [`reconfigure`](Self::reconfigure).
    pub fn initialize(&self) -> ElOyenteResult<()> {
        let _gate = self.gate.exclusive();
        self.open_locked()?;
        self.start_all_locked();
        Ok(())
    }

    /// Starts (or restarts) `job` with `registry`.
    pub fn start_job(&self, job: &JobName, registry: SubscriptionRegistry) -> StartReport {
        let _gate = self.gate.exclusive();
        self.start_job_locked(job, registry)
    }

    /// Stops `job`. Returns false if it was not started.
    pub fn stop_job(&self, job: &JobName) -> bool {
        let _gate = self.gate.exclusive();
        self.stop_job_locked(job)
    }

    /// Replaces the connection settings: stops every job, reconnects with
    /// `settings` and starts every job again, as one critical section.
    ///
    /// # Errors
    ///
    /// Returns the connection error; jobs then stay stopped.
    pub fn reconfigure(&self, settings: XmppSettings) -> ElOyenteResult<()> {
        let _gate = self.gate.exclusive();
        info!(settings = ?settings, "reconfiguring");
        self.stop_all_locked();
        self.connection.disconnect();
        *self.settings() = settings;
        self.open_locked()?;
        self.start_all_locked();
        Ok(())
    }

    /// Stops every job, disconnects and stops the build workers.
    pub fn shutdown(&self) {
        {
            let _gate = self.gate.exclusive();
            self.stop_all_locked();
            self.connection.disconnect();
        }
        self.builds.shutdown();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.connection.is_authenticated()
    }

    /// Started jobs, sorted.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobName> {
        let mut jobs: Vec<JobName> = self.started().keys().cloned().collect();
        jobs.sort();
        jobs
    }

    #[must_use]
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    #[must_use]
    pub fn dispatcher(&self, node: &str) -> Option<Arc<EventDispatcher>> {
        self.dispatchers.get(node)
    }

    #[must_use]
    pub fn settings_snapshot(&self) -> XmppSettings {
        self.settings().clone()
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    #[must_use]
    pub fn dispatch_counters(&self) -> &DispatchCounters {
        self.dispatchers.counters()
    }

    #[must_use]
    pub fn build_queue(&self) -> &BuildQueue {
        &self.builds
    }

    fn open_locked(&self) -> ElOyenteResult<()> {
        let settings = self.settings().clone();
        match self.connection.open(&settings) {
            Ok(jid) => {
                info!(jid = %jid, "service active");
                Ok(())
            }
            Err(e) => {
                error!(
                    server = %settings.server,
                    user = %settings.user,
                    error = %e,
                    retryable = e.is_retryable(),
                    "service inactive"
                );
                Err(e)
            }
        }
    }

    fn start_all_locked(&self) {
        for job in self.catalog.list_all_jobs() {
            match self.catalog.trigger_config(&job) {
                Some(registry) => {
                    self.start_job_locked(&job, registry);
                }
                None => debug!(job = %job, "job has no trigger"),
            }
        }
    }

    fn stop_all_locked(&self) {
        let jobs: Vec<JobName> = self.started().keys().cloned().collect();
        for job in jobs {
            self.stop_job_locked(&job);
        }
    }

    fn start_job_locked(&self, job: &JobName, registry: SubscriptionRegistry) -> StartReport {
        if self.started().contains_key(job) {
            debug!(job = %job, "restarting");
            self.stop_job_locked(job);
        }
        self.builds.resume(job);

        let mut report = StartReport::default();
        if !self.connection.is_authenticated() {
            warn!(job = %job, "not connected, trigger inactive");
            return report;
        }

        let nodes: Vec<String> = registry.nodes().into_iter().map(str::to_string).collect();
        let binding = Arc::new(TriggerBinding::new(job.clone(), registry));
        for node in nodes {
            let outcome = match self.nodes.subscribe_if_necessary(&node) {
                Ok(NodeOutcome::Missing) => {
                    report.skipped.push(node);
                    continue;
                }
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(job = %job, node = %node, error = %e, "subscription failed");
                    report.failed.push((node, e.to_string()));
                    continue;
                }
            };

            match self.dispatchers.register_trigger(&node, Arc::clone(&binding)) {
                Ok(_) => {
                    debug!(job = %job, node = %node, "trigger bound");
                    report.bound.push(node);
                }
                Err(e) => {
                    warn!(job = %job, node = %node, error = %e, "listener registration failed");
                    if outcome == NodeOutcome::Subscribed && self.dispatchers.get(&node).is_none() {
                        if let Err(e) = self.nodes.unsubscribe(&node) {
                            warn!(node = %node, error = %e, "rollback unsubscribe failed");
                        }
                    }
                    report.failed.push((node, e.to_string()));
                }
            }
        }

        if report.is_active() {
            self.started().insert(
                job.clone(),
                StartedJob {
                    nodes: report.bound.clone(),
                },
            );
            info!(job = %job, nodes = ?report.bound, "job started");
        }
        report
    }

    fn stop_job_locked(&self, job: &JobName) -> bool {
        self.builds.cancel(job);
        let Some(started) = self.started().remove(job) else {
            debug!(job = %job, "job not started");
            return false;
        };
        for node in started.nodes {
            match self.dispatchers.remove_trigger(&node, job) {
                TriggerRemoval::Detached => {
                    if let Err(e) = self.nodes.unsubscribe(&node) {
                        warn!(node = %node, error = %e, "unsubscribe failed");
                    }
                }
                TriggerRemoval::Remaining(n) => debug!(node = %node, remaining = n, "node still in use"),
                TriggerRemoval::NotRegistered => debug!(job = %job, node = %node, "job was not bound"),
            }
        }
        info!(job = %job, "job stopped");
        true
    }
}
