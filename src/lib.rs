//! # ElOyente - XMPP PubSub build triggers
//!
//! ElOyente subscribes CI jobs to XMPP PubSub nodes. Every item published on
//! a node is filtered with the XPath expression each job declared for it;
//! matching items schedule a build carrying variables extracted from the
//! item. ElBoca, the publishing side, emits build events onto nodes so other
//! CI instances can react.
//!
//! ## Core Concepts
//!
//! - **Connection**: one XMPP session shared by every job
//! - **Subscription entry**: a (node, filter, variables) declaration of a job
//! - **Dispatcher**: per-node fan-out of published items to interested jobs
//! - **Build queue**: scheduling with bounded retry, off the dispatch thread
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eloyente::{ElOyente, ElOyenteConfig, InMemoryPubSub, JobName};
//!
//! let service = InMemoryPubSub::new("xmpp.example.org");
//! let eloyente = ElOyente::new(config, Arc::new(service.session()), catalog, scheduler);
//! eloyente.initialize()?;
//! eloyente.start_job(&JobName::from("integration"), registry);
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Leaf components
pub mod error;
pub mod subscription;
pub mod xpath;

// Collaborators and configuration
pub mod config;
pub mod xmpp;

// Coordination
pub mod cause;
pub mod connection;
pub mod dispatcher;
pub mod nodes;
pub mod scheduler;
pub mod trigger;

// Publishing side
pub mod publisher;

pub use cause::TriggerCause;
pub use config::{BatchPolicy, ElOyenteConfig, XmppSettings};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{
    evaluate_entry, DispatchCounters, DispatcherRegistry, EventDispatcher, LifecycleGate, TriggerBinding,
    TriggerRemoval,
};
pub use error::{ElOyenteError, ElOyenteResult, EvaluationError, TransportError, ValidationError};
pub use nodes::{NodeOutcome, NodeSubscriptionCoordinator};
pub use publisher::{render_payload, EventPublisher, PublishRequest};
pub use scheduler::{
    schedule_with_retry, BackoffPolicy, BuildQueue, BuildScheduler, BuildSubmitter, ScheduleOutcome, Sleeper,
    ThreadSleeper,
};
pub use subscription::{JobName, JobTriggerConfig, SubscriptionProperties, SubscriptionRegistry, Variable};
pub use trigger::{ElOyente, JobCatalog, StartReport};
pub use xmpp::{InMemoryPubSub, ItemEventListener, Jid, PubSubClient, PublishedItem};
pub use xpath::XPathFilter;
