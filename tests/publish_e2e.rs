use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eloyente::{
    BuildScheduler, ConnectionManager, ElOyente, ElOyenteConfig, EventPublisher, InMemoryPubSub, JobCatalog,
    JobName, JobTriggerConfig, PublishRequest, SubscriptionRegistry, TriggerCause, XmppSettings,
};

const UPSTREAM_CONFIG: &str = r#"
connect_timeout_ms = 5000

[xmpp]
server = "ci.test"
user = "upstream"
password = "up"
"#;

const DOWNSTREAM_CONFIG: &str = r#"
connect_timeout_ms = 5000
batch_policy = "all_items"

[xmpp]
server = "ci.test"
user = "downstream"
password = "down"

[retry]
initial_delay_ms = 10
max_retries = 2
max_total_ms = 30
"#;

const DOWNSTREAM_JOB: &str = r#"
job = "integration"

[[subscriptions]]
node = "builds"
filter = "/build[@result = 'SUCCESS']"

[[subscriptions.variables]]
name = "UPSTREAM"
expression = "/build/@job"

[[subscriptions.variables]]
name = "ARTIFACTS"
expression = "//artifact"
"#;

struct FileCatalog {
    jobs: Vec<JobTriggerConfig>,
}

impl JobCatalog for FileCatalog {
    fn list_all_jobs(&self) -> Vec<JobName> {
        self.jobs.iter().map(|j| j.job.clone()).collect()
    }

    fn trigger_config(&self, job: &JobName) -> Option<SubscriptionRegistry> {
        self.jobs.iter().find(|j| &j.job == job).map(|j| j.subscriptions.clone())
    }
}

#[derive(Default)]
struct Recorder {
    builds: Mutex<Vec<(JobName, TriggerCause)>>,
}

impl BuildScheduler for Recorder {
    fn schedule_build(&self, job: &JobName, _quiet_period: Duration, cause: &TriggerCause) -> bool {
        self.builds.lock().unwrap().push((job.clone(), cause.clone()));
        true
    }

    fn is_queued(&self, _job: &JobName) -> bool {
        false
    }
}

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn wait_for_builds(recorder: &Recorder, n: usize) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if recorder.builds.lock().unwrap().len() >= n {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn service() -> InMemoryPubSub {
    let service = InMemoryPubSub::new("ci.test");
    service.add_account("upstream", "up");
    service.add_account("downstream", "down");
    service
}

fn upstream_publisher(service: &InMemoryPubSub) -> EventPublisher {
    let config = ElOyenteConfig::load(write_temp(UPSTREAM_CONFIG).path()).unwrap();
    let connection = Arc::new(ConnectionManager::new(Arc::new(service.session()), config.connect_timeout()));
    connection.open(&config.xmpp).unwrap();
    EventPublisher::new(connection, config.create_missing_nodes)
}

fn downstream(service: &InMemoryPubSub, recorder: &Arc<Recorder>) -> ElOyente {
    let config = ElOyenteConfig::load(write_temp(DOWNSTREAM_CONFIG).path()).unwrap();
    let job = JobTriggerConfig::from_toml(DOWNSTREAM_JOB).unwrap();
    ElOyente::new(
        config,
        Arc::new(service.session()),
        Arc::new(FileCatalog { jobs: vec![job] }),
        Arc::clone(recorder) as Arc<dyn BuildScheduler>,
    )
}

fn build_vars(result: &str) -> BTreeMap<String, String> {
    [("JOB_NAME", "core"), ("BUILD_RESULT", result)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn build_event() -> PublishRequest {
    PublishRequest {
        node: "builds".to_string(),
        element: "build".to_string(),
        payload: r#"<build job="$JOB_NAME" result="${BUILD_RESULT}"><artifact>core.jar</artifact></build>"#
            .to_string(),
    }
}

#[test]
fn published_build_triggers_downstream_job() {
    let service = service();
    let recorder = Arc::new(Recorder::default());
    let publisher = upstream_publisher(&service);

    // The first publication creates the node with the open default config.
    publisher.publish(&build_event(), &build_vars("FAILURE")).unwrap();
    let config = service.node_config("builds").unwrap();
    assert!(config.deliver_payloads);
    assert!(config.persist_items);

    let eloyente = downstream(&service, &recorder);
    eloyente.initialize().unwrap();
    assert_eq!(eloyente.active_jobs(), vec![JobName::from("integration")]);

    publisher.publish(&build_event(), &build_vars("FAILURE")).unwrap();
    let id = publisher.publish(&build_event(), &build_vars("SUCCESS")).unwrap();
    assert!(id.starts_with("Message_"));
    assert!(wait_for_builds(&recorder, 1));
    thread::sleep(Duration::from_millis(50));

    let builds = recorder.builds.lock().unwrap();
    assert_eq!(builds.len(), 1);
    let (job, cause) = &builds[0];
    assert_eq!(job.as_str(), "integration");
    assert_eq!(cause.node, "builds");
    assert_eq!(cause.item_id, id);
    assert_eq!(cause.filter.as_deref(), Some("/build[@result = 'SUCCESS']"));
    assert_eq!(cause.variables["UPSTREAM"], "core");
    assert_eq!(cause.variables["ARTIFACTS"], "<artifact>core.jar</artifact>");
    drop(builds);

    // Every publication persisted on the node.
    assert_eq!(service.items("builds").len(), 3);
    eloyente.shutdown();
}

#[test]
fn all_items_policy_dispatches_whole_batch() {
    let service = service();
    service.create_node("builds");
    let recorder = Arc::new(Recorder::default());
    let eloyente = downstream(&service, &recorder);
    eloyente.initialize().unwrap();

    let items = ["SUCCESS", "FAILURE", "SUCCESS"]
        .iter()
        .enumerate()
        .map(|(i, result)| {
            eloyente::PublishedItem::new(format!("item-{i}"), format!(r#"<build job="core" result="{result}"/>"#))
        })
        .collect();
    service.publish_batch("builds", items).unwrap();

    assert!(wait_for_builds(&recorder, 2));
    thread::sleep(Duration::from_millis(50));
    let mut ids: Vec<String> = recorder
        .builds
        .lock()
        .unwrap()
        .iter()
        .map(|(_, c)| c.item_id.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["item-0", "item-2"]);
    eloyente.shutdown();
}

#[test]
fn downstream_survives_bad_credentials_until_reconfigured() {
    let service = service();
    service.create_node("builds");
    let recorder = Arc::new(Recorder::default());
    let eloyente = ElOyente::new(
        ElOyenteConfig {
            xmpp: XmppSettings::new("ci.test", "downstream", "wrong"),
            ..ElOyenteConfig::default()
        },
        Arc::new(service.session()),
        Arc::new(FileCatalog {
            jobs: vec![JobTriggerConfig::from_toml(DOWNSTREAM_JOB).unwrap()],
        }),
        Arc::clone(&recorder) as Arc<dyn BuildScheduler>,
    );

    let err = eloyente.initialize().unwrap_err();
    assert!(err.is_transport());
    assert!(!eloyente.is_active());
    assert!(eloyente.active_jobs().is_empty());

    eloyente
        .reconfigure(XmppSettings::new("ci.test", "downstream", "down"))
        .unwrap();
    assert!(eloyente.is_active());

    let publisher = upstream_publisher(&service);
    publisher.publish(&build_event(), &build_vars("SUCCESS")).unwrap();
    assert!(wait_for_builds(&recorder, 1));
    eloyente.shutdown();
}
