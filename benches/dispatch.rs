use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use eloyente::{
    BuildScheduler, ElOyente, ElOyenteConfig, InMemoryPubSub, JobCatalog, JobName, PublishedItem,
    SubscriptionProperties, SubscriptionRegistry, TriggerCause, XPathFilter, XmppSettings,
};

const EVENT: &str = r#"<build xmlns="urn:ci" job="core" result="SUCCESS"><changes><change author="ana">fix parser</change><change author="luis">bump deps</change></changes><artifact>core.jar</artifact><artifact>api.jar</artifact></build>"#;

struct NoJobs;

impl JobCatalog for NoJobs {
    fn list_all_jobs(&self) -> Vec<JobName> {
        Vec::new()
    }

    fn trigger_config(&self, _job: &JobName) -> Option<SubscriptionRegistry> {
        None
    }
}

struct Discard;

impl BuildScheduler for Discard {
    fn schedule_build(&self, _job: &JobName, _quiet_period: Duration, _cause: &TriggerCause) -> bool {
        true
    }

    fn is_queued(&self, _job: &JobName) -> bool {
        false
    }
}

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    group.throughput(Throughput::Elements(1));

    let cases = [
        ("identity", ""),
        ("root", "/build"),
        ("predicate", "/build[@result = 'SUCCESS']"),
        ("descendant", "//change[contains(., 'parser')]"),
        ("count", "count(//artifact) > 1"),
    ];
    for (name, expression) in cases {
        let filter = XPathFilter::compile(expression).unwrap();
        group.bench_function(format!("test/{name}"), |b| b.iter(|| filter.test(EVENT)));
    }

    let all = XPathFilter::compile("//artifact").unwrap();
    group.bench_function("evaluate/multi_match", |b| b.iter(|| all.evaluate(EVENT)));
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("filter/compile", |b| {
        b.iter(|| XPathFilter::compile("/build[@result = 'SUCCESS' and count(artifact) > 1]/changes/change[last()]"))
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    group.throughput(Throughput::Elements(1));

    for jobs in [1usize, 16, 64] {
        group.bench_function(format!("publish/{jobs}_jobs"), |b| {
            // Fresh service per sample; setup excluded from timing.
            b.iter_custom(|iters| {
                let service = InMemoryPubSub::new("bench.test");
                service.add_account("ci", "pw");
                let eloyente = ElOyente::new(
                    ElOyenteConfig {
                        xmpp: XmppSettings::new("bench.test", "ci", "pw"),
                        ..ElOyenteConfig::default()
                    },
                    Arc::new(service.session()),
                    Arc::new(NoJobs),
                    Arc::new(Discard),
                );
                eloyente.initialize().unwrap();
                for i in 0..jobs {
                    let filter = if i % 2 == 0 { "/build[@result = 'SUCCESS']" } else { "//change[@author = 'ana']" };
                    let registry: SubscriptionRegistry =
                        std::iter::once(SubscriptionProperties::with_filter("builds", filter).unwrap()).collect();
                    eloyente.start_job(&JobName::new(format!("job-{i}")), registry);
                }

                let item = PublishedItem::new("bench", EVENT);
                let start = Instant::now();
                for _ in 0..iters {
                    service.publish("builds", item.clone()).unwrap();
                }
                let elapsed = start.elapsed();
                eloyente.shutdown();
                elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(dispatch, bench_filters, bench_compile, bench_fan_out);
criterion_main!(dispatch);
