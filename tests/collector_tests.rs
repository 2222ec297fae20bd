//! Coordinator behavior through the callback and upload surface
//!
//! Exercises the full pipeline with stub collaborators: queueing and
//! coverage records, the pause gate, blacklisting, back-pressure, archive
//! digest completion, merge-on-upload, per-vulnerability path grouping, and
//! the at-most-once delivery contract.

mod utils;

use std::path::Path;
use std::sync::Arc;

use calltrace::archive::ArchiveAnalyzer;
use calltrace::config::CollectorConfig;
use calltrace::gate::CollectionGate;
use calltrace::loader::Loader;
use calltrace::{CallbackKind, RawFrame, TraceCoordinator, TraceOptions};
use utils::{
    app, exe, frame, method, plain_type, test_type, BrokenAnalyzer, RecordingBackend,
    StubAnalyzer, TableProvider,
};

fn with_app() -> CollectorConfig {
    CollectorConfig {
        app_context: Some(app()),
        ..CollectorConfig::default()
    }
}

fn coordinator(
    config: CollectorConfig,
    backend: Arc<RecordingBackend>,
    analyzer: Arc<dyn ArchiveAnalyzer>,
) -> TraceCoordinator {
    TraceCoordinator::new(config, Arc::new(CollectionGate::new()), backend, analyzer)
        .expect("coordinator construction")
}

/// Loader serving the types referenced by the fixture stack below.
fn shop_loader() -> Arc<Loader> {
    TableProvider::new(vec![
        plain_type("com.acme.Service", &[("handle", 5)]),
        test_type("com.acme.ShopTest", "testCheckout", 30),
        plain_type("org.runner.Core", &[("invoke", 3)]),
    ])
    .with_resource("com.acme.Vuln", Path::new("/opt/libs/acme-core.jar"))
    .into_loader("app")
}

fn shop_stack() -> Vec<RawFrame> {
    vec![
        frame("com.acme.Vuln", "sink", 42),
        frame("com.acme.Service", "handle", 8),
        frame("com.acme.ShopTest", "testCheckout", 31),
        frame("org.runner.Core", "invoke", 50),
    ]
}

#[test]
fn test_callback_queues_record_with_type_and_package_coverage() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend, Arc::new(StubAnalyzer));

    let collected = c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        None,
        None,
        None,
        None,
        TraceOptions {
            counter: 1,
            ..TraceOptions::default()
        },
    );
    assert!(collected);

    // Method record plus one coverage record each for the declaring type
    // and its package.
    assert_eq!(c.pending_usage_records(), 3);
    assert_eq!(c.statistics().methods_collected, 1);

    // Same type again: coverage records exist already.
    c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.leak()",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    );
    assert_eq!(c.pending_usage_records(), 4);
}

#[test]
fn test_paused_gate_collects_nothing() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend, Arc::new(StubAnalyzer));

    c.gate().set_paused(true);
    let collected = c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    );
    assert!(!collected);
    assert_eq!(c.pending_usage_records(), 0);

    c.gate().set_paused(false);
    assert!(c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    ));
}

#[test]
fn test_unparsable_name_is_rejected() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend, Arc::new(StubAnalyzer));

    assert!(!c.trace_callback(
        CallbackKind::Method,
        "no-parens-at-all",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    ));
    assert_eq!(c.pending_usage_records(), 0);
}

#[test]
fn test_blacklisted_archive_is_counted_but_not_queued() {
    let config = CollectorConfig {
        archive_blacklist: vec!["junit-.*\\.jar".to_string()],
        ..with_app()
    };
    let backend = RecordingBackend::new();
    let c = coordinator(config, backend, Arc::new(StubAnalyzer));

    let collected = c.trace_callback(
        CallbackKind::Method,
        "org.junit.Assert.assertTrue(boolean)",
        None,
        Some(Path::new("/repo/junit-4.12.jar")),
        None,
        None,
        TraceOptions::default(),
    );
    assert!(collected);
    assert_eq!(c.pending_usage_records(), 0);

    let stats = c.statistics();
    assert_eq!(stats.methods_blacklisted, 1);
    assert_eq!(stats.methods_collected, 0);
}

#[test]
fn test_max_items_back_pressure() {
    let config = CollectorConfig {
        max_items: Some(2),
        ..with_app()
    };
    let backend = RecordingBackend::new();
    let c = coordinator(config, backend, Arc::new(StubAnalyzer));

    c.trace_callback(
        CallbackKind::Method,
        "com.acme.A.a()",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    );
    assert_eq!(c.pending_usage_records(), 3);

    // Above the limit: discarded without a trace.
    c.trace_callback(
        CallbackKind::Method,
        "com.acme.B.b()",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    );
    assert_eq!(c.pending_usage_records(), 3);
    assert_eq!(c.statistics().methods_collected, 1);
}

#[test]
fn test_static_init_never_produces_a_path() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend, Arc::new(StubAnalyzer));
    let loader = shop_loader();

    let collected = c.trace_callback(
        CallbackKind::StaticInit,
        "com.acme.Holder",
        Some(&loader),
        None,
        None,
        None,
        TraceOptions {
            stacktrace: Some(shop_stack()),
            build_path: true,
            test_context: true,
            counter: 1,
        },
    );
    assert!(collected);
    assert_eq!(c.pending_paths(), 0);
    assert_eq!(c.statistics().static_inits_collected, 1);
}

#[test]
fn test_end_to_end_collection_and_upload() {
    let backend = RecordingBackend::with_change_list(
        "CVE-2020-0001",
        vec![method("com.acme.Vuln.sink(String)")],
    );
    let c = coordinator(with_app(), backend.clone(), Arc::new(StubAnalyzer));
    let loader = shop_loader();

    let collected = c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        Some(&loader),
        Some(Path::new("/opt/libs/acme-core.jar")),
        None,
        None,
        TraceOptions {
            stacktrace: Some(shop_stack()),
            build_path: true,
            test_context: true,
            counter: 1,
        },
    );
    assert!(collected);
    assert_eq!(c.pending_usage_records(), 3);
    assert_eq!(c.pending_paths(), 1);

    c.await_completion();
    assert_eq!(c.statistics().archives_analyzed, 1);

    c.upload_information(&exe(), None);
    assert_eq!(c.pending_usage_records(), 0);
    assert_eq!(c.pending_paths(), 0);

    // One path body, grouped under the matching vulnerability.
    let paths = backend.path_bodies();
    assert_eq!(paths.len(), 1);
    let payloads = paths[0].as_array().unwrap();
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload["bug"], "CVE-2020-0001");
    assert_eq!(payload["source"], "X2C");
    assert_eq!(payload["executionId"], "exec-1");
    let path = payload["path"].as_array().unwrap();
    assert_eq!(path.len(), 3);
    assert_eq!(
        path[0]["constructId"]["qname"],
        "com.acme.ShopTest.testCheckout()"
    );
    assert_eq!(path[2]["constructId"]["qname"], "com.acme.Vuln.sink(String)");
    // Seed had no digest at the call site; the terminal node gets it from
    // the finished archive analysis via the loader's resource mapping.
    assert_eq!(path[2]["lib"], "digest-of-acme-core.jar");

    // One usage body with the method record and both coverage records.
    let usage = backend.usage_bodies();
    assert_eq!(usage.len(), 1);
    let records = usage[0].as_array().unwrap();
    assert_eq!(records.len(), 3);
    let method_record = records
        .iter()
        .find(|r| r["constructId"]["type"] == "METH")
        .unwrap();
    assert_eq!(method_record["count"], 1);
    assert_eq!(method_record["executionId"], "exec-1");
    assert_eq!(method_record["app"]["group"], "com.acme");
    assert_eq!(method_record["lib"]["digest"], "digest-of-acme-core.jar");
    assert_eq!(method_record["lib"]["filename"], "acme-core.jar");
    assert_eq!(
        method_record["junits"][0]["qname"],
        "com.acme.ShopTest.testCheckout()"
    );
    assert!(records.iter().any(|r| r["constructId"]["type"] == "CLAS"
        && r["constructId"]["qname"] == "com.acme.Vuln"));
    assert!(records.iter().any(|r| r["constructId"]["type"] == "PACK"
        && r["constructId"]["qname"] == "com.acme"));
}

#[test]
fn test_duplicate_observations_merge_on_upload() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend.clone(), Arc::new(StubAnalyzer));

    // The call-site counter is a running total: later observations carry
    // the larger value.
    for counter in [3u32, 5] {
        c.trace_callback(
            CallbackKind::Method,
            "com.acme.Vuln.sink(String)",
            None,
            None,
            None,
            None,
            TraceOptions {
                counter,
                ..TraceOptions::default()
            },
        );
    }
    assert_eq!(c.pending_usage_records(), 4);

    c.upload_information(&exe(), None);
    let usage = backend.usage_bodies();
    assert_eq!(usage.len(), 1);
    let records = usage[0].as_array().unwrap();
    assert_eq!(records.len(), 3);
    let method_record = records
        .iter()
        .find(|r| r["constructId"]["type"] == "METH")
        .unwrap();
    assert_eq!(method_record["count"], 5);
}

#[test]
fn test_records_without_digest_are_dropped_on_upload() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend.clone(), Arc::new(BrokenAnalyzer));

    c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        None,
        Some(Path::new("/opt/libs/acme-core.jar")),
        None,
        None,
        TraceOptions::default(),
    );
    assert_eq!(c.pending_usage_records(), 3);
    c.await_completion();

    c.upload_information(&exe(), None);
    // Nothing uploadable, but the queue is drained all the same.
    assert!(backend.usage_bodies().is_empty());
    assert_eq!(c.pending_usage_records(), 0);
}

#[test]
fn test_failed_upload_is_not_retried() {
    let backend = RecordingBackend::failing();
    let c = coordinator(with_app(), backend.clone(), Arc::new(StubAnalyzer));

    c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        None,
        None,
        None,
        None,
        TraceOptions::default(),
    );
    c.upload_information(&exe(), None);
    assert_eq!(backend.usage_bodies().len(), 1);
    assert_eq!(c.pending_usage_records(), 0);

    // The failed batch is gone; a second drain finds nothing.
    c.upload_information(&exe(), None);
    assert_eq!(backend.usage_bodies().len(), 1);
}

#[test]
fn test_paths_without_matching_change_list_are_dropped() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend.clone(), Arc::new(StubAnalyzer));
    let loader = shop_loader();

    c.trace_callback(
        CallbackKind::Method,
        "com.acme.Vuln.sink(String)",
        Some(&loader),
        None,
        None,
        None,
        TraceOptions {
            stacktrace: Some(shop_stack()),
            build_path: true,
            counter: 1,
            ..TraceOptions::default()
        },
    );
    assert_eq!(c.pending_paths(), 1);

    c.upload_information(&exe(), None);
    assert!(backend.path_bodies().is_empty());
    assert_eq!(c.pending_paths(), 0);
}

#[test]
fn test_batched_upload_leaves_the_rest_queued() {
    let backend = RecordingBackend::new();
    let c = coordinator(with_app(), backend.clone(), Arc::new(StubAnalyzer));

    for qname in [
        "com.acme.A.one()",
        "com.acme.A.two()",
        "com.acme.A.three()",
    ] {
        c.trace_callback(
            CallbackKind::Method,
            qname,
            None,
            None,
            None,
            None,
            TraceOptions::default(),
        );
    }
    assert_eq!(c.pending_usage_records(), 5);

    c.upload_information(&exe(), Some(2));
    let usage = backend.usage_bodies();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].as_array().unwrap().len(), 2);
    assert_eq!(c.pending_usage_records(), 3);
}

#[test]
#[serial_test::serial]
fn test_install_publishes_the_static_callback() {
    let backend = RecordingBackend::new();
    let installed = TraceCoordinator::install(with_app(), backend, Arc::new(StubAnalyzer));
    assert!(installed.is_ok());
    assert!(TraceCoordinator::global().is_some());

    let collected = TraceCoordinator::callback(
        CallbackKind::Constructor,
        "com.acme.Vuln(String)",
        None,
        None,
        Some("cafebabe"),
        Some(app()),
        TraceOptions {
            counter: 1,
            ..TraceOptions::default()
        },
    );
    assert!(collected);
    let c = TraceCoordinator::global().unwrap();
    assert!(c.statistics().constructors_collected >= 1);

    // A second install is a no-op returning the existing coordinator.
    let backend2 = RecordingBackend::new();
    let again = TraceCoordinator::install(with_app(), backend2, Arc::new(StubAnalyzer));
    assert!(again.is_ok());
}
