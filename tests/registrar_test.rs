//! Tests for the integration registrar

mod common;

use common::{FakeApp, FakeTransport, Failure, StaticPackages, SUFFIX};
use flint_hub::apps::PackageEvent;
use flint_hub::discovery::{
    IntegrationRegistrar, RescanOutcome, RescanSummary, Scanner, Translator,
};
use flint_hub::provider::verbs;
use flint_hub::registry::ToolRegistry;
use flint_hub::tool::Tool;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

struct Hub {
    transport: Arc<FakeTransport>,
    packages: Arc<StaticPackages>,
    registry: ToolRegistry,
    registrar: Arc<IntegrationRegistrar>,
}

fn hub(listen: bool) -> Hub {
    let transport = FakeTransport::new();
    transport.install(
        "com.example.music",
        FakeApp::with_schema(json!({"tools": [{"name": "search"}, {"name": "play"}]})),
    );
    transport.install("com.example.notes", FakeApp::with_schema(json!({})));
    let packages = StaticPackages::new(&[
        ("com.example.music", "Music App"),
        ("com.example.notes", "Notes"),
    ]);

    let registry = ToolRegistry::new();
    let scanner = Scanner::new(packages.clone(), transport.clone(), SUFFIX);
    let registrar = Arc::new(
        IntegrationRegistrar::new(
            Arc::new(scanner),
            Translator::new(transport.clone()),
            registry.clone(),
        )
        .with_debounce(Duration::from_millis(200))
        .with_listener(listen),
    );
    Hub {
        transport,
        packages,
        registry,
        registrar,
    }
}

/// Test the initial scan registers every discovered app's tools
#[tokio::test]
async fn test_register_all() {
    let hub = hub(false);
    let outcome = hub.registrar.register_all().await;

    assert_eq!(
        outcome,
        RescanOutcome::Completed(RescanSummary { apps: 2, tools: 8 })
    );
    assert!(hub.registry.contains("music_app.search"));
    assert!(hub.registry.contains("music_app.play"));
    assert!(hub.registry.contains("notes.action"));
    assert_eq!(hub.registrar.registered_tool_names().await.len(), 8);
    assert_eq!(hub.registrar.discovered_apps().borrow().len(), 2);
    assert!(!hub.packages.is_watched());
}

/// Test rescanning an unchanged system gives the same tool set
#[tokio::test]
async fn test_rescan_is_stable() {
    let hub = hub(false);
    hub.registrar.rescan().await;
    let first = hub.registry.names();
    hub.registrar.rescan().await;
    assert_eq!(hub.registry.names(), first);
}

/// Test tools of an uninstalled app disappear on rescan
#[tokio::test]
async fn test_rescan_removes_uninstalled_app() {
    let hub = hub(false);
    hub.registrar.rescan().await;

    hub.packages.remove("com.example.music");
    hub.transport.uninstall("com.example.music");
    let outcome = hub.registrar.rescan().await;

    assert_eq!(
        outcome,
        RescanOutcome::Completed(RescanSummary { apps: 1, tools: 3 })
    );
    assert!(hub.registry.names().iter().all(|n| !n.starts_with("music_app.")));
    assert_eq!(hub.registry.count(), 3);
}

/// Test a rescan never touches tools it did not register
#[tokio::test]
async fn test_rescan_keeps_foreign_tools() {
    let hub = hub(false);
    hub.registry.register(common::EchoTool::new("device.echo"));

    hub.registrar.rescan().await;
    hub.registrar.cleanup().await;

    assert_eq!(hub.registry.names(), vec!["device.echo"]);
}

/// Test an app that starts failing loses its tools
#[tokio::test]
async fn test_failing_app_dropped_on_rescan() {
    let hub = hub(false);
    hub.registrar.rescan().await;

    hub.transport.install(
        "com.example.notes",
        FakeApp {
            fail: Some(Failure::Unavailable),
            ..FakeApp::default()
        },
    );
    hub.registrar.rescan().await;

    assert!(!hub.registry.contains("notes.get_screen"));
    assert!(hub.registry.contains("music_app.get_screen"));
}

/// Test cleanup removes the generation and stops listening
#[tokio::test]
async fn test_cleanup() {
    let hub = hub(true);
    hub.registrar.register_all().await;
    assert!(hub.packages.is_watched());

    hub.registrar.cleanup().await;

    assert_eq!(hub.registry.count(), 0);
    assert!(hub.registrar.registered_tool_names().await.is_empty());
    assert!(hub.registrar.discovered_apps().borrow().is_empty());
}

/// Test a rescan requested mid-scan runs once more and sees newer apps
#[tokio::test]
async fn test_concurrent_rescans_coalesce() {
    let hub = hub(false);
    // Hold the first scan open while the second request arrives.
    let gate = Arc::new(Semaphore::new(0));
    hub.transport.install(
        "com.example.slow",
        FakeApp {
            gate: Some(gate.clone()),
            ..FakeApp::with_schema(json!({}))
        },
    );
    hub.packages.add("com.example.slow", "Slow");

    let running = tokio::spawn({
        let registrar = hub.registrar.clone();
        async move { registrar.rescan().await }
    });
    while hub.transport.calls_to(verbs::GET_SCHEMA).len() < 3 {
        tokio::task::yield_now().await;
    }

    hub.transport.install(
        "com.example.radio",
        FakeApp::with_schema(json!({"tools": [{"name": "search"}]})),
    );
    hub.packages.add("com.example.radio", "Radio");
    assert_eq!(hub.registrar.rescan().await, RescanOutcome::Coalesced);
    gate.add_permits(10);

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("rescan did not finish")
        .unwrap();
    assert_eq!(
        outcome,
        RescanOutcome::Completed(RescanSummary { apps: 4, tools: 15 })
    );
    assert!(hub.registry.contains("radio.search"));
    assert!(hub.registry.contains("slow.get_screen"));

    let schema_calls = |package: &str| {
        hub.transport
            .calls_to(verbs::GET_SCHEMA)
            .iter()
            .filter(|c| c.authority == common::authority(package))
            .count()
    };
    assert_eq!(schema_calls("com.example.slow"), 2);
    assert_eq!(schema_calls("com.example.radio"), 1);
}

/// Test app tools never replace tools registered by someone else
#[tokio::test]
async fn test_app_tools_do_not_shadow_foreign_tools() {
    let hub = hub(false);
    hub.registry.register(common::EchoTool::new("device.tap"));
    hub.transport.install(
        "com.example.device",
        FakeApp::with_schema(json!({"tools": [{"name": "tap"}]})),
    );
    hub.packages.add("com.example.device", "Device");

    for _ in 0..2 {
        let outcome = hub.registrar.rescan().await;
        assert_eq!(
            outcome,
            RescanOutcome::Completed(RescanSummary { apps: 3, tools: 11 })
        );
        let tap = hub.registry.get("device.tap").unwrap();
        assert_eq!(tap.description(), "Echo the text parameter");
        assert!(hub.registry.contains("device.read_screen"));
    }
    assert!(!hub
        .registrar
        .registered_tool_names()
        .await
        .contains(&"device.tap".to_string()));
}

/// Test package events trigger a debounced background rescan
#[tokio::test(start_paused = true)]
async fn test_package_event_triggers_rescan() {
    let hub = hub(true);
    hub.registrar.register_all().await;
    assert!(!hub.registry.contains("radio.search"));

    hub.transport.install(
        "com.example.radio",
        FakeApp::with_schema(json!({"tools": [{"name": "search"}]})),
    );
    hub.packages.add("com.example.radio", "Radio");

    for _ in 0..3 {
        assert!(hub
            .packages
            .emit(PackageEvent::Changed("com.example.radio".to_string())));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !hub.registry.contains("radio.search") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("background rescan did not run");
    assert_eq!(hub.registrar.discovered_apps().borrow().len(), 3);

    hub.registrar.cleanup().await;
}

/// Test listener errors are survived without rescanning
#[tokio::test(start_paused = true)]
async fn test_listener_error_does_not_rescan() {
    let hub = hub(true);
    hub.registrar.register_all().await;
    let schema_calls = hub.transport.calls().len();

    assert!(hub
        .packages
        .emit(PackageEvent::Error("inotify limit".to_string())));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(hub.transport.calls().len(), schema_calls);
    hub.registrar.cleanup().await;
}
