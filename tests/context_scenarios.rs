//! End-to-end scenarios against a fully wired resilience context
//!
//! Every collaborator is an in-process fake, so the scenarios exercise the
//! wiring between subsystems rather than any one of them in isolation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden::context::{ErrorEvent, ResilienceContext};
use warden::policy::{
    InMemoryHooks, LoadOutcome, ResourceDescriptor, ResourceKind, ViolationEvent,
    ViolationOutcome,
};
use warden::probe::DeviceProfile;
use warden::recovery::{RecoveryCategory, RecoveryOutcome, SkipReason};
use tokio_test::{assert_pending, assert_ready_eq};
use warden::resilience::{
    DenyReason, HealthSource, HealthStatus, LeaseOutcome, OverallHealth, Priority,
};
use warden::store::{MemoryBackend, StoreWrite};
use warden::WardenConfig;

fn desktop() -> DeviceProfile {
    DeviceProfile::from_parts(4, 8, 4, Some("desktop"))
}

fn handheld() -> DeviceProfile {
    DeviceProfile::from_parts(8, 8, 4, Some("mobile"))
}

/// Storage that is blocked for the whole session must never end in a reload
#[tokio::test(start_paused = true)]
async fn test_privacy_mode_degrades_without_reload() {
    let backend = MemoryBackend::new();
    backend.set_failing(true);
    let reloads = Arc::new(AtomicU32::new(0));
    let environment = {
        let reloads = reloads.clone();
        move || {
            reloads.fetch_add(1, Ordering::SeqCst);
        }
    };

    let context = ResilienceContext::builder(WardenConfig::default())
        .profile(desktop())
        .backend(Arc::new(backend.clone()))
        .environment(Arc::new(environment))
        .build()
        .unwrap();

    assert_eq!(
        context.store().set("session", "token", None).await,
        StoreWrite::MemoryOnly
    );
    assert_eq!(context.store().get("session").await.as_deref(), Some("token"));

    let event = ErrorEvent::new("Tracking Prevention blocked access to storage for this site");
    for _ in 0..4 {
        assert_eq!(
            context.on_error(event.clone()).await,
            Some(RecoveryOutcome::Skipped(SkipReason::BelowNoiseFloor))
        );
    }
    assert_eq!(
        context.on_error(event.clone()).await,
        Some(RecoveryOutcome::Retrying { remaining: 2 })
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(
        context.on_error(event.clone()).await,
        Some(RecoveryOutcome::Retrying { remaining: 1 })
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(
        context.on_error(event).await,
        Some(RecoveryOutcome::Escalated)
    );

    // Full recovery tolerates a single degraded subsystem
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    assert!(!context.escalator().is_reload_scheduled());
    assert_eq!(context.escalator().stats().full_recoveries, 1);

    assert_eq!(context.store().get("session").await.as_deref(), Some("token"));
    assert_eq!(
        context.store().health().status,
        HealthStatus::Degraded
    );
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_policy_violations_fall_back_then_stub() {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let loader = {
        let loads = loads.clone();
        move |resource: &ResourceDescriptor| -> warden::Result<()> {
            loads.lock().unwrap().push(resource.url.clone());
            Ok(())
        }
    };
    let hooks = Arc::new(InMemoryHooks::new());

    let context = ResilienceContext::builder(WardenConfig::default())
        .profile(desktop())
        .loader(Arc::new(loader))
        .hooks(hooks.clone())
        .build()
        .unwrap();
    context
        .policy()
        .register_fallback("https://cdn.example/chart.js", "/static/chart.js");

    let outcome = context
        .on_violation(ViolationEvent::new("https://cdn.example/chart.js", "script-src"))
        .await;
    assert_eq!(
        outcome,
        ViolationOutcome::FallbackLoaded {
            fallback_url: "/static/chart.js".to_string()
        }
    );

    let outcome = context
        .on_violation(ViolationEvent::new(
            "https://www.google-analytics.com/analytics.js",
            "script-src-elem",
        ))
        .await;
    assert!(matches!(outcome, ViolationOutcome::Stubbed { .. }));
    assert_eq!(hooks.installed().len(), 3);

    let outcome = context
        .on_violation(ViolationEvent::new("https://ads.example/pixel.js", "script-src"))
        .await;
    assert_eq!(outcome, ViolationOutcome::Recorded);

    let blocked = ResourceDescriptor::new("https://cdn.example/chart.js", ResourceKind::Script);
    assert_eq!(context.policy().load_resource(&blocked).await, LoadOutcome::Blocked);
    assert_eq!(*loads.lock().unwrap(), vec!["/static/chart.js".to_string()]);

    assert_eq!(context.policy().violations().len(), 3);
    assert_eq!(
        context.escalator().stats().categories["policy"].errors,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_handheld_pool_evicts_and_reclaims_orphans() {
    let alive: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(
        ["feed", "profile", "map"].iter().map(|s| s.to_string()).collect(),
    ));
    let liveness = {
        let alive = alive.clone();
        move |owner: &str| alive.lock().unwrap().contains(owner)
    };

    let context = ResilienceContext::builder(WardenConfig::default())
        .profile(handheld())
        .liveness(Arc::new(liveness))
        .build()
        .unwrap();
    assert_eq!(context.admission().config().max_concurrent_leases, 2);

    assert!(context
        .request_surface("feed-chart", "feed", Priority::Low)
        .await
        .is_granted());
    assert!(context
        .request_surface("profile-chart", "profile", Priority::Medium)
        .await
        .is_granted());
    assert_eq!(
        context.request_surface("map", "map", Priority::Critical).await,
        LeaseOutcome::GrantedAfterEviction {
            evicted: "feed-chart".to_string()
        }
    );

    assert!(context.start_maintenance());
    alive.lock().unwrap().remove("profile");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!context.admission().is_leased("profile-chart"));
    assert!(context.admission().is_leased("map"));

    context.stop_maintenance().await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_surfaces_wait_then_time_out() {
    let context = ResilienceContext::builder(WardenConfig::default())
        .profile(handheld())
        .build()
        .unwrap();
    context.request_surface("a", "a", Priority::Medium).await;
    context.request_surface("b", "b", Priority::Medium).await;

    let mut granted = tokio_test::task::spawn(context.request_surface("c", "c", Priority::High));
    let mut starved = tokio_test::task::spawn(context.request_surface("d", "d", Priority::Low));
    assert_pending!(granted.poll());
    assert_pending!(starved.poll());

    assert!(context.admission().release("a"));
    assert_ready_eq!(granted.poll(), LeaseOutcome::Granted);
    assert_pending!(starved.poll());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_ready_eq!(starved.poll(), LeaseOutcome::Denied(DenyReason::Timeout));
    assert_eq!(
        context.escalator().stats().categories["resource-pool"].errors,
        1
    );
}

#[tokio::test]
async fn test_regression_runs_exactly_one_full_recovery() {
    let context = ResilienceContext::builder(WardenConfig::default())
        .profile(desktop())
        .build()
        .unwrap();
    let mut changes = context.orchestrator().subscribe();

    assert_eq!(
        context.orchestrator().poll().await.overall,
        OverallHealth::Healthy
    );

    // Two failed subsystems: a locked governor and a policy monitor with
    // too many blocked resources and no fallbacks
    for _ in 0..3 {
        context.governor().activate_emergency();
    }
    for n in 0..5 {
        context
            .policy()
            .report_violation(ViolationEvent::new(
                format!("https://third-party.example/{n}.js"),
                "script-src",
            ))
            .await;
    }

    let snapshot = context.orchestrator().poll().await;
    assert_eq!(snapshot.overall, OverallHealth::Emergency);
    assert_eq!(context.orchestrator().full_recoveries_triggered(), 1);
    assert_eq!(context.escalator().stats().full_recoveries, 1);
    assert!(!context.governor().is_locked());
    assert!(context.policy().violations().is_empty());

    let snapshot = context.orchestrator().poll().await;
    assert_eq!(snapshot.overall, OverallHealth::Healthy);
    assert_eq!(context.orchestrator().full_recoveries_triggered(), 1);
    assert!(context.orchestrator().optimized_config().hardware_rendering);

    let first = changes.recv().await.unwrap();
    assert_eq!(first.current, OverallHealth::Emergency);
    let second = changes.recv().await.unwrap();
    assert_eq!(second.current, OverallHealth::Healthy);
}

#[tokio::test]
async fn test_asset_errors_sweep_caches() {
    let removed = Arc::new(Mutex::new(Vec::new()));
    let host = {
        let removed = removed.clone();
        move |url: &str| removed.lock().unwrap().push(url.to_string())
    };

    let mut config = WardenConfig::default();
    config.assets.grace_window_ms = 0;
    config.recovery.noise_threshold = 1;

    let context = ResilienceContext::builder(config)
        .profile(desktop())
        .asset_host(Arc::new(host))
        .build()
        .unwrap();
    context
        .assets()
        .register_preload("/fonts/display.woff2", 40_000, Duration::from_millis(15));

    let outcome = context
        .on_error(ErrorEvent::new(
            "The resource /fonts/display.woff2 was preloaded using link preload but not used",
        ))
        .await;
    assert_eq!(outcome, Some(RecoveryOutcome::Recovered));
    assert_eq!(*removed.lock().unwrap(), vec!["/fonts/display.woff2".to_string()]);

    let explicit = ErrorEvent::new("custom failure").with_category(RecoveryCategory::Asset);
    assert_eq!(explicit.classify(), Some(RecoveryCategory::Asset));
}

#[tokio::test]
async fn test_global_manager_constructs_once() {
    let manager = warden::lifecycle::global();
    let (a, b) = tokio::join!(
        manager.get_instance(WardenConfig::default()),
        manager.get_instance(WardenConfig::default())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(manager.construction_count(), 1);
    assert!(a.maintenance_running());

    manager.destroy_all_instances().await;
    assert!(!a.maintenance_running());
    assert!(manager.current().is_none());
}
