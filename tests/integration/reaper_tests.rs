//! Out-of-process reaper against the fake engine.

use chrono::Utc;

use preview_sandbox::lifetime::{sweep_once, LifetimePolicy};
use preview_sandbox::reaper::Reaper;
use preview_sandbox::registry::ProjectKind;

use super::test_helpers::{harness, FakeRuntime};

#[tokio::test]
async fn overdue_environments_and_orphaned_volumes_are_removed() {
    let fake = FakeRuntime::new();
    let now = Utc::now();
    let old = fake.insert_environment("old", now - chrono::Duration::minutes(45));
    let fresh = fake.insert_environment("fresh", now - chrono::Duration::minutes(5));
    fake.insert_volume("fake-vol-leftover");

    let reaper = Reaper::new(fake.clone(), LifetimePolicy::default());
    let report = reaper.run_once(now).await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.removed, vec![old.clone()]);
    assert_eq!(report.orphaned_volumes, vec!["fake-vol-leftover".to_string()]);
    assert_eq!(report.failures, 0);
    assert!(!fake.has_environment(&old));
    assert!(fake.has_environment(&fresh));
    assert_eq!(fake.volumes(), vec!["fake-vol-fresh".to_string()]);
}

#[tokio::test]
async fn boundary_age_is_not_overdue() {
    let fake = FakeRuntime::new();
    let now = Utc::now();
    fake.insert_environment("edge", now - chrono::Duration::minutes(40));

    let reaper = Reaper::new(fake.clone(), LifetimePolicy::default());
    let report = reaper.run_once(now).await.unwrap();
    assert!(report.removed.is_empty());
}

#[tokio::test]
async fn unreachable_engine_fails_the_pass() {
    let fake = FakeRuntime::new();
    fake.set_unreachable(true);
    let reaper = Reaper::new(fake.clone(), LifetimePolicy::default());
    assert!(reaper.run_once(Utc::now()).await.is_err());
}

#[tokio::test]
async fn sweep_forgets_sessions_removed_by_the_reaper() {
    let h = harness(LifetimePolicy::default());
    h.provisioner
        .create(Some("reaped"), ProjectKind::Node)
        .await
        .unwrap();

    // The reaper runs in another process with its own view of time.
    let reaper = Reaper::new(h.fake.clone(), LifetimePolicy::default());
    let report = reaper
        .run_once(Utc::now() + chrono::Duration::minutes(41))
        .await
        .unwrap();
    assert_eq!(report.removed.len(), 1);

    let report = sweep_once(&h.provisioner, Utc::now()).await;
    assert_eq!(report.vanished, vec!["reaped"]);
    assert!(h.provisioner.registry().is_empty().await);
}
