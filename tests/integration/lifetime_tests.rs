//! Registry sweep: expiry, reconciliation with the runtime, idling.

use std::time::Duration;

use chrono::Utc;

use preview_sandbox::lifetime::{sweep_once, LifetimePolicy};
use preview_sandbox::registry::{ProjectKind, SessionStatus};

use super::test_helpers::harness;

#[tokio::test]
async fn sweep_destroys_expired_sessions() {
    let h = harness(LifetimePolicy::default());
    h.provisioner
        .create(Some("old-session"), ProjectKind::Node)
        .await
        .unwrap();
    h.provisioner
        .create(Some("new-session"), ProjectKind::Node)
        .await
        .unwrap();

    let later = Utc::now() + chrono::Duration::minutes(31);
    let report = sweep_once(&h.provisioner, later).await;

    let mut expired = report.expired.clone();
    expired.sort();
    assert_eq!(expired, vec!["new-session", "old-session"]);
    assert!(h.provisioner.registry().is_empty().await);
    assert_eq!(h.fake.environment_count(), 0);
}

#[tokio::test]
async fn extended_session_survives_until_grace_runs_out() {
    let h = harness(LifetimePolicy::default());
    h.provisioner
        .create(Some("extended"), ProjectKind::Node)
        .await
        .unwrap();
    assert!(h.provisioner.extend_lifetime("extended").await);

    let report = sweep_once(&h.provisioner, Utc::now() + chrono::Duration::minutes(35)).await;
    assert!(report.expired.is_empty());
    assert!(h.provisioner.registry().get("extended").await.is_some());

    let report = sweep_once(&h.provisioner, Utc::now() + chrono::Duration::minutes(41)).await;
    assert_eq!(report.expired, vec!["extended"]);
}

#[tokio::test]
async fn sweep_purges_sessions_whose_environment_vanished() {
    let h = harness(LifetimePolicy::default());
    let provisioned = h
        .provisioner
        .create(Some("orphan"), ProjectKind::Node)
        .await
        .unwrap();
    h.fake.vanish(provisioned.environment_id.name());

    let report = sweep_once(&h.provisioner, Utc::now()).await;
    assert_eq!(report.vanished, vec!["orphan"]);
    assert!(h.provisioner.registry().get("orphan").await.is_none());
}

#[tokio::test]
async fn untouched_sessions_go_idle_and_wake_on_access() {
    let policy = LifetimePolicy {
        idle_after: Duration::from_secs(60),
        ..LifetimePolicy::default()
    };
    let h = harness(policy);
    h.provisioner
        .create(Some("sleepy"), ProjectKind::Node)
        .await
        .unwrap();

    let report = sweep_once(&h.provisioner, Utc::now() + chrono::Duration::minutes(2)).await;
    assert_eq!(report.idled, 1);
    let session = h.provisioner.registry().get("sleepy").await.unwrap();
    assert_eq!(session.status, SessionStatus::Idle);

    let session = h.provisioner.live_session("sleepy").await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
}

#[tokio::test]
async fn sweep_tolerates_an_unreachable_runtime() {
    let h = harness(LifetimePolicy::default());
    h.provisioner
        .create(Some("steady"), ProjectKind::Node)
        .await
        .unwrap();
    h.fake.set_unreachable(true);

    let report = sweep_once(&h.provisioner, Utc::now()).await;
    assert!(report.vanished.is_empty());
    assert!(h.provisioner.registry().get("steady").await.is_some());
}
