//! Event propagation between instances sharing one hub.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::state::{UiDensity, now_millis};
use tether::sync::SyncHub;
use tether::{Instance, SettingsRecord, SyncEvent, SyncEventKind, TetherConfig};

fn instance(hub: &SyncHub, id: &str) -> Instance {
    let mut config = TetherConfig::default();
    config.instance.user_id = "alice".to_owned();
    Instance::builder(config, hub)
        .instance_id(id)
        .build()
        .unwrap()
}

fn collect(instance: &Instance) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    instance
        .bus()
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn content_change_reaches_every_other_instance() {
    let hub = SyncHub::new(64);
    let a = instance(&hub, "tab-a");
    let b = instance(&hub, "tab-b");
    let c = instance(&hub, "tab-c");
    let seen_a = collect(&a);
    let seen_b = collect(&b);
    let seen_c = collect(&c);

    let sent = a.publish_content_changed("doc-42");
    assert_eq!(sent.source_instance_id, "tab-a");

    for seen in [&seen_b, &seen_c] {
        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
        let got = seen.lock().unwrap()[0].clone();
        assert_eq!(got.kind, SyncEventKind::ContentChanged);
        assert_eq!(got.entity_id.as_deref(), Some("doc-42"));
        assert_eq!(got.source_instance_id, "tab-a");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen_a.lock().unwrap().is_empty());
}

#[tokio::test]
async fn settings_change_is_merged_by_peers() {
    let hub = SyncHub::new(64);
    let a = instance(&hub, "tab-a");
    let b = instance(&hub, "tab-b");

    let written = a
        .update_settings(|s| {
            s.theme = "light".to_owned();
            s.ui_density = UiDensity::Compact;
        })
        .unwrap();

    assert!(wait_until(|| b.settings() == written).await);
    assert_eq!(b.settings().ui_density, UiDensity::Compact);
}

#[tokio::test]
async fn concurrent_settings_writes_converge() {
    let hub = SyncHub::new(64);
    let a = instance(&hub, "tab-a");
    let b = instance(&hub, "tab-b");

    let from_a = a.update_settings(|s| s.language = "fr".to_owned()).unwrap();
    let from_b = b.update_settings(|s| s.language = "es".to_owned()).unwrap();

    let winner = if (from_b.updated_at, "tab-b") > (from_a.updated_at, "tab-a") {
        from_b
    } else {
        from_a
    };
    assert!(wait_until(|| a.settings() == winner && b.settings() == winner).await);
}

#[tokio::test]
async fn local_edit_after_future_dated_peer_write_converges() {
    let hub = SyncHub::new(64);
    let a = instance(&hub, "tab-a");
    let b = instance(&hub, "tab-b");
    let skewed = hub.join_as("tab-z");

    let mut record = SettingsRecord::for_user("alice");
    record.language = "zz".to_owned();
    record.updated_at = now_millis() + 60_000;
    skewed.publish(
        SyncEvent::new(SyncEventKind::SettingsChanged)
            .with_payload(serde_json::to_value(&record).unwrap()),
    );
    assert!(wait_until(|| a.settings() == record && b.settings() == record).await);

    let edited = a.update_settings(|s| s.language = "fr".to_owned()).unwrap();
    assert!(edited.updated_at > record.updated_at);

    assert!(wait_until(|| b.settings() == edited).await);
    assert_eq!(a.settings(), b.settings());
    assert_eq!(b.settings().language, "fr");
}

#[tokio::test]
async fn left_instance_stops_receiving() {
    let hub = SyncHub::new(64);
    let a = instance(&hub, "tab-a");
    let b = instance(&hub, "tab-b");
    let seen_b = collect(&b);

    b.leave();
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.publish_content_changed("doc-1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen_b.lock().unwrap().is_empty());
}
