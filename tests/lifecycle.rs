use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotbook::clock::ManualClock;
use slotbook::engine::{BatchRequest, Engine, EngineError, ErrorKind};
use slotbook::files::LocalFileStore;
use slotbook::guest::{GuestFlow, GuestRequest, GuestSettings, NoAccounts};
use slotbook::model::*;
use slotbook::notify::{ChannelNotifier, Notification, OutboxNotifier};

// ── Test infrastructure ──────────────────────────────────────

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn morning(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_time(NaiveTime::from_hms_opt(8, 0, 0).unwrap())
}

fn hour(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap()
}

struct Site {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    guests: GuestFlow,
    rx: UnboundedReceiver<Notification>,
    resource_id: Ulid,
}

async fn open_site(name: &str) -> Site {
    let dir = test_dir(name);
    let clock = Arc::new(ManualClock::new(morning(2025, 1, 1)));
    let (notifier, rx) = ChannelNotifier::new();
    let engine = Arc::new(
        Engine::new(dir.join("site.wal"), Arc::new(notifier), clock.clone()).unwrap(),
    );
    let admin = Actor::new("admin@site.org", Role::Admin);
    let resource_id = engine.create_resource(&admin, "Reading room").await.unwrap();
    engine
        .assign_manager(&admin, resource_id, "librarian@site.org")
        .await
        .unwrap();
    let guests = GuestFlow::new(
        engine.clone(),
        Arc::new(LocalFileStore::new(dir.join("files"))),
        Arc::new(NoAccounts),
        GuestSettings::default(),
    );
    Site {
        engine,
        clock,
        guests,
        rx,
        resource_id,
    }
}

async fn guest_token(rx: &mut UnboundedReceiver<Notification>) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Notification::GuestVerification(n))) => {
                return n.confirm_url.rsplit('=').next().unwrap().to_string();
            }
            Ok(Some(_)) => continue,
            _ => panic!("no guest verification arrived"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn batch_claim_approve_complete() {
    let site = open_site("full_cycle").await;
    let librarian = Actor::new("librarian@site.org", Role::Manager);
    let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();

    let outcome = assert_ok!(
        site.engine
            .create_batch(
                &librarian,
                BatchRequest {
                    resource_id: site.resource_id,
                    start_date: day,
                    end_date: day,
                    daily_start: hour(9),
                    slot_minutes: 120,
                    slots_per_day: 4,
                },
            )
            .await
    );
    assert_eq!(outcome.created, 4);

    let open = assert_ok!(site.engine.available_on(site.resource_id, day).await);
    let first = open[0].id;
    assert_ok!(
        site.engine
            .claim(first, "reader@site.org", Some("archive visit".into()), vec![])
            .await
    );
    assert_ok!(site.engine.approve(first, &librarian).await);

    site.clock.set(day.and_time(hour(18)));
    let report = assert_ok!(site.engine.run_sweep_now().await);
    assert_eq!(report.completed, 1);
    assert_eq!(report.expired_slots, 3);
    assert!(
        assert_ok!(site.engine.available_on(site.resource_id, day).await).is_empty()
    );
}

#[tokio::test]
async fn guest_token_confirms_exactly_once() {
    let mut site = open_site("guest_once").await;
    let admin = Actor::new("admin@site.org", Role::Admin);
    let day = NaiveDate::from_ymd_opt(2025, 1, 3).unwrap();
    let window = assert_ok!(
        site.engine
            .create_timeslot(&admin, site.resource_id, day, hour(10), hour(11))
            .await
    );

    assert_ok!(
        site.guests
            .request(GuestRequest {
                window_id: window.id,
                name: "Visiting Scholar".into(),
                email: "scholar@univ.edu".into(),
                purpose: None,
                answers: vec![],
                files: vec![],
            })
            .await
    );
    let token = guest_token(&mut site.rx).await;

    let claimed = assert_ok!(site.guests.confirm(&token).await);
    assert_eq!(claimed.claimant(), Some("scholar@univ.edu"));
    let err = assert_err!(site.guests.confirm(&token).await);
    assert!(matches!(err, EngineError::TokenUsed));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let windows = assert_ok!(site.engine.windows_on(site.resource_id, day).await);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].status, WindowStatus::Pending);
}

#[test]
fn store_errors_are_hidden_from_users() {
    let err = EngineError::Store("fsync: input/output error".into());
    assert!(err.is_transient());
    assert!(!err.user_message().contains("fsync"));
    let policy = EngineError::Policy("too late to cancel".into());
    assert_eq!(policy.user_message(), "not allowed: too late to cancel");
}

#[tokio::test]
async fn outbox_receives_claim_notices() {
    let dir = test_dir("outbox");
    let outbox = dir.join("outbox.jsonl");
    let clock = Arc::new(ManualClock::new(morning(2025, 1, 1)));
    let engine = Engine::new(
        dir.join("outbox.wal"),
        Arc::new(OutboxNotifier::new(outbox.clone())),
        clock,
    )
    .unwrap();
    let admin = Actor::new("admin@site.org", Role::Admin);
    let rid = assert_ok!(engine.create_resource(&admin, "Studio").await);
    assert_ok!(engine.assign_manager(&admin, rid, "lead@site.org").await);
    let day = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
    let w = assert_ok!(engine.create_timeslot(&admin, rid, day, hour(14), hour(15)).await);
    assert_ok!(engine.claim(w.id, "artist@site.org", None, vec![]).await);

    let mut lines = Vec::new();
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(&outbox) {
            lines = text.lines().map(str::to_owned).collect();
            if !lines.is_empty() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(lines.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(value["type"], "new_claim");
}
