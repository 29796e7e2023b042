//! Scheduler properties exercised through the public API only: no
//! certificates are needed since the scheduler dispatches on identity
//! and time, not on certificate content.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use stapled::error::SchedulerError;
use stapled::record::RecordId;
use stapled::scheduler::{Payload, Scheduler, DEFAULT_QUEUE_CAPACITY};

fn parse_payload(n: u8) -> Payload {
    Payload::Parse {
        record: RecordId { path: PathBuf::from(format!("/certs/{n}.pem")), content_hash: [n; 32] },
    }
}

#[test]
fn readding_same_identity_replaces_rather_than_duplicates() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();

    let far_future = Utc::now() + chrono::Duration::hours(1);
    s.add_task("parse".to_string(), far_future, "cert-a".to_string(), parse_payload(1)).unwrap();
    s.add_task(
        "parse".to_string(),
        Utc::now() - chrono::Duration::seconds(1),
        "cert-a".to_string(),
        parse_payload(2),
    )
    .unwrap();

    s.tick(Utc::now());

    let ctx = s.get_task("parse", true, Duration::from_millis(50)).expect("one delivery");
    assert_eq!(ctx.identity, "cert-a");
    assert!(matches!(ctx.payload, Payload::Parse { ref record } if record.content_hash == [2u8; 32]));
    assert!(s.get_task("parse", true, Duration::from_millis(20)).is_err(), "no duplicate delivery");
}

#[test]
fn tasks_due_at_the_same_instant_dispatch_in_scheduling_order() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();

    let when = Utc::now() - chrono::Duration::seconds(1);
    s.add_task("parse".to_string(), when, "first".to_string(), parse_payload(1)).unwrap();
    s.add_task("parse".to_string(), when, "second".to_string(), parse_payload(2)).unwrap();

    s.tick(Utc::now());

    let first = s.get_task("parse", true, Duration::from_millis(50)).unwrap();
    let second = s.get_task("parse", true, Duration::from_millis(50)).unwrap();
    assert_eq!(first.identity, "first");
    assert_eq!(second.identity, "second");
}

#[test]
fn cancel_prevents_a_pending_task_from_ever_dispatching() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();

    s.add_task(
        "parse".to_string(),
        Utc::now() - chrono::Duration::seconds(1),
        "cert-a".to_string(),
        parse_payload(1),
    )
    .unwrap();
    assert!(s.cancel_task("cert-a"));
    assert!(!s.cancel_task("cert-a"), "a second cancel finds nothing left to remove");

    s.tick(Utc::now());
    assert!(s.get_task("parse", true, Duration::from_millis(20)).is_err());
}

#[test]
fn tasks_not_yet_due_are_not_dispatched() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();

    let far_future = Utc::now() + chrono::Duration::hours(1);
    s.add_task("parse".to_string(), far_future, "cert-a".to_string(), parse_payload(1)).unwrap();

    s.tick(Utc::now());
    assert!(s.get_task("parse", true, Duration::from_millis(20)).is_err());
}

#[test]
fn get_task_on_unknown_queue_is_an_error() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();
    let err = s.get_task("renew", true, Duration::from_millis(10)).unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownQueue(_)));
}

#[test]
fn context_reschedule_moves_a_task_to_a_new_time_under_the_same_identity() {
    let s = Scheduler::new();
    s.add_queue("renew", DEFAULT_QUEUE_CAPACITY).unwrap();

    s.add_task(
        "renew".to_string(),
        Utc::now() - chrono::Duration::seconds(1),
        "cert-a".to_string(),
        parse_payload(1),
    )
    .unwrap();
    s.tick(Utc::now());
    let ctx = s.get_task("renew", true, Duration::from_millis(50)).unwrap();
    s.task_done();

    // Reschedule far into the future; it must not redeliver on the next tick.
    ctx.reschedule(Utc::now() + chrono::Duration::hours(1)).unwrap();
    s.tick(Utc::now());
    assert!(s.get_task("renew", true, Duration::from_millis(20)).is_err());

    // Reschedule back into the past; it must now redeliver.
    ctx.reschedule(Utc::now() - chrono::Duration::seconds(1)).unwrap();
    s.tick(Utc::now());
    assert!(s.get_task("renew", true, Duration::from_millis(50)).is_ok());
}

#[test]
fn outstanding_count_tracks_dequeue_and_completion() {
    let s = Scheduler::new();
    s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();
    s.add_task(
        "parse".to_string(),
        Utc::now() - chrono::Duration::seconds(1),
        "cert-a".to_string(),
        parse_payload(1),
    )
    .unwrap();
    s.tick(Utc::now());

    assert_eq!(s.outstanding(), 0);
    let _ctx = s.get_task("parse", true, Duration::from_millis(50)).unwrap();
    assert_eq!(s.outstanding(), 1);
    s.task_done();
    assert_eq!(s.outstanding(), 0);
}
