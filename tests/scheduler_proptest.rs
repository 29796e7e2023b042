//! Property-based coverage of the scheduler's FIFO-within-a-slot and
//! identity-dedup invariants (testable properties 1 and 3), over
//! randomly generated identity sequences rather than hand-picked
//! fixtures.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use stapled::record::RecordId;
use stapled::scheduler::{Payload, Scheduler, DEFAULT_QUEUE_CAPACITY};

fn payload_for(n: u8) -> Payload {
    Payload::Parse {
        record: RecordId { path: PathBuf::from(format!("/certs/{n}.pem")), content_hash: [n; 32] },
    }
}

proptest! {
    /// Scheduling N distinct identities at the same due instant, in a
    /// given order, always dispatches them back out in that same
    /// order on the next tick.
    #[test]
    fn fifo_within_a_slot_holds_for_any_ordering(ids in prop::collection::vec(0u8..50, 1..20)) {
        let mut unique: Vec<u8> = Vec::new();
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        let s = Scheduler::new();
        s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();
        let when = Utc::now() - chrono::Duration::seconds(1);

        for &id in &unique {
            s.add_task("parse".to_string(), when, format!("cert-{id}"), payload_for(id)).unwrap();
        }

        s.tick(Utc::now());

        for &id in &unique {
            let ctx = s.get_task("parse", true, Duration::from_millis(200)).expect("every scheduled identity is dispatched");
            prop_assert_eq!(ctx.identity, format!("cert-{id}"));
        }
        prop_assert!(s.get_task("parse", true, Duration::from_millis(20)).is_err());
    }

    /// Re-scheduling the same identity any number of times, at
    /// arbitrary past or future offsets, leaves at most one pending
    /// entry for it: a tick never dispatches the same identity twice.
    #[test]
    fn rescheduling_an_identity_any_number_of_times_never_duplicates_it(
        offsets_seconds in prop::collection::vec(-30i64..30, 1..15),
    ) {
        let s = Scheduler::new();
        s.add_queue("parse", DEFAULT_QUEUE_CAPACITY).unwrap();

        for &offset in &offsets_seconds {
            let when = Utc::now() + chrono::Duration::seconds(offset);
            s.add_task("parse".to_string(), when, "cert-a".to_string(), payload_for(1)).unwrap();
        }

        s.tick(Utc::now() + chrono::Duration::seconds(31));

        let first = s.get_task("parse", true, Duration::from_millis(200));
        prop_assert!(first.is_ok(), "the last scheduled instance must eventually be dispatched");
        prop_assert!(
            s.get_task("parse", true, Duration::from_millis(20)).is_err(),
            "no second delivery for the same identity"
        );
    }
}
