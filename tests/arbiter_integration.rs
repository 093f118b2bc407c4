//! Integration tests driving the public arbiter API end to end.
//!
//! Each test gets its own runtime directory. Handles opened within one
//! test share a control file exactly the way separate processes would:
//! separate mappings, separate lock descriptors, futex handshakes in
//! between.

use resarb::prelude::*;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn open(dir: &TempDir) -> ResMgr {
    ResMgr::open_with(dir.path(), ArbConfig::builtin_defaults()).unwrap()
}

fn open_declared(dir: &TempDir, declarations: &str) -> ResMgr {
    ResMgr::open_with(dir.path(), ArbConfig::parse(declarations).unwrap()).unwrap()
}

fn event_channel() -> (EventFn, mpsc::Receiver<(RequestId, GrantEvent)>) {
    let (tx, rx) = mpsc::channel();
    let callback: EventFn = Box::new(move |id, event| {
        let _ = tx.send((id, event));
    });
    (callback, rx)
}

fn granted(outcome: RequestOutcome) -> (RequestId, SlotCaps) {
    match outcome {
        RequestOutcome::Granted { id, caps } => (id, caps),
        other => panic!("expected a grant, got {other:?}"),
    }
}

fn queued(outcome: RequestOutcome) -> RequestId {
    match outcome {
        RequestOutcome::Queued { id } => id,
        other => panic!("expected to queue, got {other:?}"),
    }
}

/// Test that a grant taken through one handle is visible through another
/// handle on the same runtime directory.
#[test]
fn test_grant_visible_through_second_handle() {
    let dir = tempdir().unwrap();
    let a = open(&dir);
    let b = open(&dir);

    let (id, _) = granted(a.request(RequestSpec::new(ResClass::Audio, 4), None).unwrap());
    let owner = b.owner_of(ResClass::Audio, 0).unwrap().unwrap();
    assert_eq!(owner.request_id, id);
    assert_eq!(owner.priority, 4);
    assert_eq!(owner.pid, std::process::id());

    a.release(ResClass::Audio, id).unwrap();
    assert!(b.owner_of(ResClass::Audio, 0).unwrap().is_none());
}

/// Test that releasing someone else's id through a different handle is a
/// no-op and leaves the owner untouched.
#[test]
fn test_foreign_release_leaves_owner_untouched() {
    let dir = tempdir().unwrap();
    let a = open(&dir);
    let b = open(&dir);

    let (id, _) = granted(a.request(RequestSpec::new(ResClass::Video, 6), None).unwrap());
    // b never issued this id, so its release must not free the slot
    b.release(ResClass::Video, id).unwrap();
    let owner = a.owner_of(ResClass::Video, 0).unwrap();
    assert_eq!(owner.unwrap().request_id, id);
    a.release(ResClass::Video, id).unwrap();
}

/// Test that the wait list orders by priority with FIFO among equals:
/// queueing at priorities 5, 1, 5, 3 yields the order 5, 5, 3, 1.
#[test]
fn test_wait_list_orders_by_priority_fifo_on_ties() {
    let dir = tempdir().unwrap();
    let mgr = open(&dir);
    let (owner_id, _) =
        granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 9), None).unwrap());

    let (tx, events) = mpsc::channel();
    let enqueue = |priority: u32| {
        let tx = tx.clone();
        let callback: EventFn = Box::new(move |id, event| {
            let _ = tx.send((id, event));
        });
        queued(
            mgr.request(RequestSpec::new(ResClass::FrontEnd, priority), Some(callback))
                .unwrap(),
        )
    };
    let q5a = enqueue(5);
    let q1 = enqueue(1);
    let q5b = enqueue(5);
    let q3 = enqueue(3);

    let snap = mgr.snapshot().unwrap();
    let waiters = &snap.class(ResClass::FrontEnd).slots[0].waiters;
    assert_eq!(waiters.as_slice(), &[q5a, q5b, q3, q1]);

    // freeing the slot hands it to the head waiter
    mgr.release(ResClass::FrontEnd, owner_id).unwrap();
    let (granted_id, event) = events.recv_timeout(EVENT_WAIT).unwrap();
    assert_eq!((granted_id, event), (q5a, GrantEvent::Granted));

    for id in [q1, q5b, q3] {
        mgr.cancel(ResClass::FrontEnd, id).unwrap();
    }
    mgr.release(ResClass::FrontEnd, q5a).unwrap();
    let snap = mgr.snapshot().unwrap();
    assert_eq!(snap.class(ResClass::FrontEnd).pending_in_use, 0);
    assert!(snap.class(ResClass::FrontEnd).slots[0].owner.is_none());
}

/// Test that a video request takes the tightest slot its needs allow,
/// keeping fully-capable hardware free.
#[test]
fn test_video_request_prefers_tightest_fitting_slot() {
    let dir = tempdir().unwrap();
    let mgr = open_declared(
        &dir,
        "video,hardware\n\
         video,hardware,limitedResolution(1920,1080)\n\
         video,hardware,limitedResolution(640,480)\n",
    );

    // no full-resolution need, small frames: the 640x480 slot fits
    let small = RequestSpec::new(ResClass::Video, 3)
        .with_usage(UsageFlags::empty())
        .with_max_size(320, 240);
    let (id, caps) = granted(mgr.request(small, None).unwrap());
    assert_eq!(caps.limit, Some(SizeLimit::new(640, 480)));
    mgr.release(ResClass::Video, id).unwrap();

    // larger frames skip the 640x480 slot but still avoid the unlimited one
    let medium = RequestSpec::new(ResClass::Video, 3)
        .with_usage(UsageFlags::empty())
        .with_max_size(800, 600);
    let (id, caps) = granted(mgr.request(medium, None).unwrap());
    assert_eq!(caps.limit, Some(SizeLimit::new(1920, 1080)));
    mgr.release(ResClass::Video, id).unwrap();

    // full-resolution usage disqualifies every limited slot
    let full = RequestSpec::new(ResClass::Video, 3).with_usage(UsageFlags::FULL_RESOLUTION);
    let (id, caps) = granted(mgr.request(full, None).unwrap());
    assert_eq!(caps.limit, None);
    assert!(caps.flags.contains(CapFlags::HARDWARE));
    mgr.release(ResClass::Video, id).unwrap();
}

/// Test the tie-break policy: equal priority and usage only preempts when
/// the declaration file says the requester wins.
#[test]
fn test_requester_tie_break_policy() {
    let default_dir = tempdir().unwrap();
    let mgr = open(&default_dir);
    let (held, _) = granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 3), None).unwrap());
    let outcome = mgr.request(RequestSpec::new(ResClass::FrontEnd, 3), None).unwrap();
    assert!(matches!(outcome, RequestOutcome::Denied));
    mgr.release(ResClass::FrontEnd, held).unwrap();

    let tie_dir = tempdir().unwrap();
    let mgr = open_declared(&tie_dir, "policy,requesterWinsPriorityTie\nfrontend\n");
    assert!(mgr.requester_wins_priority_tie().unwrap());
    let (_loser, _) = granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 3), None).unwrap());
    let (winner, _) = granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 3), None).unwrap());
    let owner = mgr.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
    assert_eq!(owner.request_id, winner);
    mgr.release(ResClass::FrontEnd, winner).unwrap();
}

/// Test the full preemption story across two handles: the victim hears
/// Revoked, the preemptor hears Granted afterwards, and the victim's
/// late release changes nothing.
#[test]
fn test_preemption_across_handles_transfers_with_callbacks() {
    let dir = tempdir().unwrap();
    let a = open(&dir);
    let b = open(&dir);

    let (cb_a, events_a) = event_channel();
    let (victim, _) = granted(
        a.request(RequestSpec::new(ResClass::FrontEnd, 2), Some(cb_a))
            .unwrap(),
    );

    let (cb_b, events_b) = event_channel();
    let preemptor = queued(
        b.request(RequestSpec::new(ResClass::FrontEnd, 5), Some(cb_b))
            .unwrap(),
    );

    let (revoked_id, revoked_event) = events_a.recv_timeout(EVENT_WAIT).unwrap();
    assert_eq!((revoked_id, revoked_event), (victim, GrantEvent::Revoked));
    let (granted_id, granted_event) = events_b.recv_timeout(EVENT_WAIT).unwrap();
    assert_eq!((granted_id, granted_event), (preemptor, GrantEvent::Granted));

    let owner = a.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
    assert_eq!(owner.request_id, preemptor);
    assert_eq!(owner.priority, 5);

    // the revoked holder's release is now a harmless no-op
    a.release(ResClass::FrontEnd, victim).unwrap();
    let owner = b.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
    assert_eq!(owner.request_id, preemptor);

    b.release(ResClass::FrontEnd, preemptor).unwrap();
    assert!(a.owner_of(ResClass::FrontEnd, 0).unwrap().is_none());
}

/// Test that calling release from inside the Revoked callback itself is
/// safe and does not disturb the transfer.
#[test]
fn test_release_from_inside_revoked_callback() {
    let dir = tempdir().unwrap();
    let a = open(&dir);
    let b = open(&dir);

    let (tx, events_a) = mpsc::channel();
    let a_for_callback = a.clone();
    let cb_a: EventFn = Box::new(move |id, event| {
        if event == GrantEvent::Revoked {
            a_for_callback.release(ResClass::FrontEnd, id).unwrap();
        }
        let _ = tx.send((id, event));
    });
    let (victim, _) = granted(
        a.request(RequestSpec::new(ResClass::FrontEnd, 1), Some(cb_a))
            .unwrap(),
    );

    let (cb_b, events_b) = event_channel();
    let preemptor = queued(
        b.request(RequestSpec::new(ResClass::FrontEnd, 8), Some(cb_b))
            .unwrap(),
    );

    let (revoked_id, _) = events_a.recv_timeout(EVENT_WAIT).unwrap();
    assert_eq!(revoked_id, victim);
    let (granted_id, _) = events_b.recv_timeout(EVENT_WAIT).unwrap();
    assert_eq!(granted_id, preemptor);
    let owner = a.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
    assert_eq!(owner.request_id, preemptor);
    b.release(ResClass::FrontEnd, preemptor).unwrap();
}

/// Test that resource classes do not interact: exhausting one leaves the
/// others untouched.
#[test]
fn test_classes_are_independent() {
    let dir = tempdir().unwrap();
    let mgr = open(&dir);

    let (fe, _) = granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 5), None).unwrap());
    let (au, _) = granted(mgr.request(RequestSpec::new(ResClass::Audio, 5), None).unwrap());

    let snap = mgr.snapshot().unwrap();
    assert!(snap.class(ResClass::Video).slots.iter().all(|s| s.owner.is_none()));
    assert!(snap.class(ResClass::FrontEnd).slots[0].owner.is_some());
    assert_eq!(snap.class(ResClass::Audio).pending_in_use, 0);

    mgr.release(ResClass::FrontEnd, fe).unwrap();
    mgr.release(ResClass::Audio, au).unwrap();
}

/// Test that the state dump names grants and waiters.
#[test]
fn test_dump_shows_grants() {
    let dir = tempdir().unwrap();
    let mgr = open(&dir);
    let (id, _) = granted(mgr.request(RequestSpec::new(ResClass::Audio, 7), None).unwrap());

    let mut buf = Vec::new();
    mgr.dump(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("class audio"));
    assert!(text.contains(&format!("request={} priority=7", id)));
    assert!(text.contains("policy requester-wins-tie=false"));

    mgr.release(ResClass::Audio, id).unwrap();
}

/// Test that declaration files shape the published tables.
#[test]
fn test_config_declarations_shape_the_tables() {
    let dir = tempdir().unwrap();
    let mgr = open_declared(
        &dir,
        "video,hardware\n\
         video,software,limitedQuality\n\
         audio,hardware\n",
    );
    assert_eq!(mgr.slot_count(ResClass::Video).unwrap(), 2);
    assert_eq!(mgr.slot_count(ResClass::Audio).unwrap(), 1);
    // undeclared classes keep their built-in tables
    assert_eq!(mgr.slot_count(ResClass::FrontEnd).unwrap(), 1);

    let caps = mgr.slot_caps(ResClass::Video, 1).unwrap();
    assert!(caps.flags.contains(CapFlags::SOFTWARE | CapFlags::LIMITED_QUALITY));
    assert!(!mgr.requester_wins_priority_tie().unwrap());
}

/// Test that cancelled requests never fire and their entries return to
/// the pool even while the owner stays put.
#[test]
fn test_cancel_returns_entries_to_the_pool() {
    let dir = tempdir().unwrap();
    let mgr = open(&dir);
    let (owner_id, _) =
        granted(mgr.request(RequestSpec::new(ResClass::FrontEnd, 9), None).unwrap());

    let (callback, events) = event_channel();
    let queued_id = queued(
        mgr.request(RequestSpec::new(ResClass::FrontEnd, 2), Some(callback))
            .unwrap(),
    );
    assert_eq!(mgr.snapshot().unwrap().class(ResClass::FrontEnd).pending_in_use, 1);

    mgr.cancel(ResClass::FrontEnd, queued_id).unwrap();
    assert_eq!(mgr.snapshot().unwrap().class(ResClass::FrontEnd).pending_in_use, 0);

    mgr.release(ResClass::FrontEnd, owner_id).unwrap();
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(mgr.owner_of(ResClass::FrontEnd, 0).unwrap().is_none());
}
