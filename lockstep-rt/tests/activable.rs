use std::sync::Arc;
use std::thread;

use lockstep_rt::{
    Activable, ActivityCounter, FifoQueue, Lockable, MessageQueue, ObjRef, Plain, ReadArg,
    RefCounted, SyncHandle, SyncObject, Value,
};

#[derive(Debug)]
struct Counter {
    hits: i64,
    label: String,
}

fn counter() -> Activable<Counter> {
    Activable::new(Counter {
        hits: 0,
        label: "c".to_string(),
    })
}

#[test]
fn concurrent_activation_shares_one_proxy() {
    let obj = counter();
    let (p1, p2) = thread::scope(|s| {
        let h1 = s.spawn(|| obj.activate(None, None, None));
        let h2 = s.spawn(|| obj.activate(None, None, None));
        (h1.join().unwrap(), h2.join().unwrap())
    });
    assert!(Arc::ptr_eq(&p1, &p2));
    // one reference in the object's slot, one per caller
    assert_eq!(Arc::strong_count(&p1), 3);
    assert_eq!(obj.object().ref_count(), 2);
    drop(p2);
    assert_eq!(Arc::strong_count(&p1), 2);
}

#[test]
fn first_activation_picks_the_queue() {
    let obj = counter();
    let custom = FifoQueue::handle();
    let p1 = obj.activate(None, Some(Arc::clone(&custom)), None);
    let p2 = obj.activate(None, Some(FifoQueue::handle()), None);
    assert!(Arc::ptr_eq(p1.queue(), &custom));
    assert!(Arc::ptr_eq(p2.queue(), &custom));
    assert!(obj.is_activated());
}

#[test]
fn proxy_calls_run_when_the_queue_drains() {
    let obj = counter();
    let proxy = obj.activate(None, None, None);
    let bumped = proxy.send_mut(None, (Plain(3i64),), |c, (by,)| {
        c.hits += *by;
        c.hits
    });
    let label = proxy.send_const(None, (), |c, ()| Value(c.label.clone()));
    assert!(!bumped.is_ready());
    assert_eq!(proxy.queue().len(), 2);

    let report = obj.queue().activate();
    assert_eq!(report.activated, 2);
    assert_eq!(bumped.get_int(), Ok(3));
    assert_eq!(label.take_value::<String>().unwrap(), "c");
    assert_eq!(obj.object().read_lock().hits, 3);
}

#[test]
fn sync_tracks_and_cancels_activity() {
    let obj = counter();
    let tracker = ObjRef::new(ActivityCounter::new());
    let proxy = obj.activate(Some(SyncHandle::from(&tracker)), None, None);

    proxy.send_mut(None, (), |c, ()| c.hits += 1);
    proxy.send_mut(None, (), |c, ()| c.hits += 1);
    assert_eq!(tracker.read_lock().pending(), 2);

    let first = obj.queue().activate();
    assert_eq!(first.activated, 2);
    assert_eq!(tracker.read_lock().pending(), 0);

    proxy.send_mut(None, (), |c, ()| c.hits += 1);
    assert_eq!(tracker.read_lock().pending(), 1);
    tracker.write_lock().cancel();
    let second = obj.queue().activate();
    assert_eq!(second.abandoned, 1);
    assert!(obj.queue().is_empty());
    assert_eq!(tracker.read_lock().pending(), 0);
    assert!(tracker.read_lock().is_completed());
    assert_eq!(obj.object().read_lock().hits, 2);
}

#[test]
fn busy_argument_defers_until_released() {
    let obj = counter();
    let proxy = obj.activate(None, None, None);
    let other = ObjRef::new(Counter {
        hits: 10,
        label: "o".to_string(),
    });
    let result = proxy.send_mut(None, (ReadArg(other.clone()),), |c, (o,)| {
        c.hits += o.hits;
        c.hits
    });

    let held = other.write_lock();
    let report = obj.queue().activate();
    assert_eq!(report.deferred, 1);
    assert!(obj.object().try_write_lock().is_some());
    drop(held);

    let report = obj.queue().activate();
    assert_eq!(report.activated, 1);
    assert_eq!(result.get_int(), Ok(10));
}

#[test]
fn returned_objects_come_back_as_pointers() {
    let obj = counter();
    let proxy = obj.activate(None, None, None);
    let shared = ObjRef::new(5u32);
    let handed = shared.clone();
    let result = proxy.send_const(None, (), move |_, ()| handed);
    obj.queue().activate();
    let back = result.get_pointer::<u32>().unwrap();
    assert!(back.ptr_eq(&shared));
}
