//! Concurrent writers, transactions and sessions.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use treesync::{
    Path, SetRequest, SubscribeRequest, SubscribeResponse, Subscription, SubscriptionList,
    SubscriptionMode, Target, TargetConfig, Timestamp, TreeStore, TypedValue, Update,
};

#[test]
fn test_disjoint_writers_do_not_contend() {
    let store = Arc::new(TreeStore::new(Duration::from_millis(50)));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|root| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    let path = Path::new([root, "1"]);
                    store
                        .write(&path, TypedValue::json(i), Timestamp(i + 1))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        store.get(&Path::parse("/a/1")).unwrap().unwrap().value,
        TypedValue::json(499)
    );
    assert_eq!(
        store.get(&Path::parse("/b/1")).unwrap().unwrap().value,
        TypedValue::json(499)
    );
}

#[test]
fn test_same_path_keeps_newest_timestamp() {
    let store = Arc::new(TreeStore::default());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..200 {
                    let ts = i * 4 + t;
                    store
                        .write(&Path::parse("/shared"), TypedValue::json(ts), Timestamp(ts))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let leaf = store.get(&Path::parse("/shared")).unwrap().unwrap();
    assert_eq!(leaf.timestamp, Timestamp(199 * 4 + 3));
    assert_eq!(leaf.value, TypedValue::json(199 * 4 + 3));
}

#[test]
fn test_equal_timestamps_last_arrival_wins() {
    let store = TreeStore::default();
    let path = Path::parse("/tie");
    store.write(&path, TypedValue::json("first"), Timestamp(5)).unwrap();
    store.write(&path, TypedValue::json("second"), Timestamp(5)).unwrap();
    assert_eq!(store.get(&path).unwrap().unwrap().value, TypedValue::json("second"));
}

#[test]
fn test_overlapping_transactions_never_interleave() {
    let target = Target::new(TargetConfig::default().with_lock_timeout(Duration::from_secs(5)));
    let barrier = Arc::new(Barrier::new(4));

    // Each transaction rewrites both leaves with its own marker; a reader
    // must never see the two leaves disagree.
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let target = target.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    let marker = w * 1000 + i;
                    let response = target.set(
                        SetRequest::new()
                            .delete("/pair")
                            .update(Update::new("/pair/left", TypedValue::json(marker)))
                            .update(Update::new("/pair/right", TypedValue::json(marker))),
                    );
                    assert!(response.is_ok(), "{:?}", response.error());
                }
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(10);
    while writers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
        let leaves = target.store().scan(&Path::parse("/pair")).unwrap();
        if leaves.len() == 2 {
            assert_eq!(leaves[0].value, leaves[1].value);
            assert_eq!(leaves[0].timestamp, leaves[1].timestamp);
        }
    }
    for writer in writers {
        writer.join().unwrap();
    }
}

#[test]
fn test_set_timestamps_follow_commit_order() {
    let target = Target::default();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let target = target.clone();
            thread::spawn(move || {
                target
                    .set(SetRequest::new().update(Update::new("/seq", TypedValue::json(i))))
                    .timestamp
            })
        })
        .collect();
    let mut stamps: Vec<Timestamp> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    stamps.sort();
    stamps.dedup();
    assert_eq!(stamps.len(), 8, "every Set gets its own timestamp");

    // The surviving value belongs to the newest transaction.
    let leaf = target.store().get(&Path::parse("/seq")).unwrap().unwrap();
    assert_eq!(Some(&leaf.timestamp), stamps.last());
}

#[test]
fn test_per_path_events_arrive_in_order() {
    let target = Target::default();
    let (control, requests) = crossbeam_channel::unbounded();
    let handle = target.subscribe(requests).unwrap();
    control
        .send(SubscribeRequest::Subscribe(SubscriptionList::new(
            SubscriptionMode::Stream,
            vec![Subscription::new("/ordered")],
        )))
        .unwrap();
    assert_eq!(
        handle.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(),
        SubscribeResponse::Sync { request_id: 0 }
    );

    let writer = {
        let target = target.clone();
        thread::spawn(move || {
            for i in 0..100 {
                target.publish("/ordered/x", TypedValue::json(i)).unwrap();
            }
        })
    };
    writer.join().unwrap();

    let mut last = None;
    loop {
        let response = handle.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let SubscribeResponse::Update(n) = response else {
            continue;
        };
        assert!(last.map_or(true, |prev| prev < n.timestamp));
        last = Some(n.timestamp);
        if n.update.iter().any(|u| u.value == TypedValue::json(99)) {
            break;
        }
    }
}
