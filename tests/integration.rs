//! Integration tests for the tree engine.

use serde_json::json;
use treesync::notification::build;
use treesync::{
    AliasOwner, EnvelopeReader, GetRequest, NotificationKind, Operation, Path, SetRequest,
    Target, TargetConfig, Timestamp, TypedValue, Update,
};

fn target() -> Target {
    Target::new(TargetConfig::default())
}

fn value_at(target: &Target, path: &str) -> Option<TypedValue> {
    target
        .store()
        .get(&Path::parse(path))
        .unwrap()
        .map(|leaf| leaf.value)
}

// --- Realistic Workflow Tests ---

#[test]
fn test_interface_configuration_workflow() {
    let target = target();

    // Device publishes operational state
    target
        .publish(
            "/interfaces/eth0/state",
            TypedValue::json(json!({"oper-status": "UP", "counters": {"in-octets": 10}})),
        )
        .unwrap();
    target.mark_read_only("/interfaces/eth0/state").unwrap();

    // Client configures the interface
    let response = target.set(
        SetRequest::new()
            .with_prefix("/interfaces/eth0/config")
            .update(Update::new("/mtu", TypedValue::json(9000)))
            .update(Update::new("/description", TypedValue::json("uplink"))),
    );
    assert!(response.is_ok());
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.prefix, Some(Path::parse("/interfaces/eth0/config")));

    // Snapshot read returns the whole interface as one subtree
    let got = target
        .get(GetRequest::new(["/interfaces/eth0"]))
        .unwrap();
    let subtree = got.notifications[0].update[0].value.as_json().unwrap().clone();
    assert_eq!(subtree["config"]["mtu"], 9000);
    assert_eq!(subtree["state"]["counters"]["in-octets"], 10);

    // Client may not touch operational state
    let denied = target.set(
        SetRequest::new().update(Update::new(
            "/interfaces/eth0/state/oper-status",
            TypedValue::json("DOWN"),
        )),
    );
    assert!(!denied.is_ok());
    assert_eq!(
        value_at(&target, "/interfaces/eth0/state/oper-status"),
        Some(TypedValue::json("UP"))
    );
}

#[test]
fn test_subtree_merge_removes_absent_children() {
    let target = target();
    target
        .publish("/sys/dns", TypedValue::json(json!({"a": "1.1.1.1", "b": "8.8.8.8"})))
        .unwrap();
    target
        .publish("/sys/dns", TypedValue::json(json!({"a": "9.9.9.9", "c": "1.0.0.1"})))
        .unwrap();

    assert_eq!(value_at(&target, "/sys/dns/a"), Some(TypedValue::json("9.9.9.9")));
    assert_eq!(value_at(&target, "/sys/dns/b"), None);
    assert_eq!(value_at(&target, "/sys/dns/c"), Some(TypedValue::json("1.0.0.1")));
}

#[test]
fn test_delete_cutoff_keeps_fresher_data() {
    let target = target();
    let store = target.store();
    store
        .write(&Path::parse("/a/old"), TypedValue::json(1), Timestamp(10))
        .unwrap();
    store
        .write(&Path::parse("/a/new"), TypedValue::json(2), Timestamp(30))
        .unwrap();

    let removed = store.delete_older_than(&Path::parse("/a"), Timestamp(20)).unwrap();
    assert_eq!(removed.len(), 1);
    assert!(!store.contains(&Path::parse("/a/old")));
    assert!(store.contains(&Path::parse("/a/new")));
}

#[test]
fn test_replace_keeps_new_value() {
    let target = target();
    target
        .publish("/acl/rules", TypedValue::json(json!({"r1": "deny", "r2": "permit"})))
        .unwrap();

    let response = target.set(SetRequest::new().replace(Update::new(
        "/acl/rules",
        TypedValue::json(json!({"r3": "permit"})),
    )));
    assert!(response.is_ok());
    assert_eq!(response.results[0].op, Operation::Replace);

    let leaves = target.store().scan(&Path::parse("/acl/rules")).unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].path, Path::parse("/acl/rules/r3"));
    assert_eq!(leaves[0].timestamp, response.timestamp);
}

#[test]
fn test_alias_resolution_round_trip() {
    let target = target();
    target.define_alias("@42", "/a/b/c").unwrap();
    let expanded = target.aliases().expand(&Path::new(["@42", "d"])).unwrap();
    assert_eq!(expanded, Path::new(["a", "b", "c", "d"]));

    target.retract_alias("@42").unwrap();
    assert!(target.aliases().expand(&Path::new(["@42", "d"])).is_err());
}

#[test]
fn test_set_through_alias_prefix() {
    let target = target();
    target.define_alias("@eth0", "/interfaces/eth0").unwrap();
    let response = target.set(
        SetRequest::new()
            .with_prefix(Path::new(["@eth0", "config"]))
            .update(Update::new("/mtu", TypedValue::json(1400))),
    );
    assert!(response.is_ok());
    assert_eq!(
        value_at(&target, "/interfaces/eth0/config/mtu"),
        Some(TypedValue::json(1400))
    );
}

#[test]
fn test_notification_with_target_alias() {
    let target = target();
    target
        .aliases()
        .define(AliasOwner::Target, "@e", Path::parse("/interfaces/eth0"))
        .unwrap();

    let builder = treesync::NotificationBuilder::new().with_aliases(target.aliases(), true);
    let n = builder.build(
        Timestamp(5),
        None,
        vec![
            Update::new("/interfaces/eth0/state/a", TypedValue::json(1)),
            Update::new("/interfaces/eth0/state/b", TypedValue::json(2)),
        ],
        vec![],
    );
    assert_eq!(n.kind(), NotificationKind::Data);
    assert_eq!(n.prefix, Some(Path::new(["@e", "state"])));
    let absolute = n.absolute_updates(Some(target.aliases())).unwrap();
    assert_eq!(absolute[1].path, Path::parse("/interfaces/eth0/state/b"));
}

#[test]
fn test_set_stream_handles_each_request() {
    let target = target();
    let (requests, rx) = crossbeam_channel::unbounded();
    let responses = target.set_stream(rx).unwrap();

    requests
        .send(SetRequest::new().update(Update::new("/x", TypedValue::json(1))))
        .unwrap();
    requests
        .send(SetRequest::new().update(Update::new("/x/y", TypedValue::json(2))))
        .unwrap();
    drop(requests);

    let all: Vec<_> = responses.iter().collect();
    assert_eq!(all.len(), 2);
    assert!(all[0].is_ok());
    // Writing beneath a leaf fails on its own, without touching the first.
    assert!(!all[1].is_ok());
    assert_eq!(value_at(&target, "/x"), Some(TypedValue::json(1)));
}

#[test]
fn test_envelope_transport() {
    let target = target();
    let ts = target.publish("/sys/uptime", TypedValue::json(100)).unwrap();
    let writer = target.envelope_writer();
    let mut reader = EnvelopeReader::new();

    for i in 0..3 {
        let n = build(
            ts,
            None,
            vec![Update::new("/sys/uptime", TypedValue::json(100 + i))],
            vec![],
        );
        let bytes = writer.encode(Some(ts), vec![n]).unwrap();
        // Lose the second datagram
        if i == 1 {
            continue;
        }
        let (envelope, _) = reader.read(&bytes).unwrap();
        assert_eq!(envelope.originator, Path::parse("/target"));
    }
    assert_eq!(reader.gaps(), 1);
}
