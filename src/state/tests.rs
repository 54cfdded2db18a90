use super::*;
use crate::mqtt::message_manager::DeviceMessage;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

fn message(value: Value) -> DeviceMessage {
    DeviceMessage::decode(value.to_string().as_bytes()).unwrap()
}

fn current(state: Value) -> DeviceMessage {
    message(json!({"msg": "CURRENT-STATE", "time": "t0", "product-state": state}))
}

fn change(state: Value) -> DeviceMessage {
    message(json!({"msg": "STATE-CHANGE", "time": "t1", "product-state": state}))
}

#[test]
fn test_full_state_then_change_updates_only_named_key() {
    let model = StateModel::new();

    assert!(model.apply(&current(json!({"fnsp": "0005", "fpwr": "ON"}))));
    let snapshot = model.snapshot();
    assert_eq!(snapshot.setting("fnsp"), Some("0005"));
    assert_eq!(snapshot.setting("fpwr"), Some("ON"));
    assert!(snapshot.has_full_state);

    model.apply(&change(json!({"fnsp": ["0005", "0003"]})));
    let snapshot = model.snapshot();
    assert_eq!(snapshot.setting("fnsp"), Some("0003"));
    assert_eq!(snapshot.setting("fpwr"), Some("ON"));
    assert_eq!(snapshot.device_time.as_deref(), Some("t1"));
}

#[test]
fn test_full_state_replaces_rather_than_unions() {
    let model = StateModel::new();

    model.apply(&current(json!({"fnsp": "0005", "fpwr": "ON"})));
    model.apply(&current(json!({"nmod": "OFF", "sltm": "OFF"})));

    let keys: Vec<_> = model.snapshot().product_state.into_keys().collect();
    assert_eq!(keys, vec!["nmod".to_string(), "sltm".to_string()]);
}

#[test]
fn test_change_round_trip_for_power() {
    let model = StateModel::new();
    model.apply(&change(json!({"fpwr": ["OFF", "ON"]})));
    assert_eq!(model.snapshot().setting("fpwr"), Some("ON"));
}

#[test]
fn test_interleaved_sequence_matches_in_order_replay() {
    let sequence = vec![
        change(json!({"fnsp": ["0001", "0002"], "auto": ["OFF", "ON"]})),
        current(json!({"fnsp": "0004", "fpwr": "ON", "oson": "OFF"})),
        change(json!({"oson": ["OFF", "ON"]})),
        change(json!({"fnsp": ["0004", "0007"]})),
        current(json!({"fnsp": "0007", "fpwr": "OFF"})),
        change(json!({"nmod": ["OFF", "ON"], "fpwr": ["OFF", "ON"]})),
    ];

    let model = StateModel::new();
    for msg in &sequence {
        model.apply(msg);
    }

    // Replay by hand: the last full snapshot is the baseline, later changes win.
    let mut expected = BTreeMap::new();
    expected.insert("fnsp".to_string(), "0007".to_string());
    expected.insert("fpwr".to_string(), "ON".to_string());
    expected.insert("nmod".to_string(), "ON".to_string());

    assert_eq!(model.snapshot().product_state, expected);
    assert_eq!(model.revision(), sequence.len() as u64);
}

#[test]
fn test_environmental_namespace_is_separate() {
    let model = StateModel::new();
    model.apply(&current(json!({"fpwr": "ON"})));
    model.apply(&message(json!({
        "msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA",
        "time": "t2",
        "data": {"pm25": "0003", "pm10": "0005"}
    })));
    model.apply(&message(json!({
        "msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA",
        "data": {"pm25": "0009"}
    })));

    let snapshot = model.snapshot();
    assert_eq!(snapshot.setting("fpwr"), Some("ON"));
    assert_eq!(snapshot.reading("pm25"), Some("0009"));
    assert_eq!(snapshot.reading("pm10"), None);
    assert_eq!(snapshot.setting("pm25"), None);
}

#[test]
fn test_location_and_faults_are_not_merged() {
    let model = StateModel::new();
    assert!(!model.apply(&message(json!({"msg": "LOCATION", "apos": "0090"}))));
    assert!(!model.apply(&message(json!({"msg": "CURRENT-FAULTS"}))));
    assert_eq!(model.snapshot(), DeviceSnapshot::default());
    assert_eq!(model.revision(), 0);
}

#[test]
fn test_concurrent_readers_see_whole_messages() {
    let model = StateModel::new();
    let writer_model = model.clone();

    let writer = thread::spawn(move || {
        for i in 0..200u32 {
            let value = format!("{:04}", i);
            writer_model.apply(&current(json!({"fnsp": value.clone(), "sltm": value})));
        }
    });

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let model = model.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = model.snapshot();
                    assert_eq!(snapshot.setting("fnsp"), snapshot.setting("sltm"));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(model.snapshot().setting("fnsp"), Some("0199"));
}

#[tokio::test]
async fn test_wait_for_full_state() {
    let model = StateModel::new();
    assert!(!model.wait_for_full_state(Duration::from_millis(20)).await);

    let writer = model.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.apply(&current(json!({"fpwr": "ON"})));
    });

    assert!(model.wait_for_full_state(Duration::from_secs(2)).await);
}
