use serde_json::Map;

use super::*;
use crate::{history::DEFAULT_HISTORY_PATH, host::mock::MemoryFileSystem};

fn fragment(
    key: &'static str,
    len: usize,
    priority: i32,
) -> impl FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send + 'static {
    move |writer, slot| {
        writer.insert(key, "x".repeat(len));
        *slot = priority;
        true
    }
}

fn parse(payload: &CombinedPayload) -> Map<String, Value> {
    match serde_json::from_str::<Value>(&payload.data) {
        Ok(Value::Object(map)) => map,
        other => panic!("payload is not an object: {:?}", other),
    }
}

fn assert_well_formed(payloads: &[CombinedPayload], max_payload: usize) {
    for payload in payloads {
        assert!(payload.data.len() <= max_payload, "{} bytes", payload.data.len());
        let map = parse(payload);
        // A repeated key would collapse in the parsed map.
        let raw_keys = payload.data.matches("\":").count();
        assert!(map.len() <= raw_keys);
    }
}

fn with_history(max_payload: usize) -> (Arc<MemoryFileSystem>, Arc<EventHistory>, EventCombiner) {
    let fs = Arc::new(MemoryFileSystem::new());
    let history = Arc::new(EventHistory::new(fs.clone()));
    let combiner = EventCombiner::new()
        .with_max_payload(max_payload)
        .with_history(Arc::clone(&history), "eh");
    (fs, history, combiner)
}

#[test]
fn no_fragments_means_no_payloads() {
    let mut combiner = EventCombiner::new();
    combiner.add_hook(|_, _| true);
    combiner.add_hook(|writer, _| {
        // Priority stays 0.
        writer.insert("ignored", 1);
        true
    });
    assert!(combiner.generate_events().is_empty());
}

#[test]
fn fragments_pack_by_priority_into_one_object() {
    let mut combiner = EventCombiner::new();
    combiner.add_hook(|writer, priority| {
        writer.insert("low", 1);
        *priority = 10;
        true
    });
    combiner.add_hook(|writer, priority| {
        writer.insert("high", 2).insert("also", true);
        *priority = 90;
        true
    });

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, r#"{"high":2,"also":true,"low":1}"#);
    assert_eq!(payloads[0].history_end, None);
}

#[test]
fn out_of_range_priorities_are_clamped() {
    let mut combiner = EventCombiner::new();
    combiner.add_hook(|writer, priority| {
        writer.insert("top", 1);
        *priority = MAX_PRIORITY;
        true
    });
    combiner.add_hook(|writer, priority| {
        writer.insert("huge", 2);
        *priority = 500;
        true
    });
    combiner.add_hook(|writer, priority| {
        writer.insert("negative", 3);
        *priority = -5;
        true
    });

    // Equal after clamping, so registration order holds.
    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, r#"{"top":1,"huge":2}"#);
}

#[test]
fn one_time_hooks_run_newest_first_then_clear() {
    let mut combiner = EventCombiner::new();
    combiner.add_one_time_hook(|writer, priority| {
        writer.insert("first", 1);
        *priority = 50;
        true
    });
    combiner.add_one_time_hook(|writer, priority| {
        writer.insert("second", 2);
        *priority = 50;
        true
    });

    let payloads = combiner.generate_events();
    assert_eq!(payloads[0].data, r#"{"second":2,"first":1}"#);
    assert_eq!(combiner.one_time_hook_count(), 0);
    assert!(combiner.generate_events().is_empty());
}

#[test]
fn duplicate_keys_keep_the_higher_priority_fragment() {
    let mut combiner = EventCombiner::new();
    combiner.add_hook(|writer, priority| {
        writer.insert("t", "low");
        *priority = 20;
        true
    });
    combiner.add_hook(|writer, priority| {
        writer.insert("t", "high").insert("u", 1);
        *priority = 70;
        true
    });
    combiner.add_hook(|writer, priority| {
        writer.insert("u", 5).insert("v", 6);
        *priority = 60;
        true
    });

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, r#"{"t":"high","u":1}"#);
}

#[test]
fn low_priority_fragment_is_starved_after_first_payload() {
    let mut combiner = EventCombiner::new().with_max_payload(256);
    combiner.add_hook(fragment("b", 190, 30));
    combiner.add_hook(fragment("a", 190, 80));

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    let map = parse(&payloads[0]);
    assert!(map.contains_key("a"));
    assert!(!map.contains_key("b"));
    assert_well_formed(&payloads, 256);
}

#[test]
fn high_priority_fragments_spill_into_more_payloads() {
    let mut combiner = EventCombiner::new().with_max_payload(256);
    combiner.add_hook(fragment("a", 150, 90));
    combiner.add_hook(fragment("b", 150, 70));
    combiner.add_hook(fragment("c", 150, 50));
    combiner.add_hook(fragment("d", 10, 40));

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 3);
    assert!(parse(&payloads[0]).contains_key("a"));
    assert!(parse(&payloads[1]).contains_key("b"));
    let last = parse(&payloads[2]);
    assert!(last.contains_key("c"));
    assert!(!last.contains_key("d"));
    assert_well_formed(&payloads, 256);
}

#[test]
fn low_priority_fits_in_first_payload_when_room_remains() {
    let mut combiner = EventCombiner::new().with_max_payload(256);
    combiner.add_hook(fragment("a", 100, 80));
    combiner.add_hook(fragment("b", 100, 10));

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(parse(&payloads[0]).len(), 2);
}

#[test]
fn oversized_fragment_is_dropped() {
    let mut combiner = EventCombiner::new().with_max_payload(64);
    combiner.add_hook(fragment("big", 100, 90));
    combiner.add_hook(fragment("small", 4, 10));

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, r#"{"small":"xxxx"}"#);
}

#[test]
fn flag_fragments_respect_enabled_mask() {
    let mut combiner = EventCombiner::new();
    combiner.set_events_enabled(WakeEventFlags::ALL.without(WakeEventFlags::RESET_REASON));
    assert!(combiner.add_flag_fragment(WakeEventFlags::WAKE_REASON, 4));
    assert!(!combiner.add_flag_fragment(WakeEventFlags::RESET_REASON, 40));
    assert!(!combiner.add_flag_fragment(WakeEventFlags::ALL, 1));

    let payloads = combiner.generate_events();
    assert_eq!(payloads[0].data, r#"{"wr":4}"#);
}

#[test]
fn history_rides_in_first_payload_and_is_removed_on_acknowledge() {
    let (fs, history, mut combiner) = with_history(1024);
    history.append(r#"{"t":1}"#).unwrap_or(());
    history.append(r#"{"t":2}"#).unwrap_or(());
    combiner.add_flag_fragment(WakeEventFlags::TIME_TO_CONNECT, 1500);

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, r#"{"ttc":1500,"eh":[{"t":1},{"t":2}]}"#);
    assert!(fs.exists(DEFAULT_HISTORY_PATH));

    let end = payloads[0].history_end.unwrap_or_default();
    combiner.acknowledge(end);
    assert!(!fs.exists(DEFAULT_HISTORY_PATH));
    assert!(!history.has_events());
}

#[test]
fn unacknowledged_history_is_sent_again() {
    let (_fs, history, mut combiner) = with_history(1024);
    history.append(r#"{"t":1}"#).unwrap_or(());

    let first = combiner.generate_events();
    let second = combiner.generate_events();
    assert_eq!(first, second);
    assert_eq!(second[0].data, r#"{"eh":[{"t":1}]}"#);
}

#[test]
fn history_overflow_goes_into_history_only_payloads() {
    let (fs, history, mut combiner) = with_history(64);
    for i in 0..12 {
        history.append(&format!(r#"{{"i":{}}}"#, i)).unwrap_or(());
    }

    let payloads = combiner.generate_events();
    assert!(payloads.len() > 1);
    assert_well_formed(&payloads, 64);

    let mut seen = Vec::new();
    for payload in payloads.iter() {
        let map = parse(payload);
        let Some(Value::Array(records)) = map.get("eh") else {
            panic!("history payload without eh: {}", payload.data);
        };
        seen.extend(records.iter().filter_map(|r| r.get("i").and_then(Value::as_i64)));
        assert!(payload.history_end.is_some());
    }
    assert_eq!(seen, (0..12).collect::<Vec<i64>>());

    // Acknowledge in publish order.
    for payload in payloads.iter() {
        combiner.acknowledge(payload.history_end.unwrap_or_default());
    }
    assert!(!fs.exists(DEFAULT_HISTORY_PATH));
}

#[test]
fn partially_acknowledged_history_keeps_the_rest() {
    let (fs, history, mut combiner) = with_history(64);
    for i in 0..12 {
        history.append(&format!(r#"{{"i":{}}}"#, i)).unwrap_or(());
    }
    let payloads = combiner.generate_events();
    combiner.acknowledge(payloads[0].history_end.unwrap_or_default());
    assert!(fs.exists(DEFAULT_HISTORY_PATH));

    let again = combiner.generate_events();
    let first = parse(&again[0]);
    let Some(Value::Array(records)) = first.get("eh") else {
        panic!("missing history");
    };
    let first_index = records.first().and_then(|r| r.get("i")).and_then(Value::as_i64);
    assert!(first_index.is_some_and(|i| i > 0));
}

#[test]
fn starved_history_restarts_from_the_head() {
    let (_fs, history, mut combiner) = with_history(128);
    history.append(r#"{"i":0}"#).unwrap_or(());
    combiner.add_hook(fragment("a", 110, 90));

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 2);
    assert!(parse(&payloads[0]).contains_key("a"));
    assert_eq!(payloads[1].data, r#"{"eh":[{"i":0}]}"#);
    assert_eq!(payloads[0].history_end, None);
    assert!(payloads[1].history_end.is_some());
}

#[test]
fn hook_claiming_the_history_key_pushes_history_out() {
    let (_fs, history, mut combiner) = with_history(1024);
    history.append(r#"{"i":0}"#).unwrap_or(());
    combiner.add_hook(|writer, priority| {
        writer.insert("eh", "mine");
        *priority = 60;
        true
    });

    let payloads = combiner.generate_events();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].data, r#"{"eh":"mine"}"#);
    assert_eq!(payloads[1].data, r#"{"eh":[{"i":0}]}"#);
}
