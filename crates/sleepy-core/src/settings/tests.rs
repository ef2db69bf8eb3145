use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};

use super::*;
use crate::host::mock::MemoryFileSystem;

fn settings() -> (Arc<MemoryFileSystem>, SettingsFile, Arc<Mutex<Vec<String>>>) {
    let fs = Arc::new(MemoryFileSystem::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let settings = SettingsFile::new(fs.clone()).with_setting_change_hook(move |key| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(key.to_owned());
        }
        true
    });
    (fs, settings, seen)
}

fn take(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    seen.lock().map(|mut seen| core::mem::take(&mut *seen)).unwrap_or_default()
}

fn file_text(fs: &MemoryFileSystem, path: &str) -> String {
    String::from_utf8(fs.contents(path).unwrap_or_default()).unwrap_or_default()
}

#[test]
fn load_without_file_starts_empty() {
    let (_fs, settings, _seen) = settings();
    settings.load();
    assert_eq!(settings.get_values_json(), "{}");
    assert_eq!(settings.get::<i32>("a"), None);
}

#[test]
fn corrupt_file_starts_empty() {
    let (fs, settings, _seen) = settings();
    fs.insert(DEFAULT_SETTINGS_PATH, b"{not json");
    settings.load();
    assert_eq!(settings.get_values_json(), "{}");

    fs.insert(DEFAULT_SETTINGS_PATH, br#"{"nested":{"a":1}}"#);
    settings.load();
    assert_eq!(settings.get_values_json(), "{}");
}

#[test]
fn values_round_trip_with_strict_types() {
    let (fs, settings, _seen) = settings();
    settings.load();
    assert_eq!(settings.set("interval", 15), Ok(true));
    assert_eq!(settings.set("ratio", 0.5), Ok(true));
    assert_eq!(settings.set("name", "north"), Ok(true));
    assert_eq!(settings.set("enabled", true), Ok(true));

    assert_eq!(settings.get::<i32>("interval"), Some(15));
    assert_eq!(settings.get::<f64>("interval"), None);
    assert_eq!(settings.get::<f64>("ratio"), Some(0.5));
    assert_eq!(settings.get::<i64>("ratio"), None);
    assert_eq!(settings.get::<String>("name").as_deref(), Some("north"));
    assert_eq!(settings.get::<bool>("enabled"), Some(true));
    assert_eq!(settings.get::<bool>("name"), None);

    let reloaded = SettingsFile::new(fs.clone());
    reloaded.load();
    assert_eq!(reloaded.get::<i32>("interval"), Some(15));
    assert_eq!(reloaded.get::<f64>("ratio"), Some(0.5));
    assert_eq!(reloaded.get_values_json(), settings.get_values_json());
}

#[test]
fn identical_set_does_not_notify_or_write() {
    let (fs, settings, seen) = settings();
    settings.load();
    assert_eq!(settings.set("a", 1), Ok(true));
    assert_eq!(take(&seen), vec!["a".to_owned()]);

    fs.insert(DEFAULT_SETTINGS_PATH, b"sentinel");
    assert_eq!(settings.set("a", 1), Ok(false));
    assert!(take(&seen).is_empty());
    assert_eq!(file_text(&fs, DEFAULT_SETTINGS_PATH), "sentinel");

    // Same number, different JSON type.
    assert_eq!(settings.set("a", 1.0), Ok(true));
    assert_eq!(take(&seen), vec!["a".to_owned()]);
}

#[test]
fn set_values_json_notifies_each_changed_key_once() {
    let (fs, settings, seen) = settings();
    settings.load();
    settings
        .set_values_json(r#"{"a":1,"b":"x","c":true}"#)
        .unwrap_or_default();
    take(&seen);

    let changed = settings.set_values_json(r#"{"a":1,"b":"y","d":2}"#);
    assert_eq!(
        changed,
        Ok(vec!["b".to_owned(), "d".to_owned(), "c".to_owned()])
    );
    assert_eq!(take(&seen), vec!["b".to_owned(), "d".to_owned(), "c".to_owned()]);
    assert!(!settings.contains("c"));
    assert_eq!(file_text(&fs, DEFAULT_SETTINGS_PATH), r#"{"a":1,"b":"y","d":2}"#);

    assert_eq!(settings.set_values_json(r#"{"a":1,"b":"y","d":2}"#), Ok(Vec::new()));
    assert!(take(&seen).is_empty());
}

#[test]
fn update_values_json_merges() {
    let (_fs, settings, seen) = settings();
    settings.load();
    settings.set_values_json(r#"{"a":1,"b":2}"#).unwrap_or_default();
    take(&seen);

    assert_eq!(
        settings.update_values_json(r#"{"b":3,"c":4,"a":1}"#),
        Ok(vec!["b".to_owned(), "c".to_owned()])
    );
    assert_eq!(settings.get_values_json(), r#"{"a":1,"b":3,"c":4}"#);
    assert_eq!(take(&seen), vec!["b".to_owned(), "c".to_owned()]);
}

#[test]
fn defaults_only_fill_missing_keys() {
    let fs = Arc::new(MemoryFileSystem::new());
    fs.insert(DEFAULT_SETTINGS_PATH, br#"{"interval":5}"#);
    let settings = SettingsFile::new(fs.clone()).with_default_values(r#"{"interval":15,"gain":2}"#);
    settings.load();

    assert_eq!(settings.get::<i32>("interval"), Some(5));
    assert_eq!(settings.get::<i32>("gain"), Some(2));
    assert_eq!(file_text(&fs, DEFAULT_SETTINGS_PATH), r#"{"interval":5,"gain":2}"#);

    // Nothing missing: no write.
    fs.insert(DEFAULT_SETTINGS_PATH, br#"{"interval":5,"gain":9}"#);
    settings.load();
    assert_eq!(file_text(&fs, DEFAULT_SETTINGS_PATH), r#"{"interval":5,"gain":9}"#);
}

#[test]
fn invalid_input_is_rejected_without_change() {
    let (_fs, settings, seen) = settings();
    settings.load();
    settings.set("a", 1).unwrap_or_default();
    take(&seen);

    assert_eq!(settings.set_values_json("[1,2]"), Err(SettingsError::NotObject));
    assert_eq!(settings.set_values_json("{"), Err(SettingsError::Parse));
    assert_eq!(settings.update_values_json(r#"{"x":[1]}"#), Err(SettingsError::NotFlat));
    assert_eq!(settings.set("x", serde_json::json!({"y": 1})), Err(SettingsError::NotFlat));
    assert_eq!(settings.get_values_json(), r#"{"a":1}"#);
    assert!(take(&seen).is_empty());
}

#[test]
fn oversized_document_is_rejected() {
    let fs = Arc::new(MemoryFileSystem::new());
    let settings = SettingsFile::new(fs.clone()).with_max_size(16);
    settings.load();
    assert_eq!(settings.set("a", 1), Ok(true));
    assert_eq!(settings.set("long", "0123456789"), Err(SettingsError::TooLarge));
    assert_eq!(settings.get_values_json(), r#"{"a":1}"#);
}

#[test]
fn failed_write_rolls_back() {
    let (fs, settings, seen) = settings();
    settings.load();
    fs.set_fail_writes(true);
    assert!(matches!(settings.set("a", 1), Err(SettingsError::Storage(_))));
    assert_eq!(settings.get::<i32>("a"), None);
    assert!(take(&seen).is_empty());
}

#[test]
fn handlers_can_read_the_store() {
    let fs = Arc::new(MemoryFileSystem::new());
    let settings = Arc::new(SettingsFile::new(fs));
    let reader = Arc::clone(&settings);
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);
    settings.add_setting_change_hook(move |key| {
        if let Ok(mut slot) = sink.lock() {
            *slot = reader.get::<i32>(key);
        }
        true
    });

    settings.load();
    settings.set("a", 7).unwrap_or_default();
    assert_eq!(observed.lock().map(|slot| *slot).ok().flatten(), Some(7));
}

#[test]
fn handlers_can_write_back_into_the_store() {
    let fs = Arc::new(MemoryFileSystem::new());
    let settings = Arc::new(SettingsFile::new(fs.clone()));
    let writer = Arc::clone(&settings);
    settings.add_setting_change_hook(move |key| {
        if key == "a" {
            writer.set("mirror", 1).unwrap_or_default();
        }
        true
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    settings.add_setting_change_hook(move |key| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(key.to_owned());
        }
        true
    });
    settings.load();

    let (done_tx, done_rx) = mpsc::channel();
    let outer = Arc::clone(&settings);
    thread::spawn(move || {
        let _ = done_tx.send(outer.set("a", 7));
    });
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)), Ok(Ok(true)));

    assert_eq!(take(&seen), vec!["a".to_owned(), "mirror".to_owned()]);
    assert_eq!(settings.get::<i32>("a"), Some(7));
    assert_eq!(settings.get::<i32>("mirror"), Some(1));
    assert_eq!(file_text(&fs, DEFAULT_SETTINGS_PATH), r#"{"a":7,"mirror":1}"#);
}

#[test]
fn handlers_registered_during_dispatch_are_kept() {
    let fs = Arc::new(MemoryFileSystem::new());
    let settings = Arc::new(SettingsFile::new(fs));
    let registrar = Arc::clone(&settings);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut registered = false;
    settings.add_setting_change_hook(move |_| {
        if !registered {
            registered = true;
            let sink = Arc::clone(&sink);
            registrar.add_setting_change_hook(move |key| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push(key.to_owned());
                }
                true
            });
        }
        true
    });
    settings.load();

    assert_eq!(settings.set("a", 1), Ok(true));
    assert!(take(&seen).is_empty());
    assert_eq!(settings.set("b", 2), Ok(true));
    assert_eq!(take(&seen), vec!["b".to_owned()]);
}

#[test]
fn grouped_operations_hold_the_lock() {
    let (_fs, settings, seen) = settings();
    settings.load();
    {
        let _guard = settings.lock();
        settings.set("a", 1).unwrap_or_default();
        settings.set("b", 2).unwrap_or_default();
    }
    assert_eq!(take(&seen), vec!["a".to_owned(), "b".to_owned()]);
}

#[test]
fn cloud_hash_covers_exact_document_bytes() {
    let fs = Arc::new(MemoryFileSystem::new());
    let cloud = CloudSettingsFile::new(fs.clone());
    cloud.load();
    assert_eq!(cloud.hash(), murmur3_32(b"{}", CLOUD_SETTINGS_HASH_SEED));

    let doc = r#"{"t":20,"name":"a b"}"#;
    cloud.set_values_json(doc).unwrap_or_default();
    assert_eq!(cloud.hash(), murmur3_32(doc.as_bytes(), CLOUD_SETTINGS_HASH_SEED));
    assert_eq!(cloud.get::<i32>("t"), Some(20));
    assert_eq!(file_text(&fs, DEFAULT_CLOUD_SETTINGS_PATH), doc);

    let reloaded = CloudSettingsFile::new(fs.clone());
    reloaded.load();
    assert_eq!(reloaded.hash(), cloud.hash());
}
