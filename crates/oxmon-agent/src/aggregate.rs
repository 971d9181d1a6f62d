use oxmon_common::types::{ResultEnvelope, Snapshot};
use serde::Serialize;
use std::sync::RwLock;

/// Latest result of every independently scheduled item, keyed by item name.
///
/// Written as item results arrive, read when a check batch is merged into a
/// snapshot.
#[derive(Debug, Default)]
pub struct LastValues {
    values: RwLock<Snapshot>,
}

impl LastValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the result, replacing any older value for the same name.
    pub fn record<T: Serialize>(&self, envelope: &ResultEnvelope<T>) {
        let value = envelope.to_json();
        self.write().insert(envelope.name.clone(), value);
    }

    pub fn get(&self, name: &str) -> Option<serde_json::Value> {
        self.read().get(name).cloned()
    }

    /// Drops the entries for items that no longer exist.
    pub fn forget<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut values = self.write();
        for name in names {
            values.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copies every entry into `snapshot`. Item values win over batch
    /// values on a name collision.
    pub fn merge_into(&self, snapshot: &mut Snapshot) {
        for (name, value) in self.read().iter() {
            snapshot.insert(name.clone(), value.clone());
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.values.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Encodes a snapshot as JSON.
///
/// If the snapshot itself cannot be encoded, a `{"error": message}` document
/// is produced instead. Only a failure to encode that fallback is returned.
pub fn encode_snapshot<T: Serialize + ?Sized>(snapshot: &T) -> serde_json::Result<Vec<u8>> {
    match serde_json::to_vec(snapshot) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode snapshot, publishing error document");
            serde_json::to_vec(&serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("sensor returned garbage"))
        }
    }

    #[test]
    fn newer_result_replaces_older_one() {
        let table = LastValues::new();
        table.record(&ResultEnvelope::success("c1", json!(1)));
        table.record(&ResultEnvelope::success("c1", json!(2)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("c1"), Some(json!(2)));
    }

    #[test]
    fn failed_run_is_stored_as_error_object() {
        let table = LastValues::new();
        table.record::<i32>(&ResultEnvelope::failure("c1", "exit status 3"));
        assert_eq!(table.get("c1"), Some(json!({ "error": "exit status 3" })));
    }

    #[test]
    fn merge_keeps_batch_keys_and_lets_items_win() {
        let table = LastValues::new();
        table.record(&ResultEnvelope::success("c1", json!("item")));
        table.record(&ResultEnvelope::success("cpu", json!("item")));

        let mut snapshot = Snapshot::new();
        snapshot.insert("cpu".into(), json!("batch"));
        snapshot.insert("memory".into(), json!("batch"));
        table.merge_into(&mut snapshot);

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["memory"], json!("batch"));
        assert_eq!(snapshot["cpu"], json!("item"));
        assert_eq!(snapshot["c1"], json!("item"));
    }

    #[test]
    fn forget_removes_only_named_entries() {
        let table = LastValues::new();
        table.record(&ResultEnvelope::success("a", json!(1)));
        table.record(&ResultEnvelope::success("b", json!(2)));
        table.forget(["a"]);
        assert_eq!(table.get("a"), None);
        assert_eq!(table.get("b"), Some(json!(2)));
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut snapshot = Snapshot::new();
        snapshot.insert("z".into(), json!(1));
        snapshot.insert("a".into(), json!({"y": 1, "b": 2}));
        let bytes = encode_snapshot(&snapshot).unwrap();
        assert_eq!(bytes, encode_snapshot(&snapshot.clone()).unwrap());
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":{"b":2,"y":1},"z":1}"#);
    }

    #[test]
    fn unchanged_items_encode_identically_across_batches() {
        let table = LastValues::new();
        table.record(&ResultEnvelope::success("c1", json!({"queue": 3, "state": "ok"})));
        table.record::<i32>(&ResultEnvelope::failure("c2", "exit status 1"));

        let encode_items = |cpu: f64| {
            let mut snapshot = Snapshot::new();
            snapshot.insert("cpu".into(), json!(cpu));
            table.merge_into(&mut snapshot);
            snapshot.remove("cpu");
            encode_snapshot(&snapshot).unwrap()
        };
        assert_eq!(encode_items(12.5), encode_items(97.0));
    }

    #[test]
    fn encoding_failure_falls_back_to_error_document() {
        let bytes = encode_snapshot(&Unencodable).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["error"], "sensor returned garbage");
    }
}
