use parking_lot::RwLock;
use serde_json::{Map, Value};
use texplorer_core::host::ConfigStore;

/// In-memory JSON settings document addressed by dotted keys.
pub struct SettingsStore {
    document: RwLock<Value>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    pub fn from_value(document: Value) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Set `key` (e.g. `texplorer.runner.command`), creating intermediate
    /// objects. Returns whether the stored value changed.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let mut doc = self.document.write();
        let mut parts = key.split('.').peekable();
        let mut cursor = &mut *doc;

        while let Some(part) = parts.next() {
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }
            let Value::Object(map) = cursor else {
                return false;
            };
            if parts.peek().is_none() {
                if map.get(part) == Some(&value) {
                    return false;
                }
                let _ = map.insert(part.to_string(), value);
                return true;
            }
            cursor = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        false
    }

    /// Remove `key`. Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let mut doc = self.document.write();
        let (parent, leaf) = match key.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, key),
        };
        let target = match parent {
            Some(p) => lookup_mut(&mut doc, p),
            None => Some(&mut *doc),
        };
        match target {
            Some(Value::Object(map)) => map.remove(leaf).is_some(),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Value {
        self.document.read().clone()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for SettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        let doc = self.document.read();
        let mut cursor = &*doc;
        for part in key.split('.') {
            cursor = cursor.as_object()?.get(part)?;
        }
        Some(cursor.clone())
    }
}

fn lookup_mut<'a>(doc: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    let mut cursor = doc;
    for part in key.split('.') {
        cursor = cursor.as_object_mut()?.get_mut(part)?;
    }
    Some(cursor)
}
