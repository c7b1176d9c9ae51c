use std::collections::BTreeMap;

use serde_json::Value;

/// The mutable scope map visible to expressions during one render.
///
/// Contexts are shared by reference between sibling nodes of a render:
/// helpers that overlay keys (`each`, `with`) must restore the prior
/// values before returning, which is what [`ContextOverlay`] is for.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object. Non-object values land under
    /// the `this` key.
    pub fn from_value(value: Value) -> Self {
        let mut context = Self::new();
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    context.data.insert(key, value);
                }
            }
            Value::Null => {}
            other => {
                context.data.insert("this".to_string(), other);
            }
        }
        context
    }

    pub fn insert<T: AsRef<str>>(&mut self, name: T, value: Value) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value);
        self
    }

    pub fn get<T: AsRef<str>>(&self, name: T) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<T: AsRef<str>>(&self, name: T) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn remove<T: AsRef<str>>(&mut self, name: T) -> Option<Value> {
        self.data.remove(name.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole context as a JSON object. Used when `this` refers to
    /// the context itself.
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone().into_iter().collect())
    }

    /// Walk a dot-separated path against the context.
    ///
    /// `this` as the first segment resolves to the `this` key if one is
    /// present, otherwise to the context itself. A missing intermediate
    /// yields `None` rather than an error.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current: Value = if first == "this" {
            match self.data.get("this") {
                Some(value) => value.clone(),
                None => self.to_value(),
            }
        } else {
            self.data.get(first)?.clone()
        };
        for segment in segments {
            match current {
                Value::Object(ref map) => {
                    current = map.get(segment)?.clone();
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Write `value` at a (possibly dotted, possibly `this`-prefixed)
    /// path, creating intermediate objects as needed. An intermediate
    /// that exists but is not an object is replaced by one.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() {
            return;
        }
        if segments[0] == "this" && segments.len() > 1 && self.data.contains_key("this") {
            // Mirror lookup: `this.x` writes inside the current focus
            // value when one exists.
            let root = self
                .data
                .entry("this".to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_in_value(root, &segments[1..], value);
            return;
        }
        let segments = if segments[0] == "this" && segments.len() > 1 {
            &segments[1..]
        } else {
            &segments[..]
        };
        if segments.len() == 1 {
            self.data.insert(segments[0].to_string(), value);
            return;
        }
        let root = self
            .data
            .entry(segments[0].to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        set_in_value(root, &segments[1..], value);
    }
}

fn set_in_value(target: &mut Value, segments: &[&str], value: Value) {
    if segments.is_empty() {
        *target = value;
        return;
    }
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let map = match target.as_object_mut() {
        Some(map) => map,
        None => return,
    };
    let entry = map
        .entry(segments[0].to_string())
        .or_insert(Value::Null);
    if segments.len() == 1 {
        *entry = value;
    } else {
        set_in_value(entry, &segments[1..], value);
    }
}

/// Records the prior state of overlaid context keys so a helper can
/// restore them before returning. Restoration reinserts the prior value
/// or removes the key if it was absent.
#[derive(Debug, Default)]
pub struct ContextOverlay {
    saved: Vec<(String, Option<Value>)>,
}

impl ContextOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `value` under `key`, remembering the value it shadowed
    /// the first time the key is touched.
    pub fn set(&mut self, context: &mut Context, key: &str, value: Value) {
        if !self.saved.iter().any(|(saved_key, _)| saved_key == key) {
            self.saved
                .push((key.to_string(), context.get(key).cloned()));
        }
        context.insert(key, value);
    }

    /// Put every overlaid key back the way it was.
    pub fn restore(self, context: &mut Context) {
        for (key, prior) in self.saved.into_iter().rev() {
            match prior {
                Some(value) => {
                    context.insert(&key, value);
                }
                None => {
                    context.remove(&key);
                }
            }
        }
    }
}
