//! Component configuration merging.
//!
//! Per-component settings arrive as flat dotted keys
//! (`istio.gateway.replicas = 2`). Before dispatch they are merged into one
//! nested JSON structure with a fixed precedence: profile defaults first,
//! then per-component overrides, then global overrides. Later layers win on
//! key conflicts.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Defaults contributed by the configuration's profile, keyed per component.
#[derive(Clone, Debug, Default)]
pub struct ProfileDefaults {
    per_component: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ProfileDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        component: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> &mut Self {
        self.per_component
            .entry(component.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    pub fn for_component(&self, component: &str) -> Option<&BTreeMap<String, Value>> {
        self.per_component.get(component)
    }
}

/// Merge the override layers for one component into a nested structure.
///
/// Precedence, lowest to highest: profile defaults, component overrides,
/// global overrides. Keys are iterated in sorted order so the result is
/// deterministic.
pub fn merge_component_configuration(
    profile_defaults: Option<&BTreeMap<String, Value>>,
    component_overrides: &BTreeMap<String, Value>,
    global_overrides: &BTreeMap<String, Value>,
) -> Value {
    let mut root = Map::new();
    if let Some(defaults) = profile_defaults {
        for (key, value) in defaults {
            insert_dotted(&mut root, key, value.clone());
        }
    }
    for (key, value) in component_overrides {
        insert_dotted(&mut root, key, value.clone());
    }
    for (key, value) in global_overrides {
        insert_dotted(&mut root, key, value.clone());
    }
    Value::Object(root)
}

/// Insert `a.b.c = v` into the map as `{"a":{"b":{"c":v}}}`.
///
/// A scalar sitting where a deeper path needs an object is replaced by that
/// object; the later layer wins.
fn insert_dotted(root: &mut Map<String, Value>, dotted_key: &str, value: Value) {
    let mut segments = dotted_key.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().unwrap_or_else(|| unreachable!());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_dotted_keys_nest() {
        let merged = merge_component_configuration(
            None,
            &flat(&[
                ("istio.gateway.replicas", json!(2)),
                ("istio.gateway.name", json!("ingress")),
                ("logLevel", json!("info")),
            ]),
            &BTreeMap::new(),
        );
        assert_eq!(
            merged,
            json!({
                "istio": {"gateway": {"replicas": 2, "name": "ingress"}},
                "logLevel": "info"
            })
        );
    }

    #[test]
    fn test_precedence_profile_component_global() {
        let profile = flat(&[("replicas", json!(1)), ("profileOnly", json!(true))]);
        let component = flat(&[("replicas", json!(2)), ("componentOnly", json!(true))]);
        let global = flat(&[("replicas", json!(3))]);
        let merged = merge_component_configuration(Some(&profile), &component, &global);
        assert_eq!(
            merged,
            json!({
                "replicas": 3,
                "profileOnly": true,
                "componentOnly": true
            })
        );
    }

    #[test]
    fn test_deeper_path_replaces_scalar() {
        let component = flat(&[("a", json!("scalar"))]);
        let global = flat(&[("a.b", json!(1))]);
        let merged = merge_component_configuration(None, &component, &global);
        assert_eq!(merged, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let component = flat(&[("b.x", json!(1)), ("a.y", json!(2))]);
        let first = merge_component_configuration(None, &component, &BTreeMap::new());
        let second = merge_component_configuration(None, &component, &BTreeMap::new());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_profile_defaults_lookup() {
        let mut defaults = ProfileDefaults::new();
        defaults.set("istio", "replicas", json!(1));
        assert!(defaults.for_component("istio").is_some());
        assert!(defaults.for_component("serverless").is_none());
    }
}
