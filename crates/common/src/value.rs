//! Provider values and their conversion into plain persisted data
//!
//! The cloud API answers with typed element trees. The orchestrator's
//! runtime-property store only accepts plain JSON, so everything headed for
//! persistence goes through [`DynamicValue::to_plain`] first.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-node-instance persisted key/value bag.
pub type RuntimeProperties = Map<String, Value>;

/// Typed leaf payload of a provider element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn to_plain(&self) -> Value {
        match self {
            Scalar::Int(n) => Value::from(*n),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Provider-native element: a tag with attributes, an optional typed value,
/// optional untyped text and child elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub value: Option<Scalar>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Leaf holding an integer.
    pub fn int(tag: impl Into<String>, value: i64) -> Self {
        Self {
            value: Some(Scalar::Int(value)),
            ..Self::new(tag)
        }
    }

    /// Leaf holding a boolean.
    pub fn boolean(tag: impl Into<String>, value: bool) -> Self {
        Self {
            value: Some(Scalar::Bool(value)),
            ..Self::new(tag)
        }
    }

    /// Leaf holding a string.
    pub fn string(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: Some(Scalar::Str(value.into())),
            ..Self::new(tag)
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// First child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// All children with the given tag.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// String form of a leaf, whatever its typed value.
    pub fn leaf_text(&self) -> Option<String> {
        match &self.value {
            Some(Scalar::Int(n)) => Some(n.to_string()),
            Some(Scalar::Bool(b)) => Some(b.to_string()),
            Some(Scalar::Str(s)) => Some(s.clone()),
            None => self.text.clone(),
        }
    }

    /// Text of the first child with the given tag.
    pub fn child_text(&self, tag: &str) -> Option<String> {
        self.child(tag).and_then(Element::leaf_text)
    }

    /// Attribute pairs, as the provider lists them for tasks.
    pub fn items(&self) -> Vec<DynamicValue> {
        self.attributes
            .iter()
            .map(|(k, v)| DynamicValue::Pair(k.clone(), Box::new(DynamicValue::String(v.clone()))))
            .collect()
    }

    fn to_plain(&self) -> Value {
        if let Some(value) = &self.value {
            return value.to_plain();
        }
        if self.children.is_empty() && self.attributes.is_empty() {
            return match &self.text {
                Some(text) => Value::String(text.clone()),
                None => Value::Null,
            };
        }

        let mut map = Map::new();
        for (key, value) in &self.attributes {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        for child in &self.children {
            let converted = child.to_plain();
            match map.get_mut(&child.tag) {
                // Repeated tags collapse into a list
                Some(Value::Array(items)) if self.children_named(&child.tag).count() > 1 => {
                    items.push(converted);
                }
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, converted]);
                }
                None => {
                    if self.children_named(&child.tag).count() > 1 {
                        map.insert(child.tag.clone(), Value::Array(vec![converted]));
                    } else {
                        map.insert(child.tag.clone(), converted);
                    }
                }
            }
        }
        Value::Object(map)
    }
}

/// A value on its way from the provider to the persisted store.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<DynamicValue>),
    Map(BTreeMap<String, DynamicValue>),
    /// A key/value tuple.
    Pair(String, Box<DynamicValue>),
    Element(Element),
}

impl DynamicValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DynamicValue>> {
        match self {
            DynamicValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_map()?.get(key)
    }

    /// Deep-convert into plain JSON: scalars are extracted from typed element
    /// wrappers, pairs become single-entry maps, and elements become maps of
    /// their attributes and children.
    pub fn to_plain(&self) -> Value {
        match self {
            DynamicValue::Null => Value::Null,
            DynamicValue::Bool(b) => Value::Bool(*b),
            DynamicValue::Number(n) => Value::Number(n.clone()),
            DynamicValue::String(s) => Value::String(s.clone()),
            DynamicValue::List(items) => {
                Value::Array(items.iter().map(DynamicValue::to_plain).collect())
            }
            DynamicValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain()))
                    .collect(),
            ),
            DynamicValue::Pair(key, value) => {
                let mut map = Map::new();
                map.insert(key.clone(), value.to_plain());
                Value::Object(map)
            }
            DynamicValue::Element(element) => element.to_plain(),
        }
    }
}

impl Default for DynamicValue {
    fn default() -> Self {
        DynamicValue::Null
    }
}

impl From<Value> for DynamicValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => DynamicValue::Null,
            Value::Bool(b) => DynamicValue::Bool(b),
            Value::Number(n) => DynamicValue::Number(n),
            Value::String(s) => DynamicValue::String(s),
            Value::Array(items) => {
                DynamicValue::List(items.into_iter().map(DynamicValue::from).collect())
            }
            Value::Object(map) => DynamicValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, DynamicValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Element> for DynamicValue {
    fn from(element: Element) -> Self {
        DynamicValue::Element(element)
    }
}

impl From<Vec<Element>> for DynamicValue {
    fn from(elements: Vec<Element>) -> Self {
        DynamicValue::List(elements.into_iter().map(DynamicValue::Element).collect())
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::String(s.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        DynamicValue::String(s)
    }
}

impl From<i64> for DynamicValue {
    fn from(n: i64) -> Self {
        DynamicValue::Number(serde_json::Number::from(n))
    }
}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        DynamicValue::Bool(b)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DynamicValue::Null)
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_plain().serialize(serializer)
    }
}

/// Build a DynamicValue map with the given entries
pub fn make_map(entries: Vec<(&str, DynamicValue)>) -> DynamicValue {
    DynamicValue::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Deep conversion of an already-plain tree; a no-op by construction.
pub fn to_plain_value(value: &Value) -> Value {
    DynamicValue::from(value.clone()).to_plain()
}

/// Helper to extract a string property
pub fn get_str<'a>(props: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

/// Helper to extract a bool property
pub fn get_bool(props: &Map<String, Value>, key: &str, default: bool) -> bool {
    props.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Helper to extract a nested map property
pub fn get_map<'a>(props: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    props.get(key).and_then(Value::as_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_gateway() -> Element {
        Element::new("EdgeGateway")
            .with_attr("name", "edge1")
            .with_attr("href", "https://vcd/api/edgeGateway/1")
            .with_child(Element::string("gatewayAddress", "10.0.0.1"))
            .with_child(Element::int("mtu", 1500))
            .with_child(Element::boolean("enabled", true))
            .with_child(
                Element::new("ipPool")
                    .with_child(Element::string("ipRange", "10.0.0.10-10.0.0.20")),
            )
            .with_child(
                Element::new("ipPool")
                    .with_child(Element::string("ipRange", "10.0.1.10-10.0.1.20")),
            )
    }

    #[test]
    fn test_typed_leaves_become_scalars() {
        let plain = DynamicValue::from(sample_gateway()).to_plain();
        assert_eq!(plain["gatewayAddress"], json!("10.0.0.1"));
        assert_eq!(plain["mtu"], json!(1500));
        assert_eq!(plain["enabled"], json!(true));
        assert_eq!(plain["name"], json!("edge1"));
    }

    #[test]
    fn test_repeated_children_become_list() {
        let plain = DynamicValue::from(sample_gateway()).to_plain();
        let pools = plain["ipPool"].as_array().unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[1]["ipRange"], json!("10.0.1.10-10.0.1.20"));
    }

    #[test]
    fn test_pairs_become_single_entry_maps() {
        let task = Element::new("Task")
            .with_attr("id", "urn:task:1")
            .with_attr("status", "running");
        let plain = DynamicValue::List(task.items()).to_plain();
        assert_eq!(plain, json!([{"id": "urn:task:1"}, {"status": "running"}]));
    }

    #[test]
    fn test_text_only_element() {
        let element = Element::new("Description").with_text("hello");
        assert_eq!(DynamicValue::from(element).to_plain(), json!("hello"));
        assert_eq!(DynamicValue::from(Element::new("Empty")).to_plain(), Value::Null);
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let mixed = make_map(vec![
            ("gateway", sample_gateway().into()),
            ("tasks", DynamicValue::List(Element::new("Task").with_attr("id", "t").items())),
            ("count", 3i64.into()),
            ("missing", DynamicValue::from(None::<String>)),
        ]);
        let once = mixed.to_plain();
        let twice = to_plain_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_serialize_uses_plain_form() {
        let value = DynamicValue::from(Element::int("size", 10));
        assert_eq!(serde_json::to_string(&value).unwrap(), "10");
    }
}
