//! Query parameter overlay applied on top of the configured endpoints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;
use url::Url;

/// A scalar query parameter value.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Number(Number),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Number(value.into())
    }
}

/// Merge `partial` into `overlay`; keys in `partial` win.
pub(crate) fn merge(overlay: &mut BTreeMap<String, ParamValue>, partial: BTreeMap<String, ParamValue>) {
    overlay.extend(partial);
}

/// Apply `overlay` to `endpoint`, overwriting existing query pairs with the same key.
///
/// Pairs already present on the endpoint keep their order; overlay pairs follow in key order.
#[must_use]
pub fn effective_url(endpoint: &Url, overlay: &BTreeMap<String, ParamValue>) -> Url {
    if overlay.is_empty() {
        return endpoint.clone();
    }

    let retained: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(key, _)| !overlay.contains_key(key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = endpoint.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        for (key, value) in overlay {
            pairs.append_pair(key, &value.to_string());
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay<const N: usize>(pairs: [(&str, ParamValue); N]) -> BTreeMap<String, ParamValue> {
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect()
    }

    #[test]
    fn merge_keeps_earlier_keys_and_overwrites_same_key() {
        let mut current = overlay([("a", 1.into())]);
        merge(&mut current, overlay([("b", 2.into())]));
        merge(&mut current, overlay([("a", "x".into())]));

        assert_eq!(current.len(), 2);
        assert_eq!(current["a"], ParamValue::from("x"));
        assert_eq!(current["b"], ParamValue::from(2));
    }

    #[test]
    fn empty_overlay_leaves_url_untouched() {
        let url = Url::parse("wss://example.com/ws?token=abc").unwrap();
        assert_eq!(effective_url(&url, &BTreeMap::new()), url);
    }

    #[test]
    fn overlay_overwrites_and_appends() {
        let url = Url::parse("wss://example.com/ws?token=abc&room=1").unwrap();
        let params = overlay([("room", 7.into()), ("debug", true.into())]);

        let effective = effective_url(&url, &params);

        assert_eq!(
            effective.as_str(),
            "wss://example.com/ws?token=abc&debug=true&room=7"
        );
    }

    #[test]
    fn values_are_url_encoded() {
        let url = Url::parse("ws://localhost:9000/").unwrap();
        let params = overlay([("name", "a b&c".into())]);

        assert_eq!(
            effective_url(&url, &params).as_str(),
            "ws://localhost:9000/?name=a+b%26c"
        );
    }

    #[test]
    fn untagged_deserialization() {
        let values: Vec<ParamValue> = serde_json::from_str(r#"["x", 3, false]"#).unwrap();
        assert_eq!(
            values,
            vec![ParamValue::from("x"), ParamValue::from(3), ParamValue::from(false)]
        );
    }
}
