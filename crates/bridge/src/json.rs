//! Typed path lookups over loosely shaped device JSON.
//!
//! Firmware versions add and drop fields freely, so every read goes through
//! [`get`] and a missing or mistyped value simply comes back as `None`.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub enum Seg<'a> {
    Key(&'a str),
    Idx(usize),
}

impl<'a> From<&'a str> for Seg<'a> {
    fn from(key: &'a str) -> Self {
        Seg::Key(key)
    }
}

impl From<usize> for Seg<'_> {
    fn from(idx: usize) -> Self {
        Seg::Idx(idx)
    }
}

/// Build a `&[Seg]` path: `json_path!["settings", "lrun", idx]`.
macro_rules! json_path {
    ($($seg:expr),* $(,)?) => {
        &[$($crate::json::Seg::from($seg)),*][..]
    };
}
pub(crate) use json_path;

/// Conversion from a JSON leaf. Integers are accepted for booleans because
/// the device encodes flags as `0`/`1`.
pub trait FromJson: Sized {
    fn from_json(v: &Value) -> Option<Self>;
}

impl FromJson for i64 {
    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }
}

impl FromJson for u8 {
    fn from_json(v: &Value) -> Option<Self> {
        i64::from_json(v).and_then(|n| u8::try_from(n).ok())
    }
}

impl FromJson for u16 {
    fn from_json(v: &Value) -> Option<Self> {
        i64::from_json(v).and_then(|n| u16::try_from(n).ok())
    }
}

impl FromJson for bool {
    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Bool(b) => Some(*b),
            Value::Number(_) => i64::from_json(v).map(|n| n != 0),
            _ => None,
        }
    }
}

impl FromJson for String {
    fn from_json(v: &Value) -> Option<Self> {
        v.as_str().map(str::to_owned)
    }
}

/// Arrays convert element-wise; one bad element rejects the whole array.
impl<T: FromJson> FromJson for Vec<T> {
    fn from_json(v: &Value) -> Option<Self> {
        v.as_array()?.iter().map(T::from_json).collect()
    }
}

/// Walk `path` into `doc`.
pub fn lookup<'v>(doc: &'v Value, path: &[Seg<'_>]) -> Option<&'v Value> {
    path.iter().try_fold(doc, |node, seg| match (seg, node) {
        (Seg::Key(k), Value::Object(map)) => map.get(*k),
        (Seg::Idx(i), Value::Array(items)) => items.get(*i),
        _ => None,
    })
}

pub fn get<T: FromJson>(doc: &Value, path: &[Seg<'_>]) -> Option<T> {
    lookup(doc, path).and_then(T::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_and_indices() {
        let doc = json!({"settings": {"lrun": [3, 1, 600, 1700000000]}});
        assert_eq!(get::<i64>(&doc, json_path!["settings", "lrun", 2usize]), Some(600));
        assert_eq!(get::<i64>(&doc, json_path!["settings", "lrun", 9usize]), None);
        assert_eq!(get::<i64>(&doc, json_path!["settings", "nope"]), None);
    }

    #[test]
    fn wrong_shape_is_absent() {
        let doc = json!({"settings": [1, 2]});
        assert_eq!(get::<i64>(&doc, json_path!["settings", "en"]), None);
        assert_eq!(get::<String>(&json!({"a": 1}), json_path!["a"]), None);
    }

    #[test]
    fn integer_flags_read_as_bool() {
        let doc = json!({"en": 1, "rd": 0, "b": true});
        assert_eq!(get::<bool>(&doc, json_path!["en"]), Some(true));
        assert_eq!(get::<bool>(&doc, json_path!["rd"]), Some(false));
        assert_eq!(get::<bool>(&doc, json_path!["b"]), Some(true));
    }

    #[test]
    fn byte_arrays_reject_out_of_range() {
        let doc = json!({"ok": [1, 255], "bad": [1, 256]});
        assert_eq!(get::<Vec<u8>>(&doc, json_path!["ok"]), Some(vec![1, 255]));
        assert_eq!(get::<Vec<u8>>(&doc, json_path!["bad"]), None);
    }
}
