//! Ordered property maps with typed value arrays.
//!
//! Maps behave as value types: handing one to a callee never exposes the
//! caller to mutation, because the storage sits behind a copy-on-write
//! container. A sticky error string displaces all values once set.

use std::sync::Arc;

use crate::error::PropError;
use crate::frame::{Frame, MediaType};
use crate::node::NodeHandle;
use crate::plugin::FuncRef;

/// Write disposition for map updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Add to an existing array of the same type, or create it.
    Append,
    /// Replace whatever the key held before.
    Replace,
    /// Create an empty entry if missing; never overwrite.
    Touch,
}

/// Interpretation hint for data values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataHint {
    Unknown,
    Binary,
    Utf8,
}

/// A byte payload with its interpretation hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub bytes: Vec<u8>,
    pub hint: DataHint,
}

impl DataItem {
    pub fn utf8(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
            hint: DataHint::Utf8,
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            hint: DataHint::Binary,
        }
    }
}

/// Type tag of a property value array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropType {
    Int,
    Float,
    Data,
    Function,
    VideoNode,
    AudioNode,
    VideoFrame,
    AudioFrame,
}

/// A typed array of values stored under one key.
#[derive(Clone)]
pub enum Value {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Data(Vec<DataItem>),
    VideoNode(Vec<NodeHandle>),
    AudioNode(Vec<NodeHandle>),
    VideoFrame(Vec<Frame>),
    AudioFrame(Vec<Frame>),
    Function(Vec<FuncRef>),
}

impl Value {
    pub fn prop_type(&self) -> PropType {
        match self {
            Value::Int(_) => PropType::Int,
            Value::Float(_) => PropType::Float,
            Value::Data(_) => PropType::Data,
            Value::VideoNode(_) => PropType::VideoNode,
            Value::AudioNode(_) => PropType::AudioNode,
            Value::VideoFrame(_) => PropType::VideoFrame,
            Value::AudioFrame(_) => PropType::AudioFrame,
            Value::Function(_) => PropType::Function,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Int(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Data(v) => v.len(),
            Value::VideoNode(v) => v.len(),
            Value::AudioNode(v) => v.len(),
            Value::VideoFrame(v) => v.len(),
            Value::AudioFrame(v) => v.len(),
            Value::Function(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn empty_of(prop_type: PropType) -> Value {
        match prop_type {
            PropType::Int => Value::Int(Vec::new()),
            PropType::Float => Value::Float(Vec::new()),
            PropType::Data => Value::Data(Vec::new()),
            PropType::VideoNode => Value::VideoNode(Vec::new()),
            PropType::AudioNode => Value::AudioNode(Vec::new()),
            PropType::VideoFrame => Value::VideoFrame(Vec::new()),
            PropType::AudioFrame => Value::AudioFrame(Vec::new()),
            PropType::Function => Value::Function(Vec::new()),
        }
    }

    /// Append `other`'s elements onto `self`; both must share a type.
    fn extend_from(&mut self, other: Value) -> Result<(), PropError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.extend(b),
            (Value::Float(a), Value::Float(b)) => a.extend(b),
            (Value::Data(a), Value::Data(b)) => a.extend(b),
            (Value::VideoNode(a), Value::VideoNode(b)) => a.extend(b),
            (Value::AudioNode(a), Value::AudioNode(b)) => a.extend(b),
            (Value::VideoFrame(a), Value::VideoFrame(b)) => a.extend(b),
            (Value::AudioFrame(a), Value::AudioFrame(b)) => a.extend(b),
            (Value::Function(a), Value::Function(b)) => a.extend(b),
            _ => return Err(PropError::WrongType),
        }
        Ok(())
    }
}

/// Map keys may start with a letter or underscore; underscore-prefixed
/// keys are conventionally reserved for well-known frame properties.
pub fn is_valid_map_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Clone, Default)]
struct MapData {
    error: Option<String>,
    entries: Vec<(String, Value)>,
}

/// Ordered mapping of keys to typed value arrays.
#[derive(Clone, Default)]
pub struct PropertyMap {
    data: Arc<MapData>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.entries.is_empty()
    }

    /// Key at insertion-order position `index`.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.data.entries.get(index).map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn prop_type(&self, key: &str) -> Option<PropType> {
        self.find(key).map(|v| v.prop_type())
    }

    pub fn num_elements(&self, key: &str) -> Option<usize> {
        self.find(key).map(|v| v.len())
    }

    pub fn delete_key(&mut self, key: &str) -> bool {
        let data = Arc::make_mut(&mut self.data);
        let before = data.entries.len();
        data.entries.retain(|(k, _)| k != key);
        data.entries.len() != before
    }

    pub fn clear(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        data.entries.clear();
        data.error = None;
    }

    /// Set the sticky error. All values are discarded and subsequent
    /// typed reads fail with the stored text; the first error wins.
    pub fn set_error(&mut self, msg: &str) {
        let data = Arc::make_mut(&mut self.data);
        data.entries.clear();
        if data.error.is_none() {
            data.error = Some(msg.to_string());
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.data.error.as_deref()
    }

    fn find(&self, key: &str) -> Option<&Value> {
        self.data
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Shared write path handling key validation, the sticky error and
    /// the three write modes.
    fn write(&mut self, key: &str, value: Value, mode: AppendMode) -> Result<(), PropError> {
        if !is_valid_map_key(key) {
            return Err(PropError::InvalidKey);
        }
        if let Some(err) = &self.data.error {
            return Err(PropError::MapError(err.clone()));
        }

        let data = Arc::make_mut(&mut self.data);
        let position = data.entries.iter().position(|(k, _)| k == key);
        match (mode, position) {
            (AppendMode::Replace, Some(i)) => {
                data.entries[i].1 = value;
                Ok(())
            }
            (AppendMode::Replace, None) | (AppendMode::Append, None) => {
                data.entries.push((key.to_string(), value));
                Ok(())
            }
            (AppendMode::Append, Some(i)) => data.entries[i].1.extend_from(value),
            (AppendMode::Touch, Some(_)) => Ok(()),
            (AppendMode::Touch, None) => {
                data.entries
                    .push((key.to_string(), Value::empty_of(value.prop_type())));
                Ok(())
            }
        }
    }

    /// Create an empty entry of the given type if the key is missing.
    pub fn touch(&mut self, key: &str, prop_type: PropType) -> Result<(), PropError> {
        self.write(key, Value::empty_of(prop_type), AppendMode::Touch)
    }

    fn read(&self, key: &str) -> Result<&Value, PropError> {
        if let Some(err) = &self.data.error {
            return Err(PropError::MapError(err.clone()));
        }
        self.find(key).ok_or(PropError::Unset)
    }

    // ── Typed accessors ────────────────────────────────────────

    pub fn set_int(&mut self, key: &str, value: i64, mode: AppendMode) -> Result<(), PropError> {
        self.write(key, Value::Int(vec![value]), mode)
    }

    pub fn set_int_array(&mut self, key: &str, values: &[i64]) -> Result<(), PropError> {
        self.write(key, Value::Int(values.to_vec()), AppendMode::Replace)
    }

    pub fn get_int(&self, key: &str, index: usize) -> Result<i64, PropError> {
        match self.read(key)? {
            Value::Int(v) => v.get(index).copied().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn get_int_array(&self, key: &str) -> Result<&[i64], PropError> {
        match self.read(key)? {
            Value::Int(v) => Ok(v),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn set_float(&mut self, key: &str, value: f64, mode: AppendMode) -> Result<(), PropError> {
        self.write(key, Value::Float(vec![value]), mode)
    }

    pub fn set_float_array(&mut self, key: &str, values: &[f64]) -> Result<(), PropError> {
        self.write(key, Value::Float(values.to_vec()), AppendMode::Replace)
    }

    pub fn get_float(&self, key: &str, index: usize) -> Result<f64, PropError> {
        match self.read(key)? {
            Value::Float(v) => v.get(index).copied().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn get_float_array(&self, key: &str) -> Result<&[f64], PropError> {
        match self.read(key)? {
            Value::Float(v) => Ok(v),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn set_data(&mut self, key: &str, value: DataItem, mode: AppendMode) -> Result<(), PropError> {
        self.write(key, Value::Data(vec![value]), mode)
    }

    pub fn get_data(&self, key: &str, index: usize) -> Result<&DataItem, PropError> {
        match self.read(key)? {
            Value::Data(v) => v.get(index).ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    /// Convenience for UTF-8 data values.
    pub fn get_utf8(&self, key: &str, index: usize) -> Result<&str, PropError> {
        let item = self.get_data(key, index)?;
        std::str::from_utf8(&item.bytes).map_err(|_| PropError::WrongType)
    }

    pub fn set_node(&mut self, key: &str, node: NodeHandle, mode: AppendMode) -> Result<(), PropError> {
        let value = match node.media_type() {
            MediaType::Video => Value::VideoNode(vec![node]),
            MediaType::Audio => Value::AudioNode(vec![node]),
        };
        self.write(key, value, mode)
    }

    pub fn get_video_node(&self, key: &str, index: usize) -> Result<NodeHandle, PropError> {
        match self.read(key)? {
            Value::VideoNode(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn get_audio_node(&self, key: &str, index: usize) -> Result<NodeHandle, PropError> {
        match self.read(key)? {
            Value::AudioNode(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn set_frame(&mut self, key: &str, frame: Frame, mode: AppendMode) -> Result<(), PropError> {
        let value = match frame.media_type() {
            MediaType::Video => Value::VideoFrame(vec![frame]),
            MediaType::Audio => Value::AudioFrame(vec![frame]),
        };
        self.write(key, value, mode)
    }

    pub fn get_video_frame(&self, key: &str, index: usize) -> Result<Frame, PropError> {
        match self.read(key)? {
            Value::VideoFrame(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn get_audio_frame(&self, key: &str, index: usize) -> Result<Frame, PropError> {
        match self.read(key)? {
            Value::AudioFrame(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    pub fn set_function(&mut self, key: &str, func: FuncRef, mode: AppendMode) -> Result<(), PropError> {
        self.write(key, Value::Function(vec![func]), mode)
    }

    pub fn get_function(&self, key: &str, index: usize) -> Result<FuncRef, PropError> {
        match self.read(key)? {
            Value::Function(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    // ── Generation compatibility ───────────────────────────────

    /// Whether this map can cross into the legacy API: it must carry no
    /// audio nodes or audio frames.
    pub fn is_legacy_safe(&self) -> bool {
        !self
            .data
            .entries
            .iter()
            .any(|(_, v)| matches!(v.prop_type(), PropType::AudioNode | PropType::AudioFrame))
    }

    /// Whether any video node in the map outputs a compat color family.
    pub fn has_compat_nodes(&self) -> bool {
        self.data.entries.iter().any(|(_, v)| match v {
            Value::VideoNode(nodes) => nodes.iter().any(|n| n.has_compat_output()),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_keys() {
        let mut map = PropertyMap::new();
        map.set_int("b", 1, AppendMode::Replace).unwrap();
        map.set_int("a", 2, AppendMode::Replace).unwrap();
        map.set_float("c", 3.0, AppendMode::Replace).unwrap();
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(map.key(1), Some("a"));
    }

    #[test]
    fn append_grows_array() {
        let mut map = PropertyMap::new();
        map.set_int("x", 1, AppendMode::Append).unwrap();
        map.set_int("x", 2, AppendMode::Append).unwrap();
        assert_eq!(map.get_int_array("x").unwrap(), &[1, 2]);
    }

    #[test]
    fn append_type_mismatch_fails() {
        let mut map = PropertyMap::new();
        map.set_int("x", 1, AppendMode::Append).unwrap();
        assert_eq!(
            map.set_float("x", 2.0, AppendMode::Append),
            Err(PropError::WrongType)
        );
    }

    #[test]
    fn replace_overwrites() {
        let mut map = PropertyMap::new();
        map.set_int("x", 1, AppendMode::Append).unwrap();
        map.set_float("x", 2.5, AppendMode::Replace).unwrap();
        assert_eq!(map.get_float("x", 0).unwrap(), 2.5);
        assert_eq!(map.get_int("x", 0), Err(PropError::WrongType));
    }

    #[test]
    fn touch_creates_empty_and_preserves() {
        let mut map = PropertyMap::new();
        map.touch("x", PropType::Int).unwrap();
        assert_eq!(map.num_elements("x"), Some(0));
        map.set_int("x", 7, AppendMode::Append).unwrap();
        map.touch("x", PropType::Int).unwrap();
        assert_eq!(map.get_int_array("x").unwrap(), &[7]);
    }

    #[test]
    fn sticky_error_displaces_values() {
        let mut map = PropertyMap::new();
        map.set_int("x", 1, AppendMode::Replace).unwrap();
        map.set_error("first failure");
        assert_eq!(map.error(), Some("first failure"));
        assert!(matches!(map.get_int("x", 0), Err(PropError::MapError(_))));
        // First error wins.
        map.set_error("second failure");
        assert_eq!(map.error(), Some("first failure"));
        // Writes after an error fail too.
        assert!(map.set_int("y", 2, AppendMode::Replace).is_err());
    }

    #[test]
    fn cow_isolates_clones() {
        let mut a = PropertyMap::new();
        a.set_int("x", 1, AppendMode::Replace).unwrap();
        let b = a.clone();
        a.set_int("x", 2, AppendMode::Replace).unwrap();
        assert_eq!(a.get_int("x", 0).unwrap(), 2);
        assert_eq!(b.get_int("x", 0).unwrap(), 1);
    }

    #[test]
    fn key_validation() {
        assert!(is_valid_map_key("_Matrix"));
        assert!(is_valid_map_key("clip"));
        assert!(!is_valid_map_key("9lives"));
        assert!(!is_valid_map_key(""));
        assert!(!is_valid_map_key("bad-key"));

        let mut map = PropertyMap::new();
        assert_eq!(
            map.set_int("bad-key", 1, AppendMode::Replace),
            Err(PropError::InvalidKey)
        );
    }

    #[test]
    fn missing_and_out_of_range_reads() {
        let mut map = PropertyMap::new();
        assert_eq!(map.get_int("missing", 0), Err(PropError::Unset));
        map.set_int("x", 1, AppendMode::Replace).unwrap();
        assert_eq!(map.get_int("x", 5), Err(PropError::Index));
    }

    #[test]
    fn utf8_accessor() {
        let mut map = PropertyMap::new();
        map.set_data("s", DataItem::utf8("hello"), AppendMode::Replace)
            .unwrap();
        assert_eq!(map.get_utf8("s", 0).unwrap(), "hello");
        assert_eq!(map.get_data("s", 0).unwrap().hint, DataHint::Utf8);
    }

    #[test]
    fn delete_key_works() {
        let mut map = PropertyMap::new();
        map.set_int("x", 1, AppendMode::Replace).unwrap();
        assert!(map.delete_key("x"));
        assert!(!map.delete_key("x"));
        assert!(map.is_empty());
    }
}
