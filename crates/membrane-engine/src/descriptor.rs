//! Structural descriptor helpers: values, property keys, and property
//! descriptors shared by every layer of the membrane.
//!
//! These are small, dependency-free value types.  Everything is plain data
//! with `BTreeMap`-friendly ordering so that enumeration and serialization
//! stay deterministic.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ObjectHandle — typed reference into the object heap
// ---------------------------------------------------------------------------

/// Opaque handle referencing an object on the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PropertyKey
// ---------------------------------------------------------------------------

/// A property key.  Keys are strings; integer-like keys sort first in
/// enumeration order (numerically), then the remaining string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Is this key empty?  Empty keys are rejected at every interception
    /// point.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse this key as an array-index-like integer, if it is one.
    pub fn as_index(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Value — runtime value for the object model
// ---------------------------------------------------------------------------

/// Runtime value flowing through the membrane.
///
/// Primitives cross graph boundaries unchanged; only `Object` values are
/// mediated by surrogates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Object(ObjectHandle),
}

impl Value {
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Is this a primitive (anything but an object reference)?
    pub fn is_primitive(&self) -> bool {
        !self.is_object()
    }

    /// The object handle, if this is an object.
    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(h) => Some(*h),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "number",
            Self::Str(_) => "string",
            Self::Object(_) => "object",
        }
    }

    /// SameValue comparison.  Structural equality of the enum is exactly
    /// the identity the membrane needs: object handles compare by arena id.
    pub fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Object(h) => write!(f, "[{h}]"),
        }
    }
}

impl From<ObjectHandle> for Value {
    fn from(h: ObjectHandle) -> Self {
        Self::Object(h)
    }
}

// ---------------------------------------------------------------------------
// PropertyDescriptor
// ---------------------------------------------------------------------------

/// A structural property descriptor: either a data slot or an accessor
/// pair.  Accessor get/set are handles of callable heap objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyDescriptor {
    Data {
        value: Value,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    Accessor {
        get: Option<ObjectHandle>,
        set: Option<ObjectHandle>,
        enumerable: bool,
        configurable: bool,
    },
}

impl PropertyDescriptor {
    /// Default data descriptor: writable, enumerable, configurable.
    pub fn data(value: Value) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, non-configurable data descriptor.
    pub fn data_frozen(value: Value) -> Self {
        Self::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    /// Accessor descriptor with default attributes (enumerable,
    /// configurable).
    pub fn accessor(get: Option<ObjectHandle>, set: Option<ObjectHandle>) -> Self {
        Self::Accessor {
            get,
            set,
            enumerable: true,
            configurable: true,
        }
    }

    pub fn is_configurable(&self) -> bool {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => *configurable,
        }
    }

    pub fn is_enumerable(&self) -> bool {
        match self {
            Self::Data { enumerable, .. } | Self::Accessor { enumerable, .. } => *enumerable,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, Self::Accessor { .. })
    }

    /// The value, if this is a data descriptor.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Data { value, .. } => Some(value),
            Self::Accessor { .. } => None,
        }
    }

    /// Is this a data descriptor with `writable` set?
    pub fn is_writable(&self) -> bool {
        match self {
            Self::Data { writable, .. } => *writable,
            Self::Accessor { .. } => false,
        }
    }

    /// The getter handle, if this is an accessor descriptor.
    pub fn getter(&self) -> Option<ObjectHandle> {
        match self {
            Self::Accessor { get, .. } => *get,
            Self::Data { .. } => None,
        }
    }

    /// The setter handle, if this is an accessor descriptor.
    pub fn setter(&self) -> Option<ObjectHandle> {
        match self {
            Self::Accessor { set, .. } => *set,
            Self::Data { .. } => None,
        }
    }

    pub fn set_non_configurable(&mut self) {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => {
                *configurable = false;
            }
        }
    }

    pub fn set_non_writable(&mut self) {
        if let Self::Data { writable, .. } = self {
            *writable = false;
        }
    }

    pub fn set_non_enumerable(&mut self) {
        match self {
            Self::Data { enumerable, .. } | Self::Accessor { enumerable, .. } => {
                *enumerable = false;
            }
        }
    }

    /// Does this descriptor reference any non-primitive value?  Primitive
    /// data descriptors cross graph boundaries without rewriting.
    pub fn is_primitive_data(&self) -> bool {
        match self {
            Self::Data { value, .. } => value.is_primitive(),
            Self::Accessor { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn int_val(n: i64) -> Value {
        Value::Int(n)
    }

    // -----------------------------------------------------------------------
    // 1. PropertyKey
    // -----------------------------------------------------------------------

    #[test]
    fn property_key_from_str() {
        let k: PropertyKey = "foo".into();
        assert_eq!(k.as_str(), "foo");
    }

    #[test]
    fn property_key_index_parse() {
        assert_eq!(PropertyKey::new("17").as_index(), Some(17));
        assert_eq!(PropertyKey::new("nope").as_index(), None);
        assert_eq!(PropertyKey::new("-1").as_index(), None);
    }

    #[test]
    fn property_key_empty() {
        assert!(PropertyKey::new("").is_empty());
        assert!(!PropertyKey::new("x").is_empty());
    }

    // -----------------------------------------------------------------------
    // 2. Value
    // -----------------------------------------------------------------------

    #[test]
    fn value_classification() {
        assert!(Value::Object(ObjectHandle(0)).is_object());
        assert!(!Value::Object(ObjectHandle(0)).is_primitive());
        assert!(Value::Null.is_primitive());
        assert!(Value::Undefined.is_primitive());
        assert_eq!(Value::Int(3).type_name(), "number");
        assert_eq!(Value::Object(ObjectHandle(2)).as_object(), Some(ObjectHandle(2)));
        assert_eq!(Value::Str("x".into()).as_object(), None);
    }

    #[test]
    fn value_same_value_by_handle() {
        let a = Value::Object(ObjectHandle(1));
        let b = Value::Object(ObjectHandle(1));
        let c = Value::Object(ObjectHandle(2));
        assert!(a.same_value(&b));
        assert!(!a.same_value(&c));
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::Object(ObjectHandle(7)).to_string(), "[obj#7]");
    }

    // -----------------------------------------------------------------------
    // 3. PropertyDescriptor
    // -----------------------------------------------------------------------

    #[test]
    fn data_descriptor_defaults() {
        let d = PropertyDescriptor::data(int_val(42));
        assert!(d.is_data());
        assert!(!d.is_accessor());
        assert!(d.is_configurable());
        assert!(d.is_enumerable());
        assert!(d.is_writable());
        assert_eq!(d.value(), Some(&int_val(42)));
    }

    #[test]
    fn data_descriptor_frozen() {
        let d = PropertyDescriptor::data_frozen(int_val(1));
        assert!(!d.is_configurable());
        assert!(!d.is_enumerable());
        assert!(!d.is_writable());
    }

    #[test]
    fn accessor_descriptor() {
        let d = PropertyDescriptor::accessor(Some(ObjectHandle(1)), None);
        assert!(d.is_accessor());
        assert!(!d.is_data());
        assert!(!d.is_writable());
        assert_eq!(d.value(), None);
        assert_eq!(d.getter(), Some(ObjectHandle(1)));
        assert_eq!(d.setter(), None);
    }

    #[test]
    fn descriptor_mutators() {
        let mut d = PropertyDescriptor::data(int_val(1));
        d.set_non_configurable();
        assert!(!d.is_configurable());
        d.set_non_writable();
        assert!(!d.is_writable());
        d.set_non_enumerable();
        assert!(!d.is_enumerable());
    }

    #[test]
    fn primitive_data_classification() {
        assert!(PropertyDescriptor::data(int_val(1)).is_primitive_data());
        assert!(!PropertyDescriptor::data(Value::Object(ObjectHandle(0))).is_primitive_data());
        assert!(!PropertyDescriptor::accessor(None, None).is_primitive_data());
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let d = PropertyDescriptor::accessor(Some(ObjectHandle(3)), Some(ObjectHandle(4)));
        let json = serde_json::to_string(&d).expect("serialize");
        let back: PropertyDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(d, back);
    }
}
