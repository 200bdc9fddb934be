use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use cid::Cid;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use smol_str::SmolStr;

use super::{CodecError, MapKeySort};

/// Smallest integer representable with a CBOR head (`-2^64`).
pub(crate) const CBOR_INT_MIN: i128 = -(1i128 << 64);
/// Largest integer representable with a CBOR head (`2^64 - 1`).
pub(crate) const CBOR_INT_MAX: i128 = u64::MAX as i128;

/// Opaque byte payload.
///
/// Wrapping bytes in this type is what makes them encode as a CBOR byte
/// string. A plain `Vec<u8>` goes through serde as a sequence of integers.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtBytes(pub Bytes);

impl AtBytes {
    /// Wrap anything convertible into [`Bytes`].
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Unwrap into the underlying buffer.
    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for AtBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtBytes(")?;
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl Deref for AtBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for AtBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for AtBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for AtBytes {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for AtBytes {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl Serialize for AtBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

/// A decoded (or to-be-encoded) CBOR data item.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Integer in `-2^64 ..= 2^64 - 1`
    Integer(i128),
    /// Floating point, always encoded as 64-bit
    Float(f64),
    /// Byte string (major type 2)
    Bytes(AtBytes),
    /// Text string (major type 3)
    Text(SmolStr),
    /// Array
    Array(Vec<CborValue>),
    /// Map with text keys
    Map(CborMap),
    /// CID link (tag 42)
    Link(Cid),
    /// Any other tagged value
    Tag(u64, Box<CborValue>),
}

impl CborValue {
    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Link(_) => "link",
            Self::Tag(..) => "tag",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(|n| i64::try_from(n).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&AtBytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Self::Link(cid) => Some(cid),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CborValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&CborMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key if this value is a map.
    pub fn get(&self, key: &str) -> Option<&CborValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Build an integer value, checking the CBOR range.
    pub fn integer(n: i128) -> Result<Self, CodecError> {
        if (CBOR_INT_MIN..=CBOR_INT_MAX).contains(&n) {
            Ok(Self::Integer(n))
        } else {
            Err(CodecError::IntegerOutOfRange(n))
        }
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for CborValue {
                fn from(value: $t) -> Self {
                    Self::Integer(value as i128)
                }
            }
        )*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<bool> for CborValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for CborValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for CborValue {
    fn from(value: &str) -> Self {
        Self::Text(SmolStr::new(value))
    }
}

impl From<String> for CborValue {
    fn from(value: String) -> Self {
        Self::Text(SmolStr::from(value))
    }
}

impl From<SmolStr> for CborValue {
    fn from(value: SmolStr) -> Self {
        Self::Text(value)
    }
}

impl From<AtBytes> for CborValue {
    fn from(value: AtBytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Cid> for CborValue {
    fn from(value: Cid) -> Self {
        Self::Link(value)
    }
}

impl From<Vec<CborValue>> for CborValue {
    fn from(value: Vec<CborValue>) -> Self {
        Self::Array(value)
    }
}

impl From<CborMap> for CborValue {
    fn from(value: CborMap) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<CborValue>> From<Option<T>> for CborValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl Serialize for CborValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i128(*n),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bytes(b) => serializer.serialize_bytes(b),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(map) => map.serialize(serializer),
            Self::Link(cid) => cid.serialize(serializer),
            Self::Tag(_, inner) => inner.serialize(serializer),
        }
    }
}

/// Map with text keys.
///
/// Storage order is irrelevant; [`CborMap::iter_canonical`] yields the
/// order used on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CborMap(BTreeMap<SmolStr, CborValue>);

impl CborMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&CborValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<SmolStr>, value: impl Into<CborValue>) -> Option<CborValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<CborValue> {
        self.0.remove(key)
    }

    /// Iterate in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &CborValue)> {
        self.0.iter()
    }

    /// Entries sorted by [`MapKeySort`].
    pub fn iter_canonical(&self) -> Vec<(&SmolStr, &CborValue)> {
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_by(|a, b| MapKeySort::compare(a.0.as_bytes(), b.0.as_bytes()));
        entries
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(CborValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(CborValue::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(CborValue::as_bool)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&AtBytes> {
        self.get(key).and_then(CborValue::as_bytes)
    }

    pub fn get_link(&self, key: &str) -> Option<&Cid> {
        self.get(key).and_then(CborValue::as_link)
    }

    pub fn get_array(&self, key: &str) -> Option<&[CborValue]> {
        self.get(key).and_then(CborValue::as_array)
    }

    pub(crate) fn insert_new(&mut self, key: SmolStr, value: CborValue) -> Result<(), SmolStr> {
        use std::collections::btree_map::Entry;
        match self.0.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
            Entry::Occupied(slot) => Err(slot.key().clone()),
        }
    }
}

impl<K: Into<SmolStr>, V: Into<CborValue>> FromIterator<(K, V)> for CborMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for CborMap {
    type Item = (SmolStr, CborValue);
    type IntoIter = std::collections::btree_map::IntoIter<SmolStr, CborValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for CborMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self.iter_canonical();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            map.serialize_entry(k.as_str(), v)?;
        }
        map.end()
    }
}
