use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use cid::Cid;
use serde_json::{Map, Number, Value};
use smol_str::SmolStr;

use super::{AtBytes, CborMap, CborValue, CodecError};

impl CborValue {
    /// Convert from atproto JSON.
    ///
    /// `{"$bytes": "<base64>"}` becomes [`CborValue::Bytes`] and
    /// `{"$link": "<cid>"}` becomes [`CborValue::Link`]. Integral numbers map
    /// to integers, everything else numeric to floats.
    pub fn from_json(value: &Value) -> Result<Self, CodecError> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Self::Integer(u as i128)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Text(SmolStr::new(s)),
            Value::Array(items) => Self::Array(
                items
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(Value::String(b64)) = obj.get("$bytes") {
                        let bytes = STANDARD_NO_PAD
                            .decode(b64.trim_end_matches('='))
                            .map_err(|e| CodecError::Unsupported(SmolStr::new(e.to_string())))?;
                        return Ok(Self::Bytes(AtBytes::from(bytes)));
                    }
                    if let Some(Value::String(link)) = obj.get("$link") {
                        let cid = Cid::try_from(link.as_str())
                            .map_err(|e| CodecError::Unsupported(SmolStr::new(e.to_string())))?;
                        return Ok(Self::Link(cid));
                    }
                }
                let mut map = CborMap::new();
                for (k, v) in obj {
                    map.insert(k.as_str(), Self::from_json(v)?);
                }
                Self::Map(map)
            }
        })
    }

    /// Convert to atproto JSON. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(n) => {
                if let Ok(i) = i64::try_from(*n) {
                    Value::Number(i.into())
                } else if let Ok(u) = u64::try_from(*n) {
                    Value::Number(u.into())
                } else {
                    Number::from_f64(*n as f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Self::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Self::Bytes(bytes) => {
                let mut obj = Map::new();
                obj.insert("$bytes".into(), Value::String(STANDARD_NO_PAD.encode(bytes)));
                Value::Object(obj)
            }
            Self::Text(s) => Value::String(s.to_string()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
            Self::Link(cid) => {
                let mut obj = Map::new();
                obj.insert("$link".into(), Value::String(cid.to_string()));
                Value::Object(obj)
            }
            Self::Tag(_, inner) => inner.to_json(),
        }
    }
}
