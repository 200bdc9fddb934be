use std::fmt::Display;

use cid::Cid;
use serde::Serialize;
use serde::ser::{self, Impossible};
use smol_str::SmolStr;

use super::{AtBytes, CborMap, CborValue, CodecError};

/// Convert any `Serialize` value into the CBOR value model.
///
/// Byte payloads stay bytes only when they go through `serialize_bytes`
/// (for example [`AtBytes`]); CIDs become [`CborValue::Link`]. Enum variants
/// use serde's externally tagged layout.
pub fn normalize<T: Serialize + ?Sized>(value: &T) -> Result<CborValue, CodecError> {
    value.serialize(ValueSerializer)
}

impl ser::Error for CodecError {
    fn custom<T: Display>(msg: T) -> Self {
        CodecError::Custom(SmolStr::new(msg.to_string()))
    }
}

/// Serde serializer producing [`CborValue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = CborValue;
    type Error = CodecError;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantSeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantMapBuilder;

    fn serialize_bool(self, v: bool) -> Result<CborValue, CodecError> {
        Ok(CborValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_i128(self, v: i128) -> Result<CborValue, CodecError> {
        CborValue::integer(v)
    }

    fn serialize_u8(self, v: u8) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<CborValue, CodecError> {
        Ok(v.into())
    }

    fn serialize_u128(self, v: u128) -> Result<CborValue, CodecError> {
        let v = i128::try_from(v).map_err(|_| CodecError::IntegerOutOfRange(i128::MAX))?;
        CborValue::integer(v)
    }

    fn serialize_f32(self, v: f32) -> Result<CborValue, CodecError> {
        Ok(CborValue::Float(v as f64))
    }

    fn serialize_f64(self, v: f64) -> Result<CborValue, CodecError> {
        Ok(CborValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<CborValue, CodecError> {
        let mut buf = [0u8; 4];
        Ok(CborValue::from(&*v.encode_utf8(&mut buf)))
    }

    fn serialize_str(self, v: &str) -> Result<CborValue, CodecError> {
        Ok(CborValue::from(v))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<CborValue, CodecError> {
        Ok(CborValue::Bytes(AtBytes::from(v)))
    }

    fn serialize_none(self) -> Result<CborValue, CodecError> {
        Ok(CborValue::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<CborValue, CodecError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<CborValue, CodecError> {
        Ok(CborValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<CborValue, CodecError> {
        Ok(CborValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<CborValue, CodecError> {
        Ok(CborValue::from(variant))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<CborValue, CodecError> {
        if name == cid::serde::CID_SERDE_PRIVATE_IDENTIFIER {
            return match value.serialize(self)? {
                CborValue::Bytes(bytes) => Cid::try_from(bytes.as_slice())
                    .map(CborValue::Link)
                    .map_err(|e| CodecError::Unsupported(SmolStr::new(e.to_string()))),
                other => Err(CodecError::Unsupported(SmolStr::new(format!(
                    "CID serialized as {}",
                    other.type_name()
                )))),
            };
        }
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<CborValue, CodecError> {
        let mut map = CborMap::new();
        map.insert(variant, value.serialize(self)?);
        Ok(CborValue::Map(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, CodecError> {
        Ok(SeqBuilder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqBuilder, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqBuilder, CodecError> {
        Ok(VariantSeqBuilder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, CodecError> {
        Ok(MapBuilder {
            map: CborMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapBuilder, CodecError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapBuilder, CodecError> {
        Ok(VariantMapBuilder {
            variant,
            map: CborMap::new(),
        })
    }
}

#[doc(hidden)]
pub struct SeqBuilder {
    items: Vec<CborValue>,
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<CborValue, CodecError> {
        Ok(CborValue::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<CborValue, CodecError> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<CborValue, CodecError> {
        ser::SerializeSeq::end(self)
    }
}

#[doc(hidden)]
pub struct VariantSeqBuilder {
    variant: &'static str,
    items: Vec<CborValue>,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<CborValue, CodecError> {
        let mut map = CborMap::new();
        map.insert(self.variant, CborValue::Array(self.items));
        Ok(CborValue::Map(map))
    }
}

#[doc(hidden)]
pub struct MapBuilder {
    map: CborMap,
    next_key: Option<SmolStr>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CodecError> {
        self.next_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| CodecError::Custom(SmolStr::new_static("map value without key")))?;
        self.map.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<CborValue, CodecError> {
        Ok(CborValue::Map(self.map))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        self.map.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<CborValue, CodecError> {
        Ok(CborValue::Map(self.map))
    }
}

#[doc(hidden)]
pub struct VariantMapBuilder {
    variant: &'static str,
    map: CborMap,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
    type Ok = CborValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        self.map.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<CborValue, CodecError> {
        let mut outer = CborMap::new();
        outer.insert(self.variant, CborValue::Map(self.map));
        Ok(CborValue::Map(outer))
    }
}

/// Map keys must come out as text.
struct KeySerializer;

fn non_text_key() -> CodecError {
    CodecError::Unsupported(SmolStr::new_static("map keys must be strings"))
}

impl ser::Serializer for KeySerializer {
    type Ok = SmolStr;
    type Error = CodecError;

    type SerializeSeq = Impossible<SmolStr, CodecError>;
    type SerializeTuple = Impossible<SmolStr, CodecError>;
    type SerializeTupleStruct = Impossible<SmolStr, CodecError>;
    type SerializeTupleVariant = Impossible<SmolStr, CodecError>;
    type SerializeMap = Impossible<SmolStr, CodecError>;
    type SerializeStruct = Impossible<SmolStr, CodecError>;
    type SerializeStructVariant = Impossible<SmolStr, CodecError>;

    fn serialize_str(self, v: &str) -> Result<SmolStr, CodecError> {
        Ok(SmolStr::new(v))
    }

    fn serialize_char(self, v: char) -> Result<SmolStr, CodecError> {
        let mut buf = [0u8; 4];
        Ok(SmolStr::new(v.encode_utf8(&mut buf)))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<SmolStr, CodecError> {
        Ok(SmolStr::new_static(variant))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<SmolStr, CodecError> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_i8(self, _v: i8) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_i16(self, _v: i16) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_i32(self, _v: i32) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_i64(self, _v: i64) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_u8(self, _v: u8) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_u16(self, _v: u16) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_u32(self, _v: u32) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_u64(self, _v: u64) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_f32(self, _v: f32) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_f64(self, _v: f64) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_none(self) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_unit(self) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<SmolStr, CodecError> {
        Err(non_text_key())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Err(non_text_key())
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(non_text_key())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(non_text_key())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(non_text_key())
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Err(non_text_key())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Err(non_text_key())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(non_text_key())
    }
}
