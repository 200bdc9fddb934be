use super::value::{CBOR_INT_MAX, CBOR_INT_MIN};
use super::{CID_LINK_TAG, CborValue, CodecError};

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;
const FLOAT64: u8 = 0xfb;

/// Encode a value into a fresh buffer.
pub fn encode(value: &CborValue) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Append the encoding of `value` to `buf`.
///
/// On error `buf` may hold a partial encoding.
pub fn encode_into(value: &CborValue, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        CborValue::Null => buf.push(NULL),
        CborValue::Bool(false) => buf.push(FALSE),
        CborValue::Bool(true) => buf.push(TRUE),
        CborValue::Integer(n) => write_integer(*n, buf)?,
        CborValue::Float(f) => {
            if !f.is_finite() {
                return Err(CodecError::NonFiniteFloat);
            }
            buf.push(FLOAT64);
            buf.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        CborValue::Bytes(bytes) => {
            write_head(MAJOR_BYTES, bytes.len() as u64, buf);
            buf.extend_from_slice(bytes);
        }
        CborValue::Text(text) => {
            write_head(MAJOR_TEXT, text.len() as u64, buf);
            buf.extend_from_slice(text.as_bytes());
        }
        CborValue::Array(items) => {
            write_head(MAJOR_ARRAY, items.len() as u64, buf);
            for item in items {
                encode_into(item, buf)?;
            }
        }
        CborValue::Map(map) => {
            let entries = map.iter_canonical();
            write_head(MAJOR_MAP, entries.len() as u64, buf);
            for (key, value) in entries {
                write_head(MAJOR_TEXT, key.len() as u64, buf);
                buf.extend_from_slice(key.as_bytes());
                encode_into(value, buf)?;
            }
        }
        CborValue::Link(cid) => {
            let cid_bytes = cid.to_bytes();
            write_head(MAJOR_TAG, CID_LINK_TAG, buf);
            // multibase identity prefix
            write_head(MAJOR_BYTES, cid_bytes.len() as u64 + 1, buf);
            buf.push(0x00);
            buf.extend_from_slice(&cid_bytes);
        }
        CborValue::Tag(tag, inner) => {
            write_head(MAJOR_TAG, *tag, buf);
            encode_into(inner, buf)?;
        }
    }
    Ok(())
}

fn write_integer(n: i128, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    if !(CBOR_INT_MIN..=CBOR_INT_MAX).contains(&n) {
        return Err(CodecError::IntegerOutOfRange(n));
    }
    if n >= 0 {
        write_head(MAJOR_UNSIGNED, n as u64, buf);
    } else {
        write_head(MAJOR_NEGATIVE, (-1 - n) as u64, buf);
    }
    Ok(())
}

/// Shortest head for the given major type and argument.
pub(super) fn write_head(major: u8, arg: u64, buf: &mut Vec<u8>) {
    let major = major << 5;
    if arg < 24 {
        buf.push(major | arg as u8);
    } else if arg <= u8::MAX as u64 {
        buf.push(major | 24);
        buf.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        buf.push(major | 25);
        buf.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        buf.push(major | 26);
        buf.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        buf.push(major | 27);
        buf.extend_from_slice(&arg.to_be_bytes());
    }
}
