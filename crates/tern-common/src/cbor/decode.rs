use cid::Cid;
use smol_str::SmolStr;

use super::{AtBytes, CID_LINK_TAG, CborMap, CborValue, CodecError, MAX_DEPTH};

/// Decode exactly one value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<CborValue, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.next_value()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            offset: decoder.position(),
            count: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// Decode the first value and report how many bytes it used.
pub fn decode_prefix(bytes: &[u8]) -> Result<(CborValue, usize), CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.next_value()?;
    Ok((value, decoder.position()))
}

/// Cursor over a buffer holding one or more consecutive CBOR values.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

struct Head {
    major: u8,
    info: u8,
    arg: u64,
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Decode the next top-level value.
    ///
    /// On failure the cursor is left where it was, so the caller can report
    /// the offset of the broken value.
    pub fn next_value(&mut self) -> Result<CborValue, CodecError> {
        let start = self.pos;
        let result = self.read_value(0);
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_value(&mut self, depth: usize) -> Result<CborValue, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthLimit {
                limit: MAX_DEPTH,
                offset: self.pos,
            });
        }
        let head = self.read_head()?;
        match head.major {
            0 => Ok(CborValue::Integer(head.arg as i128)),
            1 => Ok(CborValue::Integer(-1 - head.arg as i128)),
            2 => {
                let len = self.length(&head)?;
                let bytes = self.take(len)?;
                Ok(CborValue::Bytes(AtBytes::from(bytes)))
            }
            3 => {
                let len = self.length(&head)?;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::InvalidUtf8 { offset: head.offset })?;
                Ok(CborValue::Text(SmolStr::new(text)))
            }
            4 => {
                let len = self.length(&head)?;
                // every item needs at least one byte
                self.ensure(len)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(CborValue::Array(items))
            }
            5 => {
                let len = self.length(&head)?;
                self.ensure(len.saturating_mul(2))?;
                let mut map = CborMap::new();
                for _ in 0..len {
                    let key_offset = self.pos;
                    let key = match self.read_value(depth + 1)? {
                        CborValue::Text(key) => key,
                        _ => return Err(CodecError::NonTextKey { offset: key_offset }),
                    };
                    let value = self.read_value(depth + 1)?;
                    map.insert_new(key, value)
                        .map_err(|key| CodecError::DuplicateKey {
                            key,
                            offset: key_offset,
                        })?;
                }
                Ok(CborValue::Map(map))
            }
            6 => {
                if head.info == 31 {
                    return Err(CodecError::IndefiniteLength { offset: head.offset });
                }
                let inner = self.read_value(depth + 1)?;
                if head.arg == CID_LINK_TAG {
                    decode_link(inner, head.offset)
                } else {
                    Ok(CborValue::Tag(head.arg, Box::new(inner)))
                }
            }
            _ => self.read_simple(&head),
        }
    }

    fn read_simple(&mut self, head: &Head) -> Result<CborValue, CodecError> {
        match head.info {
            20 => Ok(CborValue::Bool(false)),
            21 => Ok(CborValue::Bool(true)),
            22 => Ok(CborValue::Null),
            25 => Ok(CborValue::Float(f16_to_f64(head.arg as u16))),
            26 => Ok(CborValue::Float(f32::from_bits(head.arg as u32) as f64)),
            27 => Ok(CborValue::Float(f64::from_bits(head.arg))),
            31 => Err(CodecError::IndefiniteLength { offset: head.offset }),
            info if info < 24 => Err(CodecError::UnsupportedSimple {
                value: info,
                offset: head.offset,
            }),
            _ => Err(CodecError::UnsupportedSimple {
                value: head.arg as u8,
                offset: head.offset,
            }),
        }
    }

    fn read_head(&mut self) -> Result<Head, CodecError> {
        let offset = self.pos;
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let info = initial & 0x1f;
        let arg = match info {
            0..=23 => info as u64,
            24 => self.take(1)?[0] as u64,
            25 => u16::from_be_bytes(self.take_array()?) as u64,
            26 => u32::from_be_bytes(self.take_array()?) as u64,
            27 => u64::from_be_bytes(self.take_array()?),
            28..=30 => return Err(CodecError::ReservedInfo { info, offset }),
            _ => {
                if major == 0 || major == 1 {
                    return Err(CodecError::ReservedInfo { info, offset });
                }
                0
            }
        };
        Ok(Head {
            major,
            info,
            arg,
            offset,
        })
    }

    fn length(&self, head: &Head) -> Result<usize, CodecError> {
        if head.info == 31 {
            return Err(CodecError::IndefiniteLength { offset: head.offset });
        }
        usize::try_from(head.arg).map_err(|_| CodecError::UnexpectedEof {
            offset: self.pos,
            needed: usize::MAX,
        })
    }

    fn ensure(&self, len: usize) -> Result<(), CodecError> {
        let available = self.input.len() - self.pos;
        if len > available {
            Err(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: len - available,
            })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.ensure(len)?;
        let slice = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn decode_link(inner: CborValue, offset: usize) -> Result<CborValue, CodecError> {
    let invalid = |reason: &str| CodecError::InvalidLink {
        offset,
        reason: SmolStr::new(reason),
    };
    let bytes = match inner {
        CborValue::Bytes(bytes) => bytes,
        _ => return Err(invalid("tag 42 must wrap a byte string")),
    };
    match bytes.split_first() {
        Some((&0x00, cid_bytes)) => Cid::try_from(cid_bytes)
            .map(CborValue::Link)
            .map_err(|e| invalid(&e.to_string())),
        _ => Err(invalid("missing multibase identity prefix")),
    }
}

fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((bits >> 10) & 0x1f) as i32;
    let frac = (bits & 0x3ff) as f64;
    match exp {
        0 => sign * frac * 2f64.powi(-24),
        31 if frac == 0.0 => sign * f64::INFINITY,
        31 => f64::NAN,
        _ => sign * (1.0 + frac / 1024.0) * 2f64.powi(exp - 15),
    }
}
