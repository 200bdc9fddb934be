//! Deterministic CBOR subset used on the AT Protocol wire.
//!
//! The codec works on a small self-describing value model ([`CborValue`]).
//! Encoding is canonical: integers use the shortest head, floats are always
//! 64-bit, and map keys are emitted in [`MapKeySort`] order. Decoding accepts
//! keys in any order, but rejects indefinite-length items, duplicate or
//! non-text map keys, and anything truncated.
//!
//! ```
//! use tern_common::cbor::{self, CborMap, CborValue};
//!
//! let value = CborValue::Map(CborMap::from_iter([
//!     ("op", CborValue::from(1i64)),
//!     ("t", CborValue::from("#commit")),
//! ]));
//! let bytes = cbor::encode(&value).unwrap();
//! assert_eq!(cbor::decode(&bytes).unwrap(), value);
//! ```

use std::cmp::Ordering;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

mod decode;
mod encode;
mod json;
mod normalize;
mod value;

pub use decode::{Decoder, decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use normalize::{ValueSerializer, normalize};
pub use value::{AtBytes, CborMap, CborValue};

/// CBOR tag number for IPLD CID links.
pub const CID_LINK_TAG: u64 = 42;

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 128;

/// Canonical ordering for map keys.
///
/// Keys with a shorter encoding sort first; keys of equal length are compared
/// byte-wise. For text keys the encoded length grows with the byte length, so
/// comparing raw byte lengths is equivalent.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapKeySort;

impl MapKeySort {
    /// Compare two raw keys.
    pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }

    /// Sort a slice of keys in place.
    pub fn sort<K: AsRef<[u8]>>(keys: &mut [K]) {
        keys.sort_by(|a, b| Self::compare(a.as_ref(), b.as_ref()));
    }
}

/// Errors from encoding, decoding or normalizing CBOR values.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum CodecError {
    /// Input ended in the middle of a value
    #[error("unexpected end of input at offset {offset} ({needed} more bytes needed)")]
    #[diagnostic(
        code(tern_common::cbor::eof),
        help("the frame is truncated; partial values are never accepted")
    )]
    UnexpectedEof {
        /// Offset where the missing data should start
        offset: usize,
        /// Number of bytes missing
        needed: usize,
    },

    /// Bytes left over after a complete value
    #[error("{count} trailing bytes after value ending at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::trailing))]
    TrailingBytes {
        /// Offset of the first trailing byte
        offset: usize,
        /// Number of trailing bytes
        count: usize,
    },

    /// Indefinite-length strings, arrays and maps are not deterministic
    #[error("indefinite-length item at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::indefinite))]
    IndefiniteLength {
        /// Offset of the item head
        offset: usize,
    },

    /// Additional-info values 28..=30 are reserved by RFC 8949
    #[error("reserved additional info {info} at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::reserved))]
    ReservedInfo {
        /// The additional-info bits
        info: u8,
        /// Offset of the item head
        offset: usize,
    },

    /// Simple values other than true/false/null
    #[error("unsupported simple value {value} at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::simple))]
    UnsupportedSimple {
        /// The simple value number
        value: u8,
        /// Offset of the item head
        offset: usize,
    },

    /// Map keys must be text strings
    #[error("map key at offset {offset} is not a text string")]
    #[diagnostic(code(tern_common::cbor::key_type))]
    NonTextKey {
        /// Offset of the offending key
        offset: usize,
    },

    /// A map contained the same key twice
    #[error("duplicate map key {key:?} at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::duplicate_key))]
    DuplicateKey {
        /// The repeated key
        key: SmolStr,
        /// Offset of the second occurrence
        offset: usize,
    },

    /// A text string was not valid UTF-8
    #[error("invalid utf-8 in text string at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::utf8))]
    InvalidUtf8 {
        /// Offset of the string head
        offset: usize,
    },

    /// Tag 42 did not wrap a well-formed CID
    #[error("invalid CID link at offset {offset}: {reason}")]
    #[diagnostic(code(tern_common::cbor::link))]
    InvalidLink {
        /// Offset of the tag head
        offset: usize,
        /// What was wrong with it
        reason: SmolStr,
    },

    /// Nesting exceeded [`MAX_DEPTH`]
    #[error("nesting deeper than {limit} levels at offset {offset}")]
    #[diagnostic(code(tern_common::cbor::depth))]
    DepthLimit {
        /// The configured limit
        limit: usize,
        /// Offset where the limit was hit
        offset: usize,
    },

    /// Integer outside `-2^64 ..= 2^64 - 1`
    #[error("integer {0} is outside the CBOR integer range")]
    #[diagnostic(code(tern_common::cbor::int_range))]
    IntegerOutOfRange(i128),

    /// NaN and infinities have no deterministic encoding
    #[error("non-finite float cannot be encoded")]
    #[diagnostic(code(tern_common::cbor::float))]
    NonFiniteFloat,

    /// The value cannot be represented in this subset
    #[error("unsupported value: {0}")]
    #[diagnostic(code(tern_common::cbor::unsupported))]
    Unsupported(SmolStr),

    /// Error raised by a `Serialize` implementation during normalization
    #[error("{0}")]
    #[diagnostic(code(tern_common::cbor::custom))]
    Custom(SmolStr),
}
