//! `did:key` encoding for P-256 and secp256k1 public keys.
//!
//! A `did:key` is `did:key:` followed by a base58btc multibase string (`z…`)
//! over `<2-byte multicodec prefix><33-byte compressed point>`.
//!
//! ```
//! use tern_common::did_key::{Curve, DidKey, DidKeyPair};
//!
//! let pair = DidKeyPair::generate(Curve::P256);
//! let did = pair.did_key();
//! assert!(did.starts_with("did:key:zDn"));
//!
//! let parsed = DidKey::parse(&did).unwrap();
//! let sig = pair.sign(b"hello");
//! parsed.verify(b"hello", &sig).unwrap();
//! ```

use std::fmt;
use std::str::FromStr;

use k256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rand_core::OsRng;
use smol_str::SmolStr;

/// Prefix of every `did:key` identifier.
pub const DID_KEY_PREFIX: &str = "did:key:";

/// Length of a SEC1 compressed point for both supported curves.
pub const COMPRESSED_LEN: usize = 33;

/// Supported elliptic curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    /// NIST P-256 (secp256r1), `ES256`
    P256,
    /// secp256k1, `ES256K`
    K256,
}

impl Curve {
    /// Unsigned-varint multicodec prefix (`p256-pub` / `secp256k1-pub`).
    pub const fn multicodec(self) -> [u8; 2] {
        match self {
            Curve::P256 => [0x80, 0x24],
            Curve::K256 => [0xe7, 0x01],
        }
    }

    /// JOSE algorithm name used when this curve signs a JWT.
    pub const fn jwt_alg(self) -> &'static str {
        match self {
            Curve::P256 => "ES256",
            Curve::K256 => "ES256K",
        }
    }

    pub fn from_multicodec(prefix: [u8; 2]) -> Option<Self> {
        match prefix {
            [0x80, 0x24] => Some(Curve::P256),
            [0xe7, 0x01] => Some(Curve::K256),
            _ => None,
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Curve::P256 => "P-256",
            Curve::K256 => "secp256k1",
        })
    }
}

/// Errors from parsing, formatting or verifying with `did:key` values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum DidKeyError {
    /// The multicodec prefix is not P-256 or secp256k1
    #[error("unsupported key curve (multicodec prefix {0:02x?})")]
    #[diagnostic(
        code(tern_common::did_key::unsupported_curve),
        help("only p256-pub (0x1200) and secp256k1-pub (0xe7) keys are supported")
    )]
    UnsupportedCurve([u8; 2]),

    /// Bad length, bad parity byte, or a point that is not on the curve
    #[error("invalid key: {0}")]
    #[diagnostic(code(tern_common::did_key::invalid_key))]
    InvalidKey(SmolStr),

    /// Not a base58btc multibase string
    #[error("invalid multibase: {0}")]
    #[diagnostic(
        code(tern_common::did_key::multibase),
        help("did:key values must be base58btc multibase strings starting with 'z'")
    )]
    Multibase(SmolStr),

    /// PEM input could not be read as an SPKI public key on a supported curve
    #[error("invalid public key PEM: {0}")]
    #[diagnostic(code(tern_common::did_key::pem))]
    Pem(SmolStr),

    /// Signature malformed, high-S, or not valid for the message
    #[error("signature rejected: {0}")]
    #[diagnostic(code(tern_common::did_key::signature))]
    Signature(SmolStr),
}

fn invalid(reason: impl Into<SmolStr>) -> DidKeyError {
    DidKeyError::InvalidKey(reason.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PublicPoint {
    P256(p256::PublicKey),
    K256(k256::PublicKey),
}

/// A parsed `did:key` public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidKey {
    curve: Curve,
    compressed: [u8; COMPRESSED_LEN],
    point: PublicPoint,
}

impl DidKey {
    /// Parse a `did:key:z…` identifier or a bare `z…` multibase string.
    pub fn parse(input: &str) -> Result<Self, DidKeyError> {
        let multibase_str = input.strip_prefix(DID_KEY_PREFIX).unwrap_or(input);
        if !multibase_str.starts_with('z') {
            return Err(DidKeyError::Multibase(SmolStr::new_static(
                "expected base58btc ('z') prefix",
            )));
        }
        let (_base, data) = multibase::decode(multibase_str)
            .map_err(|e| DidKeyError::Multibase(SmolStr::new(e.to_string())))?;
        if data.len() < 2 {
            return Err(invalid("missing multicodec prefix"));
        }
        let prefix = [data[0], data[1]];
        let curve = Curve::from_multicodec(prefix).ok_or(DidKeyError::UnsupportedCurve(prefix))?;
        Self::from_compressed(curve, &data[2..])
    }

    /// Build from a 33-byte compressed point on `curve`.
    pub fn from_compressed(curve: Curve, bytes: &[u8]) -> Result<Self, DidKeyError> {
        let compressed: [u8; COMPRESSED_LEN] = bytes.try_into().map_err(|_| {
            invalid(format!(
                "expected {COMPRESSED_LEN} byte compressed point, got {}",
                bytes.len()
            ))
        })?;
        if compressed[0] != 0x02 && compressed[0] != 0x03 {
            return Err(invalid(format!(
                "compressed point must start with 02 or 03, got {:02x}",
                compressed[0]
            )));
        }
        // from_sec1_bytes decompresses and rejects points off the curve
        let point = match curve {
            Curve::P256 => p256::PublicKey::from_sec1_bytes(&compressed)
                .map(PublicPoint::P256)
                .map_err(|_| invalid("point is not on P-256"))?,
            Curve::K256 => k256::PublicKey::from_sec1_bytes(&compressed)
                .map(PublicPoint::K256)
                .map_err(|_| invalid("point is not on secp256k1"))?,
        };
        Ok(Self {
            curve,
            compressed,
            point,
        })
    }

    /// Read an SPKI (`-----BEGIN PUBLIC KEY-----`) PEM on either curve.
    pub fn from_public_key_pem(pem: &str) -> Result<Self, DidKeyError> {
        if let Ok(key) = p256::PublicKey::from_public_key_pem(pem) {
            return Ok(Self::from_p256(&key));
        }
        match k256::PublicKey::from_public_key_pem(pem) {
            Ok(key) => Ok(Self::from_k256(&key)),
            Err(e) => Err(DidKeyError::Pem(SmolStr::new(e.to_string()))),
        }
    }

    pub fn from_p256(key: &p256::PublicKey) -> Self {
        let mut compressed = [0u8; COMPRESSED_LEN];
        compressed.copy_from_slice(key.to_encoded_point(true).as_bytes());
        Self {
            curve: Curve::P256,
            compressed,
            point: PublicPoint::P256(*key),
        }
    }

    pub fn from_k256(key: &k256::PublicKey) -> Self {
        let mut compressed = [0u8; COMPRESSED_LEN];
        compressed.copy_from_slice(key.to_encoded_point(true).as_bytes());
        Self {
            curve: Curve::K256,
            compressed,
            point: PublicPoint::K256(*key),
        }
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// The 33-byte SEC1 compressed point.
    pub fn compressed(&self) -> &[u8; COMPRESSED_LEN] {
        &self.compressed
    }

    /// Base58btc multibase form, `z…`.
    pub fn multibase(&self) -> String {
        let mut buf = Vec::with_capacity(2 + COMPRESSED_LEN);
        buf.extend_from_slice(&self.curve.multicodec());
        buf.extend_from_slice(&self.compressed);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// Full `did:key:z…` identifier.
    pub fn did(&self) -> String {
        format!("{DID_KEY_PREFIX}{}", self.multibase())
    }

    /// SPKI PEM encoding of the public key.
    pub fn to_public_key_pem(&self) -> Result<String, DidKeyError> {
        let pem = match &self.point {
            PublicPoint::P256(key) => key.to_public_key_pem(LineEnding::LF),
            PublicPoint::K256(key) => key.to_public_key_pem(LineEnding::LF),
        };
        pem.map_err(|e| DidKeyError::Pem(SmolStr::new(e.to_string())))
    }

    /// Verify a 64-byte `r || s` ECDSA signature over SHA-256 of `msg`.
    ///
    /// High-S signatures are rejected even when mathematically valid.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), DidKeyError> {
        let bad = |reason: &str| DidKeyError::Signature(SmolStr::new(reason));
        match &self.point {
            PublicPoint::P256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| bad("malformed P-256 signature"))?;
                if sig.normalize_s().is_some() {
                    return Err(bad("high-S signature"));
                }
                p256::ecdsa::VerifyingKey::from(key)
                    .verify(msg, &sig)
                    .map_err(|_| bad("verification failed"))
            }
            PublicPoint::K256(key) => {
                let sig = k256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| bad("malformed secp256k1 signature"))?;
                if sig.normalize_s().is_some() {
                    return Err(bad("high-S signature"));
                }
                k256::ecdsa::VerifyingKey::from(key)
                    .verify(msg, &sig)
                    .map_err(|_| bad("verification failed"))
            }
        }
    }
}

impl fmt::Display for DidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DID_KEY_PREFIX}{}", self.multibase())
    }
}

impl FromStr for DidKey {
    type Err = DidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse a `did:key` or bare multibase key.
pub fn parse(multibase_or_did: &str) -> Result<DidKey, DidKeyError> {
    DidKey::parse(multibase_or_did)
}

/// `did:key:z…` for an SPKI PEM public key.
pub fn format(public_key_pem: &str) -> Result<String, DidKeyError> {
    Ok(DidKey::from_public_key_pem(public_key_pem)?.did())
}

/// Multibase `z…` string for an SPKI PEM public key.
pub fn encode(public_key_pem: &str) -> Result<String, DidKeyError> {
    Ok(DidKey::from_public_key_pem(public_key_pem)?.multibase())
}

/// Private signing key on one of the supported curves.
#[derive(Clone)]
pub enum DidKeyPair {
    P256(p256::ecdsa::SigningKey),
    K256(k256::ecdsa::SigningKey),
}

impl fmt::Debug for DidKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DidKeyPair")
            .field("did", &self.did_key())
            .finish_non_exhaustive()
    }
}

impl DidKeyPair {
    /// Fresh random key from the OS RNG.
    pub fn generate(curve: Curve) -> Self {
        match curve {
            Curve::P256 => Self::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            Curve::K256 => Self::K256(k256::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    /// Load a 32-byte big-endian secret scalar.
    pub fn from_bytes(curve: Curve, secret: &[u8]) -> Result<Self, DidKeyError> {
        match curve {
            Curve::P256 => p256::ecdsa::SigningKey::from_slice(secret)
                .map(Self::P256)
                .map_err(|_| invalid("invalid P-256 secret key")),
            Curve::K256 => k256::ecdsa::SigningKey::from_slice(secret)
                .map(Self::K256)
                .map_err(|_| invalid("invalid secp256k1 secret key")),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::P256(key) => key.to_bytes().to_vec(),
            Self::K256(key) => key.to_bytes().to_vec(),
        }
    }

    pub fn curve(&self) -> Curve {
        match self {
            Self::P256(_) => Curve::P256,
            Self::K256(_) => Curve::K256,
        }
    }

    pub fn public_key(&self) -> DidKey {
        match self {
            Self::P256(key) => DidKey::from_p256(&p256::PublicKey::from(key.verifying_key())),
            Self::K256(key) => DidKey::from_k256(&k256::PublicKey::from(key.verifying_key())),
        }
    }

    pub fn did_key(&self) -> String {
        self.public_key().did()
    }

    /// Sign SHA-256 of `msg`, returning a low-S 64-byte `r || s` signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        match self {
            Self::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(msg);
                sig.normalize_s().unwrap_or(sig).to_bytes().to_vec()
            }
            Self::K256(key) => {
                let sig: k256::ecdsa::Signature = key.sign(msg);
                sig.normalize_s().unwrap_or(sig).to_bytes().to_vec()
            }
        }
    }
}
