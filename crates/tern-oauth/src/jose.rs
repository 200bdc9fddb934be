pub mod jws;
pub mod jwt;
pub mod signing;

pub use self::jws::RegisteredHeader;
pub use self::jwt::{Claims, PublicClaims, RegisteredClaims, RegisteredClaimsAud};
pub use self::signing::{create_signed_jwt, decode_claims};
