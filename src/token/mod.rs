//! Signed access and refresh tokens.

pub mod claims;
pub mod codec;
mod issuer;
mod repo;

pub use claims::{AccessClaims, RefreshClaims, TokenType};
pub use codec::{CodecError, TokenSigner, TokenVerifier};
pub use issuer::{TokenConfig, TokenIssuer, TokenPair};
pub use repo::{RefreshTokenRecord, RefreshTokenStore, RotationOutcome};
