//! Secret strength rules and Argon2id hashing.

mod hasher;
mod policy;

pub use hasher::CredentialHasher;
pub use policy::{CredentialPolicy, PolicyReport, PolicyViolation, SPECIAL_CHARACTERS};
