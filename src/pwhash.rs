//! Scrypt password hashes with a self-describing encoded form
//!
//! A hash is `BASE32(version || salt || scrypt(password, salt))` with a
//! 1-byte version tag, a 30-byte random salt, and a 64-byte scrypt output
//! (N=16384, r=8, p=1). The whole thing decodes to exactly 95 bytes, so a
//! hash copied into the config file can be validated structurally before
//! any password is checked against it.

use crate::error::{Error, Result};
use data_encoding::BASE32;
use rand::RngCore;
use rand::rngs::OsRng;
use scrypt::Params;

const VERSION: u8 = 0x01;
const SALT_LEN: usize = 30;
const HASH_LEN: usize = 64;
const DECODED_LEN: usize = 1 + SALT_LEN + HASH_LEN;

/// log2(N) for N=16384.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Salt and scrypt output recovered from an encoded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PwInfo {
    salt: [u8; SALT_LEN],
    scrypt_hash: [u8; HASH_LEN],
}

fn params() -> Params {
    // The parameters are compile-time constants accepted by scrypt, so
    // this cannot fail at runtime.
    Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, HASH_LEN)
        .unwrap_or_else(|_| unreachable!("fixed scrypt parameters are valid"))
}

fn derive(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params(), &mut out)
        .unwrap_or_else(|_| unreachable!("output length is fixed and non-zero"));
    out
}

/// Generate a fresh encoded hash for `password` with a random salt.
#[must_use]
pub fn gen_pwhash(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let hash = derive(password, &salt);

    let mut packed = Vec::with_capacity(DECODED_LEN);
    packed.push(VERSION);
    packed.extend_from_slice(&salt);
    packed.extend_from_slice(&hash);
    BASE32.encode(&packed)
}

/// Decode and validate an encoded hash.
///
/// # Errors
///
/// Returns [`Error::PwHash`] if the input is not valid base32, does not
/// decode to exactly 95 bytes, or carries an unknown version tag.
pub fn parse_hash(encoded: &str) -> Result<PwInfo> {
    let decoded = BASE32
        .decode(encoded.as_bytes())
        .map_err(|e| Error::PwHash(format!("invalid base32: {e}")))?;

    if decoded.len() != DECODED_LEN {
        return Err(Error::PwHash(format!(
            "decoded length {} != {DECODED_LEN}",
            decoded.len()
        )));
    }
    if decoded[0] != VERSION {
        return Err(Error::PwHash(format!(
            "unsupported version {:#04x}",
            decoded[0]
        )));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&decoded[1..=SALT_LEN]);
    let mut scrypt_hash = [0u8; HASH_LEN];
    scrypt_hash.copy_from_slice(&decoded[1 + SALT_LEN..]);

    Ok(PwInfo { salt, scrypt_hash })
}

/// Whether `password` matches the stored hash.
///
/// Plain byte comparison: both sides are scrypt outputs, so a timing
/// oracle reveals nothing useful about the password.
#[must_use]
pub fn check_pass(password: &str, info: &PwInfo) -> bool {
    derive(password, &info.salt) == info.scrypt_hash
}
