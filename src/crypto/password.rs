//! Memory-hard password hashing (Argon2id, 64 MiB).
//!
//! Every hashing call in the process goes through one mutex. With the lock,
//! a burst of logins queues; without it, a handful of concurrent 64 MiB
//! hashes can take down the whole machine.

use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Algorithm tag stored alongside each credential. Verification of any
/// other tag fails closed.
pub const ALGO: &str = "argon2";

/// Salt length in bytes (256 bits).
pub const SALT_LEN: usize = 32;

/// Hash output length in bytes.
pub const HASH_LEN: usize = 32;

static PWD_LOCK: Mutex<()> = Mutex::new(());

/// Fresh random salt for a new credential.
pub fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hash `password` under `salt`: Argon2id, time cost 1, 64 MiB, 4 lanes.
/// Serialized process-wide.
pub fn hash(salt: &[u8], password: &str) -> [u8; HASH_LEN] {
    let _guard = PWD_LOCK.lock();
    let params =
        Params::new(64 * 1024, 1, 4, Some(HASH_LEN)).expect("argon2 parameters are in range");
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; HASH_LEN];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .expect("argon2 accepts any password and a 32-byte salt");
    out
}

/// Recompute under the stored algorithm tag and compare in constant time.
pub fn verify(algo: &str, salt: &[u8], stored: &[u8], password: &str) -> bool {
    match algo {
        ALGO => {
            let computed = hash(salt, password);
            bool::from(computed[..].ct_eq(stored))
        }
        other => {
            warn!(algo = other, "unrecognized password hash algorithm");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let salt = new_salt();
        let stored = hash(&salt, "p4ss01");
        assert!(verify(ALGO, &salt, &stored, "p4ss01"));
        assert!(!verify(ALGO, &salt, &stored, "wrong"));
    }

    #[test]
    fn test_salt_changes_hash() {
        let a = hash(&new_salt(), "p4ss01");
        let b = hash(&new_salt(), "p4ss01");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_algo_fails_closed() {
        let salt = new_salt();
        let stored = hash(&salt, "p4ss01");
        assert!(!verify("scrypt", &salt, &stored, "p4ss01"));
        assert!(!verify("", &salt, &stored, "p4ss01"));
    }
}
