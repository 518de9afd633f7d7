pub mod password;   // memory-hard salted password hashing
pub mod token;      // keyed, domain-separated digests for invite/cookie tokens

use rand::rngs::OsRng;
use rand::RngCore;

/// Byte length of the game signing key.
pub const KEY_LEN: usize = 32;

/// Shortest key the store will accept as valid. Anything under this is
/// treated as an uninitialized store.
pub const MIN_KEY_LEN: usize = 10;

/// Generate a fresh signing key from the OS entropy source. Called exactly
/// once, when a new store is created; the key is immutable afterwards.
pub fn new_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_length_and_entropy() {
        let a = new_key();
        let b = new_key();
        assert_eq!(a.len(), KEY_LEN);
        // two draws from the OS RNG colliding means something is very wrong
        assert_ne!(a, b);
    }
}
