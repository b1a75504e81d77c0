//! Cryptographically secure random values.

use rand::{Rng, RngCore};

/// Hex encoding of `len` random bytes
pub fn random_hex(len: usize) -> String {
    hex::encode(random_bytes(len))
}

/// `len` random bytes from the thread-local CSPRNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// String of `len` random decimal digits
pub fn numeric_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}
