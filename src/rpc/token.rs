//! Correlation token generation.

use rand::Rng;

/// Length of a generated correlation token.
pub const TOKEN_LENGTH: usize = 32;

/// Token alphabet. Leaves out `0 O 1 I l`, which are easy to misread in logs.
const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Generate a random correlation token.
///
/// 57 symbols over 32 positions gives roughly 186 bits, so collisions among
/// in-flight calls are not a practical concern.
pub fn correlation_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LENGTH)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
