//! `mysql_native_password` scramble computation.

use sha1::{Digest, Sha1};

/// SHA1(password) XOR SHA1(seed ∥ SHA1(SHA1(password))). Empty passwords
/// answer with an empty auth response.
pub fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let pass_hash = Sha1::digest(password.as_bytes());
    let pass_hash_hash = Sha1::digest(pass_hash);

    let mut mixer = Sha1::new();
    mixer.update(seed);
    mixer.update(pass_hash_hash);
    let mix = mixer.finalize();

    pass_hash
        .iter()
        .zip(mix.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}
