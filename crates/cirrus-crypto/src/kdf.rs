//! PBKDF2-HMAC-SHA1 key derivation.
//!
//! Used to turn a user password into the volume wrap key (8192 rounds,
//! salt = bucket name).

use crate::SecretBuffer;

/// Derive `key_len` bytes from `password` and `salt`.
#[must_use]
pub fn derive_pbkdf2_sha1(password: &str, salt: &str, rounds: u32, key_len: usize) -> SecretBuffer {
    let mut out = vec![0u8; key_len];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password.as_bytes(), salt.as_bytes(), rounds, &mut out);
    SecretBuffer::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6070 PBKDF2-HMAC-SHA1 test vectors.

    #[test]
    fn test_should_match_rfc6070_one_round() {
        let key = derive_pbkdf2_sha1("password", "salt", 1, 20);
        assert_eq!(key.to_hex(), "0c60c80f961f0e71f3a9b524af6012062fe037a6");
    }

    #[test]
    fn test_should_match_rfc6070_two_rounds() {
        let key = derive_pbkdf2_sha1("password", "salt", 2, 20);
        assert_eq!(key.to_hex(), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
    }

    #[test]
    fn test_should_match_rfc6070_4096_rounds() {
        let key = derive_pbkdf2_sha1("password", "salt", 4096, 20);
        assert_eq!(key.to_hex(), "4b007901b765489abead49d926f721d065a429c1");
    }

    #[test]
    fn test_should_match_rfc6070_long_inputs() {
        let key = derive_pbkdf2_sha1(
            "passwordPASSWORDpassword",
            "saltSALTsaltSALTsaltSALTsaltSALTsalt",
            4096,
            25,
        );
        assert_eq!(
            key.to_hex(),
            "3d2eec4fe41c849b80c8d83662c0e44a8b291a964cf2f07038"
        );
    }

    #[test]
    fn test_should_derive_requested_length() {
        let key = derive_pbkdf2_sha1("password", "bucket-name", 8192, 32);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_should_be_deterministic() {
        let a = derive_pbkdf2_sha1("pw", "bucket", 8192, 32);
        let b = derive_pbkdf2_sha1("pw", "bucket", 8192, 32);
        assert_eq!(a, b);
    }
}
