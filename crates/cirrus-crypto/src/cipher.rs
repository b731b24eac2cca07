//! AES-256 ciphers: CBC with PKCS#7 padding and CTR with byte-offset seek.
//!
//! The CTR counter block is `iv[0..8] || be64(block_counter)`, so the IV is
//! 8 bytes and seeking to a byte offset positions the counter at
//! `offset / 16`. Encryption and decryption are the same keystream XOR.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};

use crate::{CryptoError, SymmetricKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr = ctr::Ctr64BE<Aes256>;

/// AES block length; CTR offsets must be multiples of this.
pub const CTR_BLOCK_LEN: u64 = 16;

/// AES-CBC-256 with PKCS#7 padding.
#[derive(Debug)]
pub struct AesCbc256;

impl AesCbc256 {
    /// Key length in bytes.
    pub const KEY_LEN: usize = 32;
    /// IV length in bytes.
    pub const IV_LEN: usize = 16;

    /// Encrypt `plaintext`, returning padded ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] when the key or IV has the wrong
    /// length.
    pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256CbcEnc::new_from_slices(key.key().as_bytes(), key.iv().as_bytes())
                .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Decrypt padded ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] when the key or IV has the wrong
    /// length, or the padding is invalid (which is what a wrong key looks
    /// like).
    pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256CbcDec::new_from_slices(key.key().as_bytes(), key.iv().as_bytes())
                .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Cipher("bad padding".to_owned()))
    }

    /// Encrypt a UTF-8 string, returning hex ciphertext.
    ///
    /// # Errors
    ///
    /// See [`AesCbc256::encrypt`].
    pub fn encrypt_to_hex(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
        Ok(crate::hex_encode(&Self::encrypt(key, plaintext.as_bytes())?))
    }

    /// Decrypt hex ciphertext into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`AesCbc256::decrypt`]; additionally fails when the plaintext
    /// is not UTF-8.
    pub fn decrypt_from_hex(key: &SymmetricKey, hex_ct: &str) -> Result<String, CryptoError> {
        let plaintext = Self::decrypt(key, &crate::hex_decode(hex_ct)?)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Cipher("plaintext is not UTF-8".to_owned()))
    }
}

/// AES-CTR-256 with a 64-bit IV and a 64-bit big-endian block counter.
#[derive(Debug)]
pub struct AesCtr256;

impl AesCtr256 {
    /// Key length in bytes.
    pub const KEY_LEN: usize = 32;
    /// IV length in bytes (the upper half of the counter block).
    pub const IV_LEN: usize = 8;

    /// Transform `data` in place with the keystream starting at
    /// `starting_block`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] when the key or IV has the wrong
    /// length.
    pub fn crypt_with_starting_block(
        key: &SymmetricKey,
        starting_block: u64,
        data: &mut [u8],
    ) -> Result<(), CryptoError> {
        if key.iv().len() != Self::IV_LEN {
            return Err(CryptoError::Cipher(
                "iv length is not valid for AES-CTR-256".to_owned(),
            ));
        }

        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(key.iv().as_bytes());
        nonce[8..].copy_from_slice(&starting_block.to_be_bytes());

        let mut cipher = Aes256Ctr::new_from_slices(key.key().as_bytes(), &nonce)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        cipher.apply_keystream(data);
        Ok(())
    }

    /// Transform `data` in place at a byte offset, which must be a
    /// multiple of [`CTR_BLOCK_LEN`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] for misaligned offsets or bad key
    /// material.
    pub fn crypt_at_offset(
        key: &SymmetricKey,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), CryptoError> {
        if offset % CTR_BLOCK_LEN != 0 {
            return Err(CryptoError::Cipher(
                "offset must be a multiple of the cipher block length".to_owned(),
            ));
        }
        Self::crypt_with_starting_block(key, offset / CTR_BLOCK_LEN, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SecretBuffer;

    fn cbc_key() -> SymmetricKey {
        SymmetricKey::generate(AesCbc256::KEY_LEN, AesCbc256::IV_LEN)
    }

    fn ctr_key() -> SymmetricKey {
        SymmetricKey::generate(AesCtr256::KEY_LEN, AesCtr256::IV_LEN)
    }

    #[test]
    fn test_should_round_trip_cbc() {
        let key = cbc_key();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext = vec![0xabu8; len];
            let ciphertext = AesCbc256::encrypt(&key, &plaintext).expect("encrypt");
            // PKCS#7 always pads, so ciphertext is strictly longer.
            assert!(ciphertext.len() > plaintext.len());
            assert_eq!(
                AesCbc256::decrypt(&key, &ciphertext).expect("decrypt"),
                plaintext
            );
        }
    }

    #[test]
    fn test_should_match_cbc_nist_vector() {
        // NIST SP 800-38A F.2.5 (CBC-AES256), first block; PKCS#7 appends
        // one extra padding block after it.
        let key = SymmetricKey::new(
            SecretBuffer::from_hex(
                "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
            )
            .expect("key"),
            SecretBuffer::from_hex("000102030405060708090a0b0c0d0e0f").expect("iv"),
        );
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").expect("pt");

        let ciphertext = AesCbc256::encrypt(&key, &plaintext).expect("encrypt");
        assert_eq!(
            hex::encode(&ciphertext[..16]),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd6"
        );
    }

    #[test]
    fn test_should_fail_cbc_decrypt_with_wrong_key() {
        let ciphertext = AesCbc256::encrypt(&cbc_key(), b"secret").expect("encrypt");
        assert!(AesCbc256::decrypt(&cbc_key(), &ciphertext).is_err());
    }

    #[test]
    fn test_should_round_trip_cbc_hex_string() {
        let key = cbc_key();
        let hex_ct = AesCbc256::encrypt_to_hex(&key, "s3fuse-00 deadbeef").expect("encrypt");
        assert_eq!(
            AesCbc256::decrypt_from_hex(&key, &hex_ct).expect("decrypt"),
            "s3fuse-00 deadbeef"
        );
    }

    #[test]
    fn test_should_match_ctr_nist_vector() {
        // NIST SP 800-38A F.5.5 (CTR-AES256): counter block
        // f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff split into an 8-byte IV and a
        // starting block counter.
        let key = SymmetricKey::new(
            SecretBuffer::from_hex(
                "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
            )
            .expect("key"),
            SecretBuffer::from_hex("f0f1f2f3f4f5f6f7").expect("iv"),
        );
        let mut data = hex::decode(
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51",
        )
        .expect("pt");

        AesCtr256::crypt_with_starting_block(&key, 0xf8f9_fafb_fcfd_feff, &mut data)
            .expect("crypt");
        assert_eq!(
            hex::encode(&data),
            "601ec313775789a5b7a7f504bbf3d228f443e3ca4d62b59aca84e990cacaf5c5"
        );
    }

    #[test]
    fn test_should_round_trip_ctr_at_offsets() {
        let key = ctr_key();
        let original = vec![0x5au8; 64 * 1024];

        for offset in [0u64, 16, 4096, 128 * 1024] {
            let mut data = original.clone();
            AesCtr256::crypt_at_offset(&key, offset, &mut data).expect("encrypt");
            assert_ne!(data, original);
            AesCtr256::crypt_at_offset(&key, offset, &mut data).expect("decrypt");
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_should_match_seeked_and_contiguous_ctr() {
        // Encrypting [0..64KiB) in one call must equal encrypting the two
        // 32 KiB halves at their own offsets.
        let key = ctr_key();
        let original: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        let mut whole = original.clone();
        AesCtr256::crypt_at_offset(&key, 0, &mut whole).expect("whole");

        let mut first = original[..32 * 1024].to_vec();
        let mut second = original[32 * 1024..].to_vec();
        AesCtr256::crypt_at_offset(&key, 0, &mut first).expect("first");
        AesCtr256::crypt_at_offset(&key, 32 * 1024, &mut second).expect("second");

        assert_eq!(&whole[..32 * 1024], &first[..]);
        assert_eq!(&whole[32 * 1024..], &second[..]);
    }

    #[test]
    fn test_should_reject_misaligned_ctr_offset() {
        let mut data = [0u8; 16];
        assert!(AesCtr256::crypt_at_offset(&ctr_key(), 7, &mut data).is_err());
    }

    #[test]
    fn test_should_reject_wrong_ctr_iv_length() {
        let key = SymmetricKey::generate(AesCtr256::KEY_LEN, 16);
        let mut data = [0u8; 16];
        assert!(AesCtr256::crypt_at_offset(&key, 0, &mut data).is_err());
    }
}
