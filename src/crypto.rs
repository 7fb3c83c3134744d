//! WinZip AE-2 encryption primitives
//!
//! AES-256 in CTR mode with a little-endian block counter starting at 1,
//! keys derived with PBKDF2-HMAC-SHA1 (1000 iterations) from the password
//! and a 16-byte random salt, and an HMAC-SHA1 authentication code over the
//! ciphertext, truncated to 10 bytes. The on-disk layout of an encrypted
//! payload is `salt || verify(2) || ciphertext || auth(10)`; the header CRC
//! of AE-2 entries is zero.

use aes::Aes256;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128LE,
};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

use crate::error::{Result, ZipError};

type HmacSha1 = Hmac<Sha1>;
type Aes256Ctr = Ctr128LE<Aes256>;

/// Salt length for AES-256
pub const SALT_LENGTH: usize = 16;
/// Password-verification prefix length
pub const VERIFY_LENGTH: usize = 2;
/// Truncated HMAC-SHA1 authentication code length
pub const AUTH_LENGTH: usize = 10;
/// Fixed byte overhead an AE-2 payload adds around the ciphertext
pub const OVERHEAD: usize = SALT_LENGTH + VERIFY_LENGTH + AUTH_LENGTH;

const KEY_LENGTH: usize = 32;
const PBKDF2_ITERATIONS: u32 = 1000;

struct DerivedKeys {
    cipher_key: [u8; KEY_LENGTH],
    auth_key: [u8; KEY_LENGTH],
    verify: [u8; VERIFY_LENGTH],
}

fn derive_keys(password: &str, salt: &[u8]) -> DerivedKeys {
    let mut material = [0u8; KEY_LENGTH * 2 + VERIFY_LENGTH];
    pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut material);

    let mut keys = DerivedKeys {
        cipher_key: [0u8; KEY_LENGTH],
        auth_key: [0u8; KEY_LENGTH],
        verify: [0u8; VERIFY_LENGTH],
    };
    keys.cipher_key.copy_from_slice(&material[..KEY_LENGTH]);
    keys.auth_key
        .copy_from_slice(&material[KEY_LENGTH..KEY_LENGTH * 2]);
    keys.verify.copy_from_slice(&material[KEY_LENGTH * 2..]);
    keys
}

fn make_cipher(key: &[u8; KEY_LENGTH]) -> Aes256Ctr {
    // WinZip counts blocks little-endian starting at 1
    let mut iv = [0u8; 16];
    iv[0] = 1;
    Aes256Ctr::new(key.into(), (&iv).into())
}

fn make_hmac(key: &[u8; KEY_LENGTH]) -> Result<HmacSha1> {
    HmacSha1::new_from_slice(key)
        .map_err(|e| ZipError::BadFormat(format!("HMAC init failed: {}", e)))
}

/// Encryption context for one entry payload.
pub struct EntryEncryptor {
    cipher: Aes256Ctr,
    hmac: HmacSha1,
    header: Option<Vec<u8>>,
}

impl EntryEncryptor {
    /// Derive keys from `password` under a fresh random salt.
    pub fn new(password: &str) -> Result<Self> {
        let mut salt = [0u8; SALT_LENGTH];
        getrandom::getrandom(&mut salt).map_err(std::io::Error::from)?;
        Self::with_salt(password, salt)
    }

    fn with_salt(password: &str, salt: [u8; SALT_LENGTH]) -> Result<Self> {
        let keys = derive_keys(password, &salt);
        let mut header = Vec::with_capacity(SALT_LENGTH + VERIFY_LENGTH);
        header.extend_from_slice(&salt);
        header.extend_from_slice(&keys.verify);
        Ok(Self {
            cipher: make_cipher(&keys.cipher_key),
            hmac: make_hmac(&keys.auth_key)?,
            header: Some(header),
        })
    }

    /// Encrypt one plaintext window, prepending the salt and verification
    /// bytes the first time output is produced.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = self.header.take().unwrap_or_default();
        let start = out.len();
        out.extend_from_slice(plaintext);
        self.cipher.apply_keystream(&mut out[start..]);
        self.hmac.update(&out[start..]);
        out
    }

    /// Emit the trailing authentication code (and the header, for an empty
    /// payload that never saw an `encrypt` call).
    pub fn finish(mut self) -> Vec<u8> {
        let mut out = self.header.take().unwrap_or_default();
        let mac = self.hmac.finalize().into_bytes();
        out.extend_from_slice(&mac[..AUTH_LENGTH]);
        out
    }
}

/// Decryption context for one entry payload.
pub struct EntryDecryptor {
    cipher: Aes256Ctr,
    hmac: HmacSha1,
}

impl std::fmt::Debug for EntryDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryDecryptor").finish_non_exhaustive()
    }
}

impl EntryDecryptor {
    /// Derive keys for `password` under `salt` and check the two
    /// verification bytes before any payload is touched.
    pub fn new(password: &str, salt: &[u8], verify: &[u8; VERIFY_LENGTH]) -> Result<Self> {
        let keys = derive_keys(password, salt);
        if keys.verify != *verify {
            return Err(ZipError::InvalidPassword);
        }
        Ok(Self {
            cipher: make_cipher(&keys.cipher_key),
            hmac: make_hmac(&keys.auth_key)?,
        })
    }

    /// Decrypt one ciphertext window in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.hmac.update(data);
        self.cipher.apply_keystream(data);
    }

    /// Check the trailing authentication code against the ciphertext seen
    /// so far.
    pub fn verify_auth(&self, auth: &[u8]) -> Result<()> {
        let expected = self.hmac.clone().finalize().into_bytes();
        if &expected[..AUTH_LENGTH] != auth {
            return Err(ZipError::InvalidSignature(
                "authentication code mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_payload(payload: &[u8]) -> (&[u8], [u8; VERIFY_LENGTH], &[u8], &[u8]) {
        let salt = &payload[..SALT_LENGTH];
        let verify = [payload[SALT_LENGTH], payload[SALT_LENGTH + 1]];
        let body = &payload[SALT_LENGTH + VERIFY_LENGTH..payload.len() - AUTH_LENGTH];
        let auth = &payload[payload.len() - AUTH_LENGTH..];
        (salt, verify, body, auth)
    }

    #[test]
    fn chunked_roundtrip() {
        let mut encryptor = EntryEncryptor::new("hunter2").unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&encryptor.encrypt(b"Hello, "));
        payload.extend_from_slice(&encryptor.encrypt(b"encrypted world!"));
        payload.extend_from_slice(&encryptor.finish());
        assert_eq!(payload.len(), b"Hello, encrypted world!".len() + OVERHEAD);

        let (salt, verify, body, auth) = split_payload(&payload);
        let mut decryptor = EntryDecryptor::new("hunter2", salt, &verify).unwrap();
        let mut plain = body.to_vec();
        decryptor.decrypt(&mut plain);
        decryptor.verify_auth(auth).unwrap();
        assert_eq!(plain, b"Hello, encrypted world!");
    }

    #[test]
    fn empty_payload_still_carries_header_and_auth() {
        let encryptor = EntryEncryptor::new("pw").unwrap();
        let payload = encryptor.finish();
        assert_eq!(payload.len(), OVERHEAD);
    }

    #[test]
    fn wrong_password_is_detected_by_verify_bytes() {
        let mut encryptor = EntryEncryptor::new("correct").unwrap();
        let mut payload = encryptor.encrypt(b"secret");
        payload.extend_from_slice(&encryptor.finish());
        let (salt, verify, _, _) = split_payload(&payload);
        let err = EntryDecryptor::new("wrong", salt, &verify).unwrap_err();
        assert!(matches!(err, ZipError::InvalidPassword));
    }

    #[test]
    fn flipped_ciphertext_fails_auth() {
        let mut encryptor = EntryEncryptor::new("pw").unwrap();
        let mut payload = encryptor.encrypt(b"some stored data");
        payload.extend_from_slice(&encryptor.finish());
        payload[SALT_LENGTH + VERIFY_LENGTH] ^= 0x01;

        let (salt, verify, body, auth) = split_payload(&payload);
        let mut decryptor = EntryDecryptor::new("pw", salt, &verify).unwrap();
        let mut plain = body.to_vec();
        decryptor.decrypt(&mut plain);
        let err = decryptor.verify_auth(auth).unwrap_err();
        assert!(matches!(err, ZipError::InvalidSignature(_)));
    }
}
