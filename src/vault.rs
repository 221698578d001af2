//! At-rest encryption of user secret keys.
//!
//! Vault entries are stored inside the configuration document (see
//! [`crate::config::StoredKey`]).  The cipher layout is fixed: AES-256-CBC
//! under a PBKDF2-HMAC-SHA256 key (100 000 iterations, 32-byte key, 16-byte
//! per-secret salt), with `data = hex(salt ∥ ciphertext)` and an independent
//! 16-byte IV in `iv = hex(iv)`.  Existing vaults depend on this exact
//! layout, so it must not change.

use std::fmt;
use std::num::NonZeroU32;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use nostr::Keys;
use rand::RngCore;
use ring::pbkdf2;
use zeroize::Zeroizing;

use crate::config::StoredKey;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
const AES_BLOCK: usize = 16;

//----------- EncryptedSecret --------------------------------------------------

/// A passphrase-encrypted secret in its on-disk form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSecret {
    /// Hex-encoded IV.
    pub iv: String,

    /// Hex-encoded `salt ∥ ciphertext`.
    pub data: String,
}

//----------- VaultError -------------------------------------------------------

/// An error unlocking a vault entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VaultError {
    /// The passphrase does not match the entry.
    DecryptionFailed,

    /// The entry is not valid hex or has an impossible length.
    CorruptEntry,

    /// The entry is encrypted and no passphrase was supplied.
    MissingPassphrase,

    /// The decrypted (or plain) secret is not a usable key.
    BadSecret,
}

impl std::error::Error for VaultError {}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DecryptionFailed => "decryption failed",
            Self::CorruptEntry => "corrupt vault entry",
            Self::MissingPassphrase => "a passphrase is required for this key",
            Self::BadSecret => "the secret is not a valid key",
        })
    }
}

//--- Encryption

/// Encrypt a secret under a passphrase.
pub fn encrypt_secret(plaintext: &str, passphrase: &str) -> EncryptedSecret {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_ref(), &iv)
        .expect("key and IV lengths are fixed")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut data = Vec::with_capacity(SALT_LEN + ciphertext.len());
    data.extend_from_slice(&salt);
    data.extend_from_slice(&ciphertext);

    EncryptedSecret {
        iv: hex::encode(iv),
        data: hex::encode(data),
    }
}

/// Decrypt a secret with a passphrase.
///
/// The returned plaintext is zeroised on drop.
pub fn decrypt_secret(
    iv: &str,
    data: &str,
    passphrase: &str,
) -> Result<Zeroizing<String>, VaultError> {
    let iv = hex::decode(iv).map_err(|_| VaultError::CorruptEntry)?;
    let data = hex::decode(data).map_err(|_| VaultError::CorruptEntry)?;
    if iv.len() != IV_LEN
        || data.len() < SALT_LEN + AES_BLOCK
        || (data.len() - SALT_LEN) % AES_BLOCK != 0
    {
        return Err(VaultError::CorruptEntry);
    }

    let (salt, ciphertext) = data.split_at(SALT_LEN);
    let key = derive_key(passphrase, salt);
    let plaintext = Aes256CbcDec::new_from_slices(key.as_ref(), &iv)
        .expect("key and IV lengths were checked")
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::DecryptionFailed)?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::DecryptionFailed)
}

/// Derive the AES key for a (passphrase, salt) pair.
fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("the iteration count is non-zero"),
        salt,
        passphrase.as_bytes(),
        key.as_mut(),
    );
    key
}

//--- Unlocking

/// Unlock a stored key into a usable signing identity.
pub fn unlock_stored(stored: &StoredKey, passphrase: Option<&str>) -> Result<Keys, VaultError> {
    match stored {
        StoredKey::Plain { key } => Keys::parse(key).map_err(|_| VaultError::BadSecret),
        StoredKey::Encrypted { iv, data } => {
            let passphrase = passphrase.ok_or(VaultError::MissingPassphrase)?;
            let plaintext = decrypt_secret(iv, data, passphrase)?;
            Keys::parse(plaintext.trim()).map_err(|_| VaultError::BadSecret)
        }
    }
}

/// Encrypt a secret into its stored form.
pub fn store_secret(secret: &str, passphrase: Option<&str>) -> StoredKey {
    match passphrase {
        Some(passphrase) if !passphrase.is_empty() => {
            let EncryptedSecret { iv, data } = encrypt_secret(secret, passphrase);
            StoredKey::Encrypted { iv, data }
        }
        _ => StoredKey::Plain {
            key: secret.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let secret = "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5";
        let encrypted = encrypt_secret(secret, "correct horse battery staple");
        let plaintext =
            decrypt_secret(&encrypted.iv, &encrypted.data, "correct horse battery staple").unwrap();
        assert_eq!(&*plaintext, secret);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let encrypted = encrypt_secret("a fairly long plaintext secret value", "passphrase one");
        let err = decrypt_secret(&encrypted.iv, &encrypted.data, "passphrase two").unwrap_err();
        assert_eq!(err, VaultError::DecryptionFailed);
    }

    #[test]
    fn on_disk_layout() {
        let encrypted = encrypt_secret("0123456789abcdef", "pw");
        // 16-byte IV.
        assert_eq!(encrypted.iv.len(), IV_LEN * 2);
        // 16-byte salt, then whole AES blocks.
        let data = hex::decode(&encrypted.data).unwrap();
        assert!(data.len() > SALT_LEN);
        assert_eq!((data.len() - SALT_LEN) % AES_BLOCK, 0);
    }

    #[test]
    fn malformed_entries_are_corrupt() {
        assert_eq!(
            decrypt_secret("zz", "00", "pw").unwrap_err(),
            VaultError::CorruptEntry
        );
        assert_eq!(
            decrypt_secret("00112233445566778899aabbccddeeff", "abcd", "pw").unwrap_err(),
            VaultError::CorruptEntry
        );
    }

    #[test]
    fn unlock_plain_hex_and_nsec() {
        let keys = Keys::generate();
        let hex_secret = keys.secret_key().to_secret_hex();

        let stored = StoredKey::Plain {
            key: hex_secret.clone(),
        };
        let unlocked = unlock_stored(&stored, None).unwrap();
        assert_eq!(unlocked.public_key(), keys.public_key());
    }

    #[test]
    fn unlock_encrypted_requires_passphrase() {
        let keys = Keys::generate();
        let stored = store_secret(&keys.secret_key().to_secret_hex(), Some("pw"));
        assert!(stored.is_encrypted());

        assert_eq!(
            unlock_stored(&stored, None).unwrap_err(),
            VaultError::MissingPassphrase
        );
        let unlocked = unlock_stored(&stored, Some("pw")).unwrap();
        assert_eq!(unlocked.public_key(), keys.public_key());
    }
}
