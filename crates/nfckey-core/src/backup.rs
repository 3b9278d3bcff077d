//! Encrypted key backups
//!
//! A backup file holds both key segments encrypted under a user password.
//! The layout is hex text: 64 characters of salt followed immediately by
//! the ciphertext, no separator. The salt length is fixed, so the split
//! point is implicit. Key and IV are derived from the password with
//! PBKDF2-HMAC-SHA256; the ciphertext is AES-256-CBC with PKCS#7 padding.
//!
//! A wrong password surfaces as a padding failure on decrypt; there is no
//! authentication tag, matching the files already produced in the field.

use std::path::Path;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::keys::{KeySegment, SEGMENT_LEN};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// PBKDF2 iteration count; fixed by the existing backup format
pub const BACKUP_ITERATIONS: u32 = 10_000;

const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup file is not in the expected format")]
    Malformed,

    #[error("Wrong password or corrupted backup")]
    WrongPassword,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Password-derived cipher material, wiped on drop
struct DerivedKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

fn derive_keys(password: &str, salt: &[u8]) -> DerivedKeys {
    let mut okm = [0u8; KEY_LEN + IV_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, BACKUP_ITERATIONS, &mut okm);
    let mut derived = DerivedKeys {
        key: [0u8; KEY_LEN],
        iv: [0u8; IV_LEN],
    };
    derived.key.copy_from_slice(&okm[..KEY_LEN]);
    derived.iv.copy_from_slice(&okm[KEY_LEN..]);
    okm.zeroize();
    derived
}

/// Encrypt both segments under `password` into backup-file text
pub fn encrypt_backup(
    segment_a: &KeySegment,
    segment_b: &KeySegment,
    password: &str,
) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let derived = derive_keys(password, &salt);

    let mut plaintext = [0u8; 2 * SEGMENT_LEN];
    plaintext[..SEGMENT_LEN].copy_from_slice(segment_a.as_bytes());
    plaintext[SEGMENT_LEN..].copy_from_slice(segment_b.as_bytes());
    let ciphertext = Aes256CbcEnc::new(&derived.key.into(), &derived.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
    plaintext.zeroize();

    format!("{}{}", hex::encode_upper(salt), hex::encode_upper(ciphertext))
}

/// Decrypt backup-file text back into the two segments
pub fn decrypt_backup(
    contents: &str,
    password: &str,
) -> Result<(KeySegment, KeySegment), BackupError> {
    let contents = contents.trim();
    if contents.len() <= 2 * SALT_LEN {
        return Err(BackupError::Malformed);
    }
    let (salt_hex, cipher_hex) = contents.split_at(2 * SALT_LEN);
    let salt = hex::decode(salt_hex).map_err(|_| BackupError::Malformed)?;
    let ciphertext = hex::decode(cipher_hex).map_err(|_| BackupError::Malformed)?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(BackupError::Malformed);
    }

    let derived = derive_keys(password, &salt);
    let mut plaintext = Aes256CbcDec::new(&derived.key.into(), &derived.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| BackupError::WrongPassword)?;
    if plaintext.len() != 2 * SEGMENT_LEN {
        // Without an auth tag, garbage that happens to unpad cleanly is
        // indistinguishable from a bad passphrase.
        plaintext.zeroize();
        return Err(BackupError::WrongPassword);
    }

    let segment_a = KeySegment::from_slice(&plaintext[..SEGMENT_LEN]).ok_or(BackupError::Malformed);
    let segment_b = KeySegment::from_slice(&plaintext[SEGMENT_LEN..]).ok_or(BackupError::Malformed);
    plaintext.zeroize();
    Ok((segment_a?, segment_b?))
}

/// Write an encrypted backup of both segments to `path`
pub fn export_to_file(
    path: &Path,
    segment_a: &KeySegment,
    segment_b: &KeySegment,
    password: &str,
) -> Result<(), BackupError> {
    debug!(path = %path.display(), "writing key backup");
    std::fs::write(path, encrypt_backup(segment_a, segment_b, password))?;
    Ok(())
}

/// Read and decrypt the backup at `path`
pub fn import_from_file(
    path: &Path,
    password: &str,
) -> Result<(KeySegment, KeySegment), BackupError> {
    debug!(path = %path.display(), "reading key backup");
    let contents = std::fs::read_to_string(path)?;
    decrypt_backup(&contents, password)
}
