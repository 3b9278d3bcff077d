//! Identity-key material
//!
//! The identity key is two opaque 32-byte segments. Segments are created
//! whole at generation or import time and only ever replaced whole; partial
//! updates do not exist in this model.

use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of one key segment in bytes
pub const SEGMENT_LEN: usize = 32;

/// Printable character set used for generated key segments
///
/// Matches the alphabet burned into existing backups, so generated and
/// imported keys are interchangeable.
const KEY_CHARSET: &[u8] = b":_eD;PFv@XHUld#*SQE<K}B?i2^w>k.s\
=hNoCj3!10rq6ZY-gLbzT$t%mx[a8]WM\
IyAcf&n+5R/(V97{JuOG,)p4";

/// One 32-byte half of the composite identity key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySegment([u8; SEGMENT_LEN]);

impl KeySegment {
    /// Wrap existing segment bytes
    pub fn from_bytes(bytes: [u8; SEGMENT_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy a 32-byte slice into a segment
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SEGMENT_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Generate a fresh random segment from the printable key charset
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; SEGMENT_LEN];
        for b in bytes.iter_mut() {
            *b = KEY_CHARSET[rng.gen_range(0..KEY_CHARSET.len())];
        }
        Self(bytes)
    }

    /// Borrow the raw segment bytes
    pub fn as_bytes(&self) -> &[u8; SEGMENT_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material
        f.write_str("KeySegment(..)")
    }
}

/// Pad a password to the fixed 32-byte wire size with NUL bytes
///
/// Returns `None` if the password is longer than 32 bytes; the device
/// compares all 32 bytes, so truncating silently would lock the user out.
pub fn pad_password(password: &str) -> Option<[u8; SEGMENT_LEN]> {
    let raw = password.as_bytes();
    if raw.len() > SEGMENT_LEN {
        return None;
    }
    let mut padded = [0u8; SEGMENT_LEN];
    padded[..raw.len()].copy_from_slice(raw);
    Some(padded)
}
