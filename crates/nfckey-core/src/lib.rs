//! # NfcKey Core Library
//!
//! Core functionality for the NfcKey identity-key manager.
//!
//! This library provides:
//! - Serial protocol client for the contactless reader device
//! - Card record codec and block addressing (MIFARE Classic)
//! - Firmware-side command dispatcher over pluggable hardware seams
//! - Persistent EEPROM segment allocator
//! - Key generation and password-encrypted backups
//! - Session workflow layer tying the above together
//!
//! ## Example
//!
//! ```rust,ignore
//! use nfckey_core::session::KeySession;
//!
//! // Connect to the first reader that answers the probe
//! let mut session = KeySession::connect()?;
//!
//! if session.is_password_protected()? {
//!     session.unlock("admin password")?;
//! }
//!
//! // Recover the identity key from the presented card(s)
//! let (segment_a, segment_b, dual) = session.recover_key(&mut || {
//!     println!("place the second card and press enter");
//! })?;
//! ```

pub mod backup;
pub mod card;
pub mod device;
pub mod keys;
pub mod protocol;
pub mod session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backup::BackupError;
    pub use crate::card::{decode_record, encode_record, FlagByte};
    pub use crate::device::{CardReader, Dispatcher, Nvm, SegmentAllocator, StorageError};
    pub use crate::keys::{pad_password, KeySegment, SEGMENT_LEN};
    pub use crate::protocol::{discover_device, Command, DeviceClient, ProtocolError};
    pub use crate::session::{KeySession, SessionError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
