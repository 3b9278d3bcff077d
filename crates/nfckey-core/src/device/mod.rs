//! Reader-device firmware model
//!
//! The firmware side of the protocol: command dispatch, card access, the
//! EEPROM segment allocator and the fixed-key segment obfuscation. The
//! hardware seams ([`CardReader`], [`Nvm`]) are traits so the whole host
//! stack can be exercised against a simulated device ([`sim`]).

pub mod allocator;
pub mod dispatcher;
pub mod obfuscation;
pub mod sim;

pub use allocator::SegmentAllocator;
pub use dispatcher::Dispatcher;

use thiserror::Error;

/// Errors raised by card and persistent-memory storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Sector {0} authentication failed, re-present the card and try again.")]
    AuthenticationFailed(u8),

    #[error("Unable to read block {0}")]
    ReadFailed(u8),

    #[error("Unable to write block {0}")]
    WriteFailed(u8),

    #[error("EEPROM readback mismatch, slot {0} zeroed")]
    VerifyFailed(u8),

    #[error("Record points at invalid segment slot {0}")]
    InvalidSlot(u8),

    #[error("Key storage full.")]
    StorageFull,

    #[error("No card detected")]
    NoCard,
}

/// Contactless-card front end of the reader
///
/// `wait_for_card` blocks until a card is in the field; it is called once
/// per physical placement, including after a card swap.
pub trait CardReader {
    /// Block until a card is present and selected
    fn wait_for_card(&mut self) -> Result<(), StorageError>;

    /// Authenticate the sector containing `block` with a 6-byte key
    fn authenticate(&mut self, block: u8, key: &[u8; 6]) -> Result<(), StorageError>;

    /// Read one 16-byte block
    fn read_block(&mut self, block: u8) -> Result<[u8; 16], StorageError>;

    /// Write one 16-byte block
    fn write_block(&mut self, block: u8, data: &[u8; 16]) -> Result<(), StorageError>;
}

/// Byte-addressed non-volatile memory (the MCU's EEPROM)
pub trait Nvm {
    /// Total capacity in bytes
    fn len(&self) -> u16;

    /// Whether the memory is empty (all capacity, not content)
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one byte
    fn read(&self, addr: u16) -> u8;

    /// Write one byte, skipping the write if the cell already holds `value`
    /// (EEPROM cells have limited write endurance)
    fn update(&mut self, addr: u16, value: u8);
}
