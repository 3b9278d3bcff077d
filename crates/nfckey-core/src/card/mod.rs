//! Card storage codec
//!
//! Encoding/decoding of the fixed 48-byte record written into a MIFARE
//! Classic data sector, and the block/sector addressing arithmetic both
//! ends must use consistently.
//!
//! The record is an NDEF text TLV kept byte-exact for compatibility with
//! cards already in the field: a fixed wrapper, 32 bytes of (encrypted)
//! key-segment payload at offset 14, the flag byte at offset 46 and the
//! TLV terminator at offset 47. The wrapper is structural padding, not
//! authenticated; decode does not validate it.

use serde::{Deserialize, Serialize};

/// Total record length: three 16-byte blocks of one data sector
pub const RECORD_LEN: usize = 48;

/// Offset of the 32-byte key-segment payload within the record
pub const PAYLOAD_OFFSET: usize = 14;

/// Offset of the [`FlagByte`] within the record
pub const FLAG_OFFSET: usize = 46;

/// Sector holding the key record on every card
pub const KEY_SECTOR: u8 = 1;

/// Default MIFARE authentication key (factory key, all 0xFF)
pub const DEFAULT_AUTH_KEY: [u8; 6] = [0xFF; 6];

/// Fixed NDEF wrapper preceding the payload
const WRAPPER: [u8; PAYLOAD_OFFSET] = [
    0x03, // NDEF message start marker
    0xFF, // 3-byte length field follows
    0x00, 0x2B, // message length
    0xC1, // record header: message begin/end, well-known type
    0x01, // type length
    0x00, 0x00, 0x00, 0x24, // payload length
    b'T', // text record type
    0x02, b'e', b'n', // UTF-8, language "en"
];

/// NDEF TLV terminator at the last record byte
const TERMINATOR: u8 = 0xFE;

const BLOCKS_PER_SHORT_SECTOR: u16 = 4;
const BLOCKS_PER_LONG_SECTOR: u16 = 16;
/// Sectors below this index have 4 blocks; the rest have 16 (MIFARE 4K)
const SHORT_SECTOR_COUNT: u16 = 32;

/// Storage-location metadata byte at [`FLAG_OFFSET`]
///
/// Bit 6 selects dual-card mode and must be tested first: the remaining
/// bits mean different things in the two modes. In dual-card mode bit 5
/// marks the card holding segment B. In single-card mode bits 0..=5 hold
/// the EEPROM slot index where segment B lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagByte(u8);

const DUAL_CARDS_BIT: u8 = 0b0100_0000;
const SEGMENT_B_BIT: u8 = 0b0010_0000;
const SLOT_INDEX_MASK: u8 = 0b0011_1111;

impl FlagByte {
    /// Flag for the first card of a dual-card pair (holds segment A)
    pub fn dual_primary() -> Self {
        Self(DUAL_CARDS_BIT)
    }

    /// Flag for the second card of a dual-card pair (holds segment B)
    pub fn dual_secondary() -> Self {
        Self(DUAL_CARDS_BIT | SEGMENT_B_BIT)
    }

    /// Flag for single-card mode, pointing at the EEPROM slot of segment B
    pub fn single(slot_index: u8) -> Self {
        Self(slot_index & SLOT_INDEX_MASK)
    }

    /// Reconstruct from a raw record byte
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw record byte
    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Whether the record belongs to a dual-card pair
    pub fn is_dual_cards(&self) -> bool {
        self.0 & DUAL_CARDS_BIT != 0
    }

    /// In dual-card mode, whether this card holds segment B
    pub fn holds_segment_b(&self) -> bool {
        debug_assert!(self.is_dual_cards());
        self.0 & SEGMENT_B_BIT != 0
    }

    /// In single-card mode, the EEPROM slot index of segment B
    pub fn slot_index(&self) -> u8 {
        debug_assert!(!self.is_dual_cards());
        self.0 & SLOT_INDEX_MASK
    }
}

/// Lay out a 48-byte card record around a 32-byte payload
pub fn encode_record(payload: &[u8; 32], flag: FlagByte) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..PAYLOAD_OFFSET].copy_from_slice(&WRAPPER);
    record[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 32].copy_from_slice(payload);
    record[FLAG_OFFSET] = flag.raw();
    record[RECORD_LEN - 1] = TERMINATOR;
    record
}

/// Extract the payload and flag from a 48-byte card record
pub fn decode_record(record: &[u8; RECORD_LEN]) -> ([u8; 32], FlagByte) {
    let mut payload = [0u8; 32];
    payload.copy_from_slice(&record[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 32]);
    (payload, FlagByte::from_raw(record[FLAG_OFFSET]))
}

/// Number of the first block of a sector
///
/// Every block computation on either end must go through this function or
/// [`trailer_block`]; an off-by-one here writes into unrelated sectors.
pub fn first_block(sector: u8) -> u8 {
    let sector = sector as u16;
    let block = if sector < SHORT_SECTOR_COUNT {
        sector * BLOCKS_PER_SHORT_SECTOR
    } else {
        SHORT_SECTOR_COUNT * BLOCKS_PER_SHORT_SECTOR
            + (sector - SHORT_SECTOR_COUNT) * BLOCKS_PER_LONG_SECTOR
    };
    block as u8
}

/// Number of the sector trailer block (keys + access bits)
pub fn trailer_block(sector: u8) -> u8 {
    let sector = sector as u16;
    let block = if sector < SHORT_SECTOR_COUNT {
        sector * BLOCKS_PER_SHORT_SECTOR + BLOCKS_PER_SHORT_SECTOR - 1
    } else {
        SHORT_SECTOR_COUNT * BLOCKS_PER_SHORT_SECTOR
            + (sector - SHORT_SECTOR_COUNT) * BLOCKS_PER_LONG_SECTOR
            + BLOCKS_PER_LONG_SECTOR
            - 1
    };
    block as u8
}
