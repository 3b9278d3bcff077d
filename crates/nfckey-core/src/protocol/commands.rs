//! Protocol commands
//!
//! Defines the single-byte command codes understood by the reader firmware.
//! Each session turn is one code, optionally followed by a fixed-size
//! payload, answered by carriage-return-terminated ASCII status lines.

use serde::{Deserialize, Serialize};

/// Commands accepted by the reader device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Confirm/continue code ('~'): synchronize with a physically placed card
    Continue,

    /// Report whether an admin password is set ('a')
    QueryPasswordProtected,

    /// Create the admin password ('b'), followed by a 32-byte payload
    CreateAdminPassword,

    /// Verify the admin password ('c'), followed by a 32-byte payload
    VerifyAdminPassword,

    /// Recover the key segments from card(s)/EEPROM ('d')
    RecoverSegments,

    /// Write the key segments to card(s)/EEPROM ('e'),
    /// followed by a 1-byte dual-card flag and two 32-byte segments
    WriteSegments,
}

impl Command {
    /// The wire byte for this command
    pub fn code(&self) -> u8 {
        match self {
            Command::Continue => b'~',
            Command::QueryPasswordProtected => b'a',
            Command::CreateAdminPassword => b'b',
            Command::VerifyAdminPassword => b'c',
            Command::RecoverSegments => b'd',
            Command::WriteSegments => b'e',
        }
    }

    /// Decode a wire byte into a command.
    ///
    /// Decoding happens once at the transport boundary; everything past
    /// this point dispatches on the closed enum, not on raw bytes.
    pub fn decode(byte: u8) -> Option<Self> {
        match byte {
            b'~' => Some(Command::Continue),
            b'a' => Some(Command::QueryPasswordProtected),
            b'b' => Some(Command::CreateAdminPassword),
            b'c' => Some(Command::VerifyAdminPassword),
            b'd' => Some(Command::RecoverSegments),
            b'e' => Some(Command::WriteSegments),
            _ => None,
        }
    }

    /// Number of payload bytes the device expects after this code
    pub fn payload_len(&self) -> usize {
        match self {
            Command::CreateAdminPassword | Command::VerifyAdminPassword => 32,
            Command::WriteSegments => 65, // dual-card flag + two segments
            _ => 0,
        }
    }
}

/// Status line tags emitted by the firmware, scanned as substrings by the host
pub mod tags {
    /// Card presence confirmation after a continue code
    pub const FOUND_CARD: &str = "Found a card!";
    /// Password-protection state, `true`/`false`
    pub const PASSWORD_PROTECTED: &str = "passwordProtected=";
    /// Password creation result, `true`/`false`
    pub const PASSWORD_CREATION: &str = "passwordCreation=";
    /// Password verification result, `true`/`false`
    pub const PASSWORD_CORRECT: &str = "passwordCorrect=";
    /// Dual-card flag read from the first card, `true`/`false`
    pub const DUAL_CARDS: &str = "DualCards=";
    /// Prefix of the 64 raw key-segment bytes
    pub const KEY_SEGMENTS: &str = "Key segments: ";
    /// First card write confirmation
    pub const FIRST_CARD_WRITTEN: &str = "First card written.";
    /// Second card write confirmation (dual-card mode)
    pub const SECOND_CARD_WRITTEN: &str = "Second card written.";
    /// EEPROM write confirmation (single-card mode)
    pub const EEPROM_WRITTEN: &str = "EEPROM written.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::Continue.code(), b'~');
        assert_eq!(Command::QueryPasswordProtected.code(), b'a');
        assert_eq!(Command::WriteSegments.code(), b'e');
    }

    #[test]
    fn test_decode_round_trip() {
        for cmd in [
            Command::Continue,
            Command::QueryPasswordProtected,
            Command::CreateAdminPassword,
            Command::VerifyAdminPassword,
            Command::RecoverSegments,
            Command::WriteSegments,
        ] {
            assert_eq!(Command::decode(cmd.code()), Some(cmd));
        }
    }

    #[test]
    fn test_decode_rejects_unknown() {
        assert_eq!(Command::decode(b'z'), None);
        assert_eq!(Command::decode(0x00), None);
    }

    #[test]
    fn test_payload_lengths() {
        assert_eq!(Command::CreateAdminPassword.payload_len(), 32);
        assert_eq!(Command::VerifyAdminPassword.payload_len(), 32);
        assert_eq!(Command::WriteSegments.payload_len(), 65);
        assert_eq!(Command::RecoverSegments.payload_len(), 0);
    }
}
