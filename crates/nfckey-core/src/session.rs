//! Key session
//!
//! High-level workflow layer over [`DeviceClient`]: discovery, the admin
//! password gate, key generation, card/EEPROM writes, recovery and
//! encrypted backups. One session owns one device connection.
//!
//! Privileged operations (writing and recovering key material, backups)
//! require the session to be unlocked first. An unprotected device unlocks
//! implicitly on the first privileged call.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::backup::{self, BackupError};
use crate::keys::{pad_password, KeySegment};
use crate::protocol::{discover_device, DeviceClient, ProtocolError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is locked; verify the admin password first")]
    Locked,

    #[error("Password is longer than 32 bytes")]
    PasswordTooLong,

    #[error("Device rejected the password change")]
    PasswordRejected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// A connection to one reader device plus the unlock state
pub struct KeySession {
    client: DeviceClient,
    unlocked: bool,
}

impl KeySession {
    /// Probe serial ports and connect to the first responding reader
    pub fn connect() -> Result<Self, ProtocolError> {
        let port = discover_device()?;
        info!(port = %port, "connected to reader");
        Ok(Self::with_client(DeviceClient::open(&port)?))
    }

    /// Connect to a specific serial port
    pub fn open(port_name: &str) -> Result<Self, ProtocolError> {
        Ok(Self::with_client(DeviceClient::open(port_name)?))
    }

    /// Wrap an existing client (tests drive an in-memory channel this way)
    pub fn with_client(client: DeviceClient) -> Self {
        Self {
            client,
            unlocked: false,
        }
    }

    /// Whether the device has an admin password set
    pub fn is_password_protected(&mut self) -> Result<bool, ProtocolError> {
        self.client.query_password_protected()
    }

    /// Set the admin password. Requires unlock when one is already set.
    pub fn set_admin_password(&mut self, password: &str) -> Result<(), SessionError> {
        let padded = pad_password(password).ok_or(SessionError::PasswordTooLong)?;
        if !self.unlocked && self.client.query_password_protected()? {
            return Err(SessionError::Locked);
        }
        if !self.client.create_admin_password(&padded)? {
            return Err(SessionError::PasswordRejected);
        }
        // Whoever just set the password evidently knows it
        self.unlocked = true;
        Ok(())
    }

    /// Verify the admin password; a correct password unlocks the session
    pub fn unlock(&mut self, password: &str) -> Result<bool, SessionError> {
        let padded = pad_password(password).ok_or(SessionError::PasswordTooLong)?;
        let correct = self.client.verify_admin_password(&padded)?;
        if correct {
            debug!("session unlocked");
            self.unlocked = true;
        }
        Ok(correct)
    }

    /// Whether privileged operations are currently allowed
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn require_unlocked(&mut self) -> Result<(), SessionError> {
        if self.unlocked {
            return Ok(());
        }
        if self.client.query_password_protected()? {
            return Err(SessionError::Locked);
        }
        // No password set, nothing to verify against
        self.unlocked = true;
        Ok(())
    }

    /// Generate a fresh identity key and write it out
    ///
    /// Returns the segments so the caller can offer an immediate backup.
    /// `confirm_swap` blocks until the operator placed the second card
    /// (dual-card mode only).
    pub fn write_new_key(
        &mut self,
        dual_cards: bool,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(KeySegment, KeySegment), SessionError> {
        self.require_unlocked()?;
        let segment_a = KeySegment::generate();
        let segment_b = KeySegment::generate();
        self.client
            .write_key_segments(&segment_a, &segment_b, dual_cards, confirm_swap)?;
        info!(dual_cards, "new identity key written");
        Ok((segment_a, segment_b))
    }

    /// Write specific segments (used by backup import)
    pub fn write_key(
        &mut self,
        segment_a: &KeySegment,
        segment_b: &KeySegment,
        dual_cards: bool,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(), SessionError> {
        self.require_unlocked()?;
        self.client
            .write_key_segments(segment_a, segment_b, dual_cards, confirm_swap)?;
        Ok(())
    }

    /// Recover the identity key from the presented card(s)
    ///
    /// Returns the segments and whether they came from a dual-card pair.
    pub fn recover_key(
        &mut self,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(KeySegment, KeySegment, bool), SessionError> {
        self.require_unlocked()?;
        Ok(self.client.recover_key_segments(confirm_swap)?)
    }

    /// Recover the key and write it to an encrypted backup file
    pub fn export_backup(
        &mut self,
        path: &Path,
        backup_password: &str,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(), SessionError> {
        let (segment_a, segment_b, _) = self.recover_key(confirm_swap)?;
        backup::export_to_file(path, &segment_a, &segment_b, backup_password)?;
        info!(path = %path.display(), "backup written");
        Ok(())
    }

    /// Restore the key from an encrypted backup file onto card(s)/EEPROM
    pub fn import_backup(
        &mut self,
        path: &Path,
        backup_password: &str,
        dual_cards: bool,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(), SessionError> {
        let (segment_a, segment_b) = backup::import_from_file(path, backup_password)?;
        self.write_key(&segment_a, &segment_b, dual_cards, confirm_swap)?;
        info!(path = %path.display(), "backup restored to device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryChannel;

    fn idle_session() -> KeySession {
        let (host, _device) = MemoryChannel::duplex();
        KeySession::with_client(DeviceClient::new(Box::new(host)))
    }

    #[test]
    fn test_overlong_password_rejected_before_any_io() {
        let mut session = idle_session();
        let overlong = "x".repeat(33);
        assert!(matches!(
            session.unlock(&overlong),
            Err(SessionError::PasswordTooLong)
        ));
        assert!(matches!(
            session.set_admin_password(&overlong),
            Err(SessionError::PasswordTooLong)
        ));
    }

    #[test]
    fn test_session_starts_locked() {
        let session = idle_session();
        assert!(!session.is_unlocked());
    }
}
