//! Simulated reader hardware
//!
//! In-memory stand-ins for the card front end and the EEPROM, shared
//! through `Arc<Mutex<..>>` handles so a test can keep inspecting and
//! restocking the rig while a [`Dispatcher`](super::Dispatcher) owns the
//! other handle on its own thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{CardReader, Nvm, StorageError};

/// Number of 16-byte blocks on a simulated 1K card
const CARD_BLOCKS: usize = 64;

/// EEPROM capacity of the simulated MCU
const EEPROM_SIZE: usize = 1024;

/// One simulated MIFARE card
#[derive(Clone)]
pub struct SimCard {
    blocks: Vec<[u8; 16]>,
    auth_ok: bool,
}

impl SimCard {
    /// A factory-blank card that accepts the default key
    pub fn blank() -> Self {
        Self {
            blocks: vec![[0u8; 16]; CARD_BLOCKS],
            auth_ok: true,
        }
    }

    /// A card whose sector keys do not match the default key
    pub fn locked() -> Self {
        Self {
            auth_ok: false,
            ..Self::blank()
        }
    }

    /// Read a block directly, bypassing authentication
    pub fn block(&self, block: u8) -> [u8; 16] {
        self.blocks[block as usize]
    }
}

struct ReaderState {
    /// Cards waiting to be placed on the reader, front first
    queue: VecDeque<SimCard>,
    /// Card currently in the field
    current: Option<SimCard>,
    /// Cards swapped out, in removal order
    removed: Vec<SimCard>,
    authenticated: bool,
}

/// Simulated card front end; clones share one rig
#[derive(Clone)]
pub struct SimReader {
    state: Arc<Mutex<ReaderState>>,
}

impl SimReader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReaderState {
                queue: VecDeque::new(),
                current: None,
                removed: Vec::new(),
                authenticated: false,
            })),
        }
    }

    /// Queue a card for the next placement
    pub fn present(&self, card: SimCard) {
        self.state.lock().unwrap().queue.push_back(card);
    }

    /// The card currently in the field, if any
    pub fn current_card(&self) -> Option<SimCard> {
        self.state.lock().unwrap().current.clone()
    }

    /// Cards removed from the field so far, in removal order
    pub fn removed_cards(&self) -> Vec<SimCard> {
        self.state.lock().unwrap().removed.clone()
    }
}

impl Default for SimReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CardReader for SimReader {
    // A queued card models the operator placing (or swapping in) a card.
    // With nothing queued the card already in the field is detected again,
    // which is exactly what the hardware does when nobody swaps.
    fn wait_for_card(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if let Some(next) = state.queue.pop_front() {
            if let Some(old) = state.current.take() {
                state.removed.push(old);
            }
            state.current = Some(next);
        }
        state.authenticated = false;
        if state.current.is_some() {
            Ok(())
        } else {
            Err(StorageError::NoCard)
        }
    }

    fn authenticate(&mut self, block: u8, key: &[u8; 6]) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let card = state.current.as_ref().ok_or(StorageError::NoCard)?;
        if card.auth_ok && key == &crate::card::DEFAULT_AUTH_KEY {
            state.authenticated = true;
            Ok(())
        } else {
            state.authenticated = false;
            Err(StorageError::AuthenticationFailed(block / 4))
        }
    }

    fn read_block(&mut self, block: u8) -> Result<[u8; 16], StorageError> {
        let state = self.state.lock().unwrap();
        if !state.authenticated {
            return Err(StorageError::ReadFailed(block));
        }
        let card = state.current.as_ref().ok_or(StorageError::NoCard)?;
        card.blocks
            .get(block as usize)
            .copied()
            .ok_or(StorageError::ReadFailed(block))
    }

    fn write_block(&mut self, block: u8, data: &[u8; 16]) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if !state.authenticated {
            return Err(StorageError::WriteFailed(block));
        }
        let card = state.current.as_mut().ok_or(StorageError::NoCard)?;
        match card.blocks.get_mut(block as usize) {
            Some(slot) => {
                *slot = *data;
                Ok(())
            }
            None => Err(StorageError::WriteFailed(block)),
        }
    }
}

/// Simulated EEPROM; clones share one memory
#[derive(Clone)]
pub struct SimEeprom {
    cells: Arc<Mutex<Vec<u8>>>,
}

impl SimEeprom {
    pub fn new() -> Self {
        Self {
            cells: Arc::new(Mutex::new(vec![0u8; EEPROM_SIZE])),
        }
    }

    /// Snapshot the full memory contents
    pub fn dump(&self) -> Vec<u8> {
        self.cells.lock().unwrap().clone()
    }
}

impl Default for SimEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl Nvm for SimEeprom {
    fn len(&self) -> u16 {
        EEPROM_SIZE as u16
    }

    fn read(&self, addr: u16) -> u8 {
        self.cells.lock().unwrap()[addr as usize]
    }

    fn update(&mut self, addr: u16, value: u8) {
        let mut cells = self.cells.lock().unwrap();
        if cells[addr as usize] != value {
            cells[addr as usize] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::DEFAULT_AUTH_KEY;

    #[test]
    fn test_reader_requires_presented_card() {
        let mut reader = SimReader::new();
        assert_eq!(reader.wait_for_card(), Err(StorageError::NoCard));
        reader.present(SimCard::blank());
        assert_eq!(reader.wait_for_card(), Ok(()));
        // Detecting again without a swap keeps the same card
        assert_eq!(reader.wait_for_card(), Ok(()));
    }

    #[test]
    fn test_reader_swaps_to_queued_card() {
        let mut reader = SimReader::new();
        reader.present(SimCard::blank());
        reader.wait_for_card().unwrap();
        reader.authenticate(4, &DEFAULT_AUTH_KEY).unwrap();
        reader.write_block(4, &[1u8; 16]).unwrap();

        reader.present(SimCard::blank());
        reader.wait_for_card().unwrap();
        reader.authenticate(4, &DEFAULT_AUTH_KEY).unwrap();
        assert_eq!(reader.read_block(4).unwrap(), [0u8; 16]);
        assert_eq!(reader.removed_cards()[0].block(4), [1u8; 16]);
    }

    #[test]
    fn test_access_requires_authentication() {
        let mut reader = SimReader::new();
        reader.present(SimCard::blank());
        reader.wait_for_card().unwrap();
        assert_eq!(reader.read_block(4), Err(StorageError::ReadFailed(4)));

        let mut locked = SimReader::new();
        locked.present(SimCard::locked());
        locked.wait_for_card().unwrap();
        assert_eq!(
            locked.authenticate(4, &DEFAULT_AUTH_KEY),
            Err(StorageError::AuthenticationFailed(1))
        );
    }

    #[test]
    fn test_eeprom_clones_share_memory() {
        let mut a = SimEeprom::new();
        let b = a.clone();
        a.update(100, 0x42);
        assert_eq!(b.read(100), 0x42);
        assert_eq!(b.dump()[100], 0x42);
    }
}
