//! Persistent segment allocator
//!
//! Manages the EEPROM region holding segment B slots in single-card mode.
//! Addresses below [`LOWEST_SEGMENT_ADDRESS`] are reserved for the admin
//! password and are never allocated. A slot index is its byte address
//! divided by the slot size, so index 0 is the reserved password region
//! and valid segment slots start at index 1.

use tracing::{debug, warn};

use super::{Nvm, StorageError};

/// Size of one slot in bytes, equal to one key segment
pub const SEGMENT_SIZE: u16 = 32;

/// First byte address available for segment slots
pub const LOWEST_SEGMENT_ADDRESS: u16 = 32;

/// One past the last byte address available for segment slots
pub const HIGHEST_SEGMENT_ADDRESS: u16 = 992;

/// Allocator over a borrowed non-volatile memory
pub struct SegmentAllocator<'a, M: Nvm> {
    nvm: &'a mut M,
}

impl<'a, M: Nvm> SegmentAllocator<'a, M> {
    pub fn new(nvm: &'a mut M) -> Self {
        Self { nvm }
    }

    /// Find a slot for `payload` and return its index.
    ///
    /// Scans low to high. A slot already holding `payload` is returned
    /// as-is, so re-writing the same segment never consumes a second slot.
    /// Otherwise the first all-zero slot wins. Returns
    /// [`StorageError::StorageFull`] when neither exists.
    pub fn allocate(&mut self, payload: &[u8; 32]) -> Result<u8, StorageError> {
        let mut addr = LOWEST_SEGMENT_ADDRESS;
        while addr + SEGMENT_SIZE <= HIGHEST_SEGMENT_ADDRESS.min(self.nvm.len()) {
            if self.slot_matches(addr, payload) {
                debug!(slot = addr / SEGMENT_SIZE, "reusing existing segment slot");
                return Ok((addr / SEGMENT_SIZE) as u8);
            }
            if self.slot_is_free(addr) {
                debug!(slot = addr / SEGMENT_SIZE, "allocating free segment slot");
                return Ok((addr / SEGMENT_SIZE) as u8);
            }
            addr += SEGMENT_SIZE;
        }
        warn!("no free segment slot left");
        Err(StorageError::StorageFull)
    }

    /// Write `payload` into the slot and verify it by reading back.
    ///
    /// On a readback mismatch the slot is zeroed before the error returns,
    /// so a failed write leaves the slot reusable instead of holding a
    /// corrupt segment that would shadow the index forever.
    pub fn write(&mut self, slot: u8, payload: &[u8; 32]) -> Result<(), StorageError> {
        let base = slot as u16 * SEGMENT_SIZE;
        for (i, &b) in payload.iter().enumerate() {
            self.nvm.update(base + i as u16, b);
        }
        if !self.slot_matches(base, payload) {
            warn!(slot, "segment readback mismatch, zeroing slot");
            for i in 0..SEGMENT_SIZE {
                self.nvm.update(base + i, 0);
            }
            return Err(StorageError::VerifyFailed(slot));
        }
        Ok(())
    }

    /// Read the 32 bytes stored in a slot
    pub fn read(&self, slot: u8) -> [u8; 32] {
        let base = slot as u16 * SEGMENT_SIZE;
        let mut out = [0u8; 32];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.nvm.read(base + i as u16);
        }
        out
    }

    fn slot_matches(&self, base: u16, payload: &[u8; 32]) -> bool {
        payload
            .iter()
            .enumerate()
            .all(|(i, &b)| self.nvm.read(base + i as u16) == b)
    }

    fn slot_is_free(&self, base: u16) -> bool {
        (0..SEGMENT_SIZE).all(|i| self.nvm.read(base + i) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimEeprom;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_allocate_skips_password_region() {
        let mut nvm = SimEeprom::new();
        let slot = SegmentAllocator::new(&mut nvm)
            .allocate(&[1u8; 32])
            .unwrap();
        assert_eq!(slot, 1);
        assert_eq!(slot as u16 * SEGMENT_SIZE, LOWEST_SEGMENT_ADDRESS);
    }

    #[test]
    fn test_allocate_is_idempotent_for_same_payload() {
        let mut nvm = SimEeprom::new();
        let payload = [0x5Au8; 32];
        let mut alloc = SegmentAllocator::new(&mut nvm);
        let slot = alloc.allocate(&payload).unwrap();
        alloc.write(slot, &payload).unwrap();
        // A second allocation of the same content reuses the slot
        assert_eq!(alloc.allocate(&payload).unwrap(), slot);
    }

    #[test]
    fn test_allocate_advances_past_occupied_slots() {
        let mut nvm = SimEeprom::new();
        let mut alloc = SegmentAllocator::new(&mut nvm);
        let first = alloc.allocate(&[1u8; 32]).unwrap();
        alloc.write(first, &[1u8; 32]).unwrap();
        let second = alloc.allocate(&[2u8; 32]).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut nvm = SimEeprom::new();
        let mut alloc = SegmentAllocator::new(&mut nvm);
        let slots = (HIGHEST_SEGMENT_ADDRESS - LOWEST_SEGMENT_ADDRESS) / SEGMENT_SIZE;
        for n in 0..slots {
            let payload = [(n + 1) as u8; 32];
            let slot = alloc.allocate(&payload).unwrap();
            alloc.write(slot, &payload).unwrap();
        }
        assert_eq!(alloc.allocate(&[0xEEu8; 32]), Err(StorageError::StorageFull));
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut nvm = SimEeprom::new();
        let payload: [u8; 32] = core::array::from_fn(|i| i as u8 + 1);
        let mut alloc = SegmentAllocator::new(&mut nvm);
        let slot = alloc.allocate(&payload).unwrap();
        alloc.write(slot, &payload).unwrap();
        assert_eq!(alloc.read(slot), payload);
    }

    /// Nvm that drops the low bit of every written byte
    struct StuckBitNvm {
        cells: Vec<u8>,
    }

    impl Nvm for StuckBitNvm {
        fn len(&self) -> u16 {
            self.cells.len() as u16
        }

        fn read(&self, addr: u16) -> u8 {
            self.cells[addr as usize]
        }

        fn update(&mut self, addr: u16, value: u8) {
            self.cells[addr as usize] = value & 0xFE;
        }
    }

    #[test]
    fn test_write_verify_failure_zeroes_slot() {
        let mut nvm = StuckBitNvm {
            cells: vec![0u8; 1024],
        };
        let payload = [0x0Fu8; 32];
        let mut alloc = SegmentAllocator::new(&mut nvm);
        let slot = alloc.allocate(&payload).unwrap();
        assert_eq!(alloc.write(slot, &payload), Err(StorageError::VerifyFailed(slot)));
        // The slot must be free again for the next attempt
        assert!(alloc.read(slot).iter().all(|&b| b == 0));
        assert_eq!(alloc.allocate(&payload).unwrap(), slot);
    }
}
