//! Firmware command dispatcher
//!
//! Single-threaded loop mirroring the reader firmware: read one command
//! byte, run its handler to completion, settle, repeat. Unknown bytes are
//! skipped. Storage failures are reported as status lines and drop the
//! device back to the idle loop; only transport failures end the loop.

use std::io::{self, ErrorKind};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::card::{
    decode_record, encode_record, first_block, FlagByte, DEFAULT_AUTH_KEY, KEY_SECTOR, RECORD_LEN,
};
use crate::keys::SEGMENT_LEN;
use crate::protocol::commands::{tags, Command};
use crate::protocol::stream::Channel;

use super::allocator::{SegmentAllocator, HIGHEST_SEGMENT_ADDRESS, SEGMENT_SIZE};
use super::{obfuscation, CardReader, Nvm, StorageError};

/// Pause after each operation while the console settles
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Silence window that ends a payload read once at least one byte arrived
const PAYLOAD_SILENCE: Duration = Duration::from_millis(100);

/// EEPROM bytes reserved for the admin password, ahead of the segment slots
const PASSWORD_LEN: u16 = 32;

/// The reader device's command loop over pluggable hardware seams
pub struct Dispatcher<R, M, C> {
    reader: R,
    eeprom: M,
    channel: C,
}

impl<R: CardReader, M: Nvm, C: Channel> Dispatcher<R, M, C> {
    pub fn new(reader: R, eeprom: M, channel: C) -> Self {
        Self {
            reader,
            eeprom,
            channel,
        }
    }

    /// Serve commands until the channel reaches end of stream
    pub fn run(&mut self) -> io::Result<()> {
        info!("dispatcher ready");
        loop {
            let byte = match self.await_any_byte() {
                Ok(byte) => byte,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(command) = Command::decode(byte) else {
                debug!(byte, "skipping unknown byte");
                continue;
            };
            match self.handle(command) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one command to completion
    pub fn handle(&mut self, command: Command) -> io::Result<()> {
        debug!(?command, "dispatching");
        match command {
            Command::Continue => self.handle_continue(),
            Command::QueryPasswordProtected => self.handle_query_password(),
            Command::CreateAdminPassword => self.handle_create_password(),
            Command::VerifyAdminPassword => self.handle_verify_password(),
            Command::RecoverSegments => self.handle_recover(),
            Command::WriteSegments => self.handle_write(),
        }
    }

    // The continue handler must not drain afterwards: the host sends the
    // operation code right behind the card confirmation.
    fn handle_continue(&mut self) -> io::Result<()> {
        match self.reader.wait_for_card() {
            Ok(()) => self.status(tags::FOUND_CARD),
            Err(e) => self.report(&e),
        }
    }

    fn handle_query_password(&mut self) -> io::Result<()> {
        let protected = (0..PASSWORD_LEN).any(|addr| self.eeprom.read(addr) != 0);
        self.status(&format!("{}{}", tags::PASSWORD_PROTECTED, protected))?;
        self.settle()
    }

    fn handle_create_password(&mut self) -> io::Result<()> {
        let payload = self.read_payload(SEGMENT_LEN)?;
        let created = payload.len() == SEGMENT_LEN;
        if created {
            for (i, &b) in payload.iter().enumerate() {
                self.eeprom.update(i as u16, b);
            }
        } else {
            // A short payload must not leave a half-written password behind
            warn!(got = payload.len(), "short password payload, clearing");
            for addr in 0..PASSWORD_LEN {
                self.eeprom.update(addr, 0);
            }
        }
        self.status(&format!("{}{}", tags::PASSWORD_CREATION, created))?;
        self.settle()
    }

    fn handle_verify_password(&mut self) -> io::Result<()> {
        let payload = self.read_payload(SEGMENT_LEN)?;
        let correct = payload.len() == SEGMENT_LEN
            && payload
                .iter()
                .enumerate()
                .all(|(i, &b)| self.eeprom.read(i as u16) == b);
        self.status(&format!("{}{}", tags::PASSWORD_CORRECT, correct))?;
        self.settle()
    }

    fn handle_recover(&mut self) -> io::Result<()> {
        let record = match self.read_card_record() {
            Ok(record) => record,
            Err(e) => {
                self.report(&e)?;
                return self.settle();
            }
        };
        let (payload, flag) = decode_record(&record);

        let mut combined = [0u8; 2 * SEGMENT_LEN];
        if flag.is_dual_cards() {
            self.status(&format!("{}true", tags::DUAL_CARDS))?;
            // Whichever card came first, the other one is read after the
            // host confirms the swap, so presentation order does not matter.
            let (have, want): (usize, usize) = if flag.holds_segment_b() {
                (SEGMENT_LEN, 0)
            } else {
                (0, SEGMENT_LEN)
            };
            combined[have..have + SEGMENT_LEN].copy_from_slice(&payload);

            self.await_any_byte()?;
            self.channel.clear_input()?;
            let second = match self.read_swapped_record() {
                Ok(record) => record,
                Err(e) => {
                    self.report(&e)?;
                    return self.settle();
                }
            };
            let (second_payload, _) = decode_record(&second);
            combined[want..want + SEGMENT_LEN].copy_from_slice(&second_payload);
        } else {
            // The flag byte comes off an unauthenticated card, so the slot
            // index must be validated before it addresses the EEPROM.
            let slot = flag.slot_index();
            let limit = (HIGHEST_SEGMENT_ADDRESS.min(self.eeprom.len()) / SEGMENT_SIZE) as u8;
            if slot == 0 || slot >= limit {
                self.report(&StorageError::InvalidSlot(slot))?;
                return self.settle();
            }
            self.status(&format!("{}false", tags::DUAL_CARDS))?;
            self.await_any_byte()?;
            self.channel.clear_input()?;
            combined[..SEGMENT_LEN].copy_from_slice(&payload);
            let stored = SegmentAllocator::new(&mut self.eeprom).read(slot);
            combined[SEGMENT_LEN..].copy_from_slice(&stored);
        }

        obfuscation::deobfuscate(&mut combined);
        self.channel.write_all(tags::KEY_SEGMENTS.as_bytes())?;
        self.channel.write_all(&combined)?;
        self.channel.write_all(b"\r\n")?;
        self.settle()
    }

    fn handle_write(&mut self) -> io::Result<()> {
        let mut payload = self.read_payload(1 + 2 * SEGMENT_LEN)?;
        if payload.len() != 1 + 2 * SEGMENT_LEN {
            warn!(got = payload.len(), "short segment payload, aborting write");
            return self.settle();
        }
        let dual_cards = payload[0] == b'1';
        obfuscation::obfuscate(&mut payload[1..]);
        let mut segment_a = [0u8; SEGMENT_LEN];
        let mut segment_b = [0u8; SEGMENT_LEN];
        segment_a.copy_from_slice(&payload[1..1 + SEGMENT_LEN]);
        segment_b.copy_from_slice(&payload[1 + SEGMENT_LEN..]);

        // Segment B's slot is chosen before the first card is written
        // because the card record embeds the slot index.
        let (flag_a, slot) = if dual_cards {
            (FlagByte::dual_primary(), None)
        } else {
            match SegmentAllocator::new(&mut self.eeprom).allocate(&segment_b) {
                Ok(slot) => (FlagByte::single(slot), Some(slot)),
                Err(e) => {
                    self.report(&e)?;
                    return self.settle();
                }
            }
        };

        if let Err(e) = self.write_card_record(&encode_record(&segment_a, flag_a)) {
            self.report(&e)?;
            return self.settle();
        }
        self.status(tags::FIRST_CARD_WRITTEN)?;

        if dual_cards {
            self.await_any_byte()?;
            self.channel.clear_input()?;
            let record = encode_record(&segment_b, FlagByte::dual_secondary());
            if let Err(e) = self.write_swapped_record(&record) {
                self.report(&e)?;
                return self.settle();
            }
            self.status(tags::SECOND_CARD_WRITTEN)?;
        } else {
            let slot = slot.unwrap_or_default();
            if let Err(e) = SegmentAllocator::new(&mut self.eeprom).write(slot, &segment_b) {
                self.report(&e)?;
                return self.settle();
            }
            self.status(tags::EEPROM_WRITTEN)?;
        }
        self.settle()
    }

    /// Authenticate the key sector and read its three data blocks
    fn read_card_record(&mut self) -> Result<[u8; RECORD_LEN], StorageError> {
        let base = first_block(KEY_SECTOR);
        self.reader.authenticate(base, &DEFAULT_AUTH_KEY)?;
        let mut record = [0u8; RECORD_LEN];
        for i in 0..3u8 {
            let block = self.reader.read_block(base + i)?;
            record[i as usize * 16..(i as usize + 1) * 16].copy_from_slice(&block);
        }
        Ok(record)
    }

    fn write_card_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StorageError> {
        let base = first_block(KEY_SECTOR);
        self.reader.authenticate(base, &DEFAULT_AUTH_KEY)?;
        for i in 0..3u8 {
            let mut block = [0u8; 16];
            block.copy_from_slice(&record[i as usize * 16..(i as usize + 1) * 16]);
            self.reader.write_block(base + i, &block)?;
        }
        Ok(())
    }

    fn read_swapped_record(&mut self) -> Result<[u8; RECORD_LEN], StorageError> {
        self.reader.wait_for_card()?;
        self.read_card_record()
    }

    fn write_swapped_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), StorageError> {
        self.reader.wait_for_card()?;
        self.write_card_record(record)
    }

    /// Block until one byte arrives; end of stream becomes `UnexpectedEof`
    fn await_any_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        loop {
            match self.channel.read(&mut byte) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(_) => return Ok(byte[0]),
                Err(e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read up to `max` payload bytes: wait for the first byte, then keep
    /// reading until the count is reached or the stream goes quiet
    fn read_payload(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(max);
        let mut byte = [0u8; 1];
        let mut last_byte = Instant::now();
        loop {
            match self.channel.read(&mut byte) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    out.push(byte[0]);
                    last_byte = Instant::now();
                    if out.len() == max {
                        return Ok(out);
                    }
                }
                Err(e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock =>
                {
                    if !out.is_empty() && last_byte.elapsed() >= PAYLOAD_SILENCE {
                        return Ok(out);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Emit one carriage-return-terminated status line
    fn status(&mut self, line: &str) -> io::Result<()> {
        debug!(line, "status");
        self.channel.write_all(line.as_bytes())?;
        self.channel.write_all(b"\r\n")?;
        self.channel.flush()
    }

    fn report(&mut self, err: &StorageError) -> io::Result<()> {
        warn!(%err, "storage failure");
        self.status(&err.to_string())
    }

    /// End-of-operation drain and pause. The drain comes first so a command
    /// arriving during the pause survives into the next loop turn.
    fn settle(&mut self) -> io::Result<()> {
        self.channel.flush()?;
        self.channel.clear_input()?;
        std::thread::sleep(SETTLE_DELAY);
        Ok(())
    }
}
