//! Host protocol client
//!
//! One method per device command. Every operation writes a single command
//! byte (payloads after a short settle delay) and then scans the reply
//! stream for an expected status tag.
//!
//! Replies are not length-prefixed: the firmware prints tagged ASCII lines
//! terminated by a carriage return, and the host accumulates raw bytes into
//! a buffer until the expected tag (and its terminator, where applicable)
//! shows up. Tags split across reads are found once the later fragment
//! arrives, because the buffer persists across reads within an operation.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{
    commands::{tags, Command},
    serial, stream::Channel, ProtocolError, SerialChannel, INTER_COMMAND_DELAY,
    PAYLOAD_SETTLE_DELAY, REPLY_TIMEOUT,
};
use crate::keys::{KeySegment, SEGMENT_LEN};

/// Find the first occurrence of `needle` in `haystack`
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Host side of a reader-device session
///
/// Owns the channel and the accumulating reply buffer exclusively; there is
/// no shared session state outside this value.
pub struct DeviceClient {
    channel: Box<dyn Channel>,
    buffer: Vec<u8>,
    timeout: Duration,
    last_reply: Option<Instant>,
}

impl DeviceClient {
    /// Wrap an already-open channel
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
            timeout: REPLY_TIMEOUT,
            last_reply: None,
        }
    }

    /// Open the named serial port and wrap it
    pub fn open(port_name: &str) -> Result<Self, ProtocolError> {
        let mut port = serial::open_port(port_name)?;
        // The open toggles DTR, which resets Arduino-class boards; wait for
        // the firmware to come back up, then drop whatever arrived meanwhile.
        serial::stabilization_delay();
        serial::clear_buffers(port.as_mut())?;
        Ok(Self::new(Box::new(SerialChannel::new(port))))
    }

    /// Override the reply deadline (tests use a short one)
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a bare command code
    fn send_code(&mut self, command: Command) -> Result<(), ProtocolError> {
        debug!(code = command.code(), "sending command");
        self.channel
            .write_all(&[command.code()])
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        self.channel
            .flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(())
    }

    /// Send a fixed-size payload after the settle delay
    fn send_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        std::thread::sleep(PAYLOAD_SETTLE_DELAY);
        self.channel
            .write_all(payload)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        self.channel
            .flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(())
    }

    /// Pull any available bytes into the reply buffer
    fn fill_buffer(&mut self) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; 256];
        match self.channel.read(&mut chunk) {
            Ok(0) => {
                // EOF from the channel; the deadline loop decides when to
                // give up, so just avoid a busy spin here.
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(())
            }
            Err(e) => Err(ProtocolError::SerialError(e.to_string())),
        }
    }

    /// Wait until `extract` finds what it wants in the reply buffer
    fn await_with<T>(
        &mut self,
        expected: &str,
        mut extract: impl FnMut(&[u8]) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(value) = extract(&self.buffer) {
                self.last_reply = Some(Instant::now());
                return Ok(value);
            }
            if Instant::now() >= deadline {
                debug!(expected, "reply deadline elapsed");
                return Err(ProtocolError::Timeout(expected.to_string()));
            }
            self.fill_buffer()?;
        }
    }

    /// Wait for a tag followed by a carriage return; returns the text between
    ///
    /// The first occurrence of the tag wins if the stream somehow carries
    /// more than one.
    fn await_tag(&mut self, tag: &str) -> Result<String, ProtocolError> {
        let needle = tag.as_bytes().to_vec();
        self.await_with(tag, move |buffer| {
            let start = find_subslice(buffer, &needle)? + needle.len();
            let end = start + find_subslice(&buffer[start..], b"\r")?;
            Some(String::from_utf8_lossy(&buffer[start..end]).into_owned())
        })
    }

    /// Wait for a tag followed by exactly `len` raw bytes
    fn await_tag_bytes(&mut self, tag: &str, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let needle = tag.as_bytes().to_vec();
        self.await_with(tag, move |buffer| {
            let start = find_subslice(buffer, &needle)? + needle.len();
            if buffer.len() < start + len {
                return None;
            }
            Some(buffer[start..start + len].to_vec())
        })
    }

    /// Wait for a bare confirmation message (no `=value` part)
    fn await_message(&mut self, message: &str) -> Result<(), ProtocolError> {
        let needle = message.as_bytes().to_vec();
        self.await_with(message, move |buffer| {
            find_subslice(buffer, &needle).map(|_| ())
        })
    }

    /// Start a device operation: send the continue code and wait for the
    /// firmware to confirm a card is present on the reader
    ///
    /// A human places the card; the firmware blocks on detection, so a
    /// timeout here usually means "no card on the reader yet".
    pub fn begin_session(&mut self) -> Result<(), ProtocolError> {
        // Let the firmware finish its post-operation drain before the next
        // code goes out, or the code disappears into the drain.
        if let Some(last) = self.last_reply {
            let remaining = INTER_COMMAND_DELAY.saturating_sub(last.elapsed());
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }
        self.buffer.clear();
        self.send_code(Command::Continue)?;
        self.await_message(tags::FOUND_CARD)
    }

    /// Ask the device whether an admin password is set
    pub fn query_password_protected(&mut self) -> Result<bool, ProtocolError> {
        self.begin_session()?;
        self.send_code(Command::QueryPasswordProtected)?;
        let value = self.await_tag(tags::PASSWORD_PROTECTED)?;
        Ok(value == "true")
    }

    /// Create the admin password (exactly 32 bytes, NUL-padded by the caller)
    pub fn create_admin_password(
        &mut self,
        password: &[u8; SEGMENT_LEN],
    ) -> Result<bool, ProtocolError> {
        self.begin_session()?;
        self.send_code(Command::CreateAdminPassword)?;
        self.send_payload(password)?;
        let value = self.await_tag(tags::PASSWORD_CREATION)?;
        Ok(value == "true")
    }

    /// Verify the admin password; `Ok(true)` means verification succeeded
    ///
    /// The device line `passwordCorrect=<bool>` is the source of truth. The
    /// historical host implementation returned the inverse of this value
    /// from its `admin_password_verification` routine and compensated at
    /// every call site; this client reports the device value directly and
    /// pins that choice with tests. Use [`Self::verify_admin_password_legacy`]
    /// if a caller needs the historical polarity.
    pub fn verify_admin_password(
        &mut self,
        password: &[u8; SEGMENT_LEN],
    ) -> Result<bool, ProtocolError> {
        self.begin_session()?;
        self.send_code(Command::VerifyAdminPassword)?;
        self.send_payload(password)?;
        let value = self.await_tag(tags::PASSWORD_CORRECT)?;
        Ok(value == "true")
    }

    /// Historical polarity of [`Self::verify_admin_password`]: `false` on success
    pub fn verify_admin_password_legacy(
        &mut self,
        password: &[u8; SEGMENT_LEN],
    ) -> Result<bool, ProtocolError> {
        self.verify_admin_password(password).map(|ok| !ok)
    }

    /// Recover both key segments from the card(s)/EEPROM
    ///
    /// `confirm_swap` is invoked when the record announces dual-card mode;
    /// it must block until the operator has placed the second card. The
    /// wait on the human is the only unbounded wait in the protocol.
    pub fn recover_key_segments(
        &mut self,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(KeySegment, KeySegment, bool), ProtocolError> {
        self.begin_session()?;
        self.send_code(Command::RecoverSegments)?;
        let dual_cards = self.await_tag(tags::DUAL_CARDS)? == "true";

        if dual_cards {
            confirm_swap();
        }
        // The firmware waits for any byte before transmitting the segments
        // (in dual mode, after reading the swapped-in second card).
        self.send_code(Command::Continue)?;

        let raw = self.await_tag_bytes(tags::KEY_SEGMENTS, 2 * SEGMENT_LEN)?;
        let segment_a =
            KeySegment::from_slice(&raw[..SEGMENT_LEN]).ok_or(ProtocolError::InvalidReply)?;
        let segment_b =
            KeySegment::from_slice(&raw[SEGMENT_LEN..]).ok_or(ProtocolError::InvalidReply)?;
        Ok((segment_a, segment_b, dual_cards))
    }

    /// Write both key segments to the card(s)/EEPROM
    ///
    /// In dual-card mode `confirm_swap` blocks until the operator has
    /// replaced card 1 with card 2.
    pub fn write_key_segments(
        &mut self,
        segment_a: &KeySegment,
        segment_b: &KeySegment,
        dual_cards: bool,
        confirm_swap: &mut dyn FnMut(),
    ) -> Result<(), ProtocolError> {
        self.begin_session()?;
        self.send_code(Command::WriteSegments)?;

        let mut payload = Vec::with_capacity(1 + 2 * SEGMENT_LEN);
        payload.push(if dual_cards { b'1' } else { b'0' });
        payload.extend_from_slice(segment_a.as_bytes());
        payload.extend_from_slice(segment_b.as_bytes());
        self.send_payload(&payload)?;

        self.await_message(tags::FIRST_CARD_WRITTEN)?;

        if dual_cards {
            confirm_swap();
            self.send_code(Command::Continue)?;
            self.await_message(tags::SECOND_CARD_WRITTEN)?;
        } else {
            self.await_message(tags::EEPROM_WRITTEN)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryChannel;
    use std::io::Write;

    fn client_pair() -> (DeviceClient, MemoryChannel) {
        let (host, device) = MemoryChannel::duplex();
        let mut client = DeviceClient::new(Box::new(host));
        client.set_timeout(Duration::from_millis(300));
        (client, device)
    }

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"xy"), None);
        assert_eq!(find_subslice(b"ab", b"abc"), None);
        assert_eq!(find_subslice(b"aaab", b"ab"), Some(2));
    }

    #[test]
    fn test_await_tag_extracts_value() {
        let (mut client, mut device) = client_pair();
        device.write_all(b"noise passwordProtected=true\r\n").unwrap();
        assert_eq!(client.await_tag(tags::PASSWORD_PROTECTED).unwrap(), "true");
    }

    #[test]
    fn test_await_tag_handles_fragmented_reply() {
        // The tag split across two reads must still be found because the
        // buffer accumulates.
        let (mut client, mut device) = client_pair();
        device.write_all(b"passwordProtec").unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            device.write_all(b"ted=true\r\n").unwrap();
            // Keep the device end alive until the client has read it
            std::thread::sleep(Duration::from_millis(300));
        });
        assert_eq!(client.await_tag(tags::PASSWORD_PROTECTED).unwrap(), "true");
    }

    #[test]
    fn test_await_tag_first_occurrence_wins() {
        let (mut client, mut device) = client_pair();
        device
            .write_all(b"passwordCorrect=false\rpasswordCorrect=true\r")
            .unwrap();
        assert_eq!(client.await_tag(tags::PASSWORD_CORRECT).unwrap(), "false");
    }

    #[test]
    fn test_await_tag_times_out() {
        let (mut client, _device) = client_pair();
        client.set_timeout(Duration::from_millis(150));
        let start = Instant::now();
        let err = client.await_tag(tags::PASSWORD_PROTECTED).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_await_tag_bytes_waits_for_full_length() {
        let (mut client, mut device) = client_pair();
        device.write_all(b"Key segments: ").unwrap();
        device.write_all(&[b'A'; 40]).unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            device.write_all(&[b'B'; 24]).unwrap();
            device.write_all(b"\r\n").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });
        let raw = client.await_tag_bytes(tags::KEY_SEGMENTS, 64).unwrap();
        assert_eq!(&raw[..40], &[b'A'; 40][..]);
        assert_eq!(&raw[40..], &[b'B'; 24][..]);
    }
}
