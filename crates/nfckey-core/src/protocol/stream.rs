//! Communication channel abstraction
//!
//! The protocol client and the device dispatcher both talk to a [`Channel`]
//! rather than a concrete serial port, so tests can wire the two ends
//! together through an in-memory duplex pipe.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Byte-oriented bidirectional channel (serial port or in-memory pipe)
pub trait Channel: Read + Write + Send {
    /// Number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard anything buffered on the receive side
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing [`Channel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Shared half of an in-memory duplex pipe
struct PipeBuffer {
    bytes: Mutex<VecDeque<u8>>,
    closed: Mutex<bool>,
    wakeup: Condvar,
}

impl PipeBuffer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
            wakeup: Condvar::new(),
        })
    }

    fn push(&self, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes.extend(data.iter().copied());
        self.wakeup.notify_all();
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.wakeup.notify_all();
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// One end of an in-memory duplex pipe implementing [`Channel`]
///
/// Reads behave like a serial port with a short internal timeout: an empty
/// pipe yields `ErrorKind::TimedOut` rather than blocking forever, and a
/// closed peer yields `Ok(0)` (EOF).
pub struct MemoryChannel {
    incoming: Arc<PipeBuffer>,
    outgoing: Arc<PipeBuffer>,
    read_timeout: Duration,
}

impl MemoryChannel {
    /// Create a connected pair of channel ends
    pub fn duplex() -> (MemoryChannel, MemoryChannel) {
        let a = PipeBuffer::new();
        let b = PipeBuffer::new();
        let host = MemoryChannel {
            incoming: a.clone(),
            outgoing: b.clone(),
            read_timeout: Duration::from_millis(50),
        };
        let device = MemoryChannel {
            incoming: b,
            outgoing: a,
            read_timeout: Duration::from_millis(50),
        };
        (host, device)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

impl Read for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes = self.incoming.bytes.lock().unwrap();
        if bytes.is_empty() {
            if self.incoming.is_closed() {
                return Ok(0);
            }
            let (guard, _timeout) = self
                .incoming
                .wakeup
                .wait_timeout(bytes, self.read_timeout)
                .unwrap();
            bytes = guard;
            if bytes.is_empty() {
                if self.incoming.is_closed() {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe empty"));
            }
        }
        let n = buf.len().min(bytes.len());
        for slot in buf.iter_mut().take(n) {
            *slot = bytes.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.outgoing.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
        }
        self.outgoing.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for MemoryChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.incoming.bytes.lock().unwrap().len() as u32)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.incoming.bytes.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplex_round_trip() {
        let (mut host, mut device) = MemoryChannel::duplex();
        host.write_all(b"abc").unwrap();
        let mut buf = [0u8; 3];
        device.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        device.write_all(b"xy").unwrap();
        assert_eq!(host.bytes_to_read().unwrap(), 2);
    }

    #[test]
    fn test_empty_read_times_out() {
        let (mut host, _device) = MemoryChannel::duplex();
        let mut buf = [0u8; 8];
        let err = host.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_closed_peer_reads_eof() {
        let (mut host, device) = MemoryChannel::duplex();
        drop(device);
        let mut buf = [0u8; 8];
        assert_eq!(host.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_clear_input() {
        let (mut host, mut device) = MemoryChannel::duplex();
        host.write_all(b"stale").unwrap();
        device.clear_input().unwrap();
        assert_eq!(device.bytes_to_read().unwrap(), 0);
    }
}
