//! Reader-device serial protocol
//!
//! Implements the host side of the single-byte command protocol spoken by
//! the reader firmware: one command code per session turn, fixed-size
//! payloads, and carriage-return-terminated ASCII status lines scanned as
//! substrings out of an accumulating reply buffer.

pub mod client;
pub mod commands;
mod error;
pub mod serial;
pub mod stream;

pub use client::DeviceClient;
pub use commands::{tags, Command};
pub use error::ProtocolError;
pub use serial::{clear_buffers, discover_device, list_ports, open_port, PortInfo};
pub use stream::{Channel, MemoryChannel, SerialChannel};

use std::time::Duration;

/// Fixed baud rate of the reader device
pub const BAUD_RATE: u32 = 9600;

/// Deadline for an expected status line after a command
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Internal per-read timeout; the client polls in a loop bounded by
/// [`REPLY_TIMEOUT`]
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Delay between a command code and its payload, giving the firmware time
/// to switch into the matching handler
pub const PAYLOAD_SETTLE_DELAY: Duration = Duration::from_millis(60);

/// Minimum pause between the end of one operation and the next command
/// code. The firmware drains its console while settling after each
/// operation; a code sent during that window is silently discarded.
pub const INTER_COMMAND_DELAY: Duration = Duration::from_millis(250);
