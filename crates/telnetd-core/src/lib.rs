//! telnetd-core: shared protocol library for the telnet server.
//!
//! Provides the fixed-capacity duplex ring buffer, the telnet
//! control-sequence scrubber, the authenticated command dialect, and the
//! shared error type. Everything here is OS-free; descriptors, ptys and
//! the filesystem live in the server crate.

pub mod command;
pub mod error;
pub mod ring;
pub mod telnet;

// Re-export commonly used items at crate root.
pub use command::Command;
pub use error::{TelnetdError, TelnetdResult};
pub use ring::Ring;
pub use telnet::{scrub, Scrub, WindowSize, NEGOTIATION_OFFER};
