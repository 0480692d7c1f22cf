//! Wire format and payload protection for the local device protocol.
//!
//! Devices listen on TCP port 6668. Every request is a single frame; control
//! frames carry an encrypted, signed envelope while query frames carry
//! plaintext JSON.

pub mod cipher;
pub mod frame;

pub use cipher::CipherSuite;
pub use frame::{CommandType, Message, Payload};

/// Port devices listen on for local control.
pub const DEVICE_PORT: u16 = 6668;
