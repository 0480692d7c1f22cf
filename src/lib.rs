//! Local-network client for Tuya-protocol smart devices.
//!
//! Talks to a device directly over TCP (port 6668) without the vendor cloud:
//! frames requests, encrypts and signs control payloads, and retries
//! transient network failures with backoff.
//!
//! ```no_run
//! use tuya_local::{ClientConfig, DeviceClient, DeviceIdentity, QueryOptions};
//!
//! # async fn run() -> tuya_local::Result<()> {
//! let identity = DeviceIdentity::new("bf0123456789abcdef", "0123456789abcdef", Some("192.168.1.20"));
//! let client = DeviceClient::new(identity, ClientConfig::default())?;
//! let power = client.query(&QueryOptions::default()).await?;
//! println!("power: {power}");
//! client.off().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod tuya;

pub use config::ClientConfig;
pub use error::{CipherError, FrameError, Result, TuyaError};
pub use transport::{RetryPolicy, RetryingTransport};
pub use tuya::client::DeviceClient;
pub use tuya::{DeviceIdentity, PropertyMap, QueryOptions, SetRequest};
