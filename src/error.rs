use std::time::Duration;

/// Errors raised while parsing a frame received from a device.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the header and trailer require, or than the length field announces.
    #[error("truncated frame ({got} bytes, need {need})")]
    Truncated { got: usize, need: usize },

    #[error("invalid frame prefix 0x{0:08x}")]
    InvalidPrefix(u32),

    #[error("invalid frame suffix 0x{0:08x}")]
    InvalidSuffix(u32),

    /// The length field is too small to cover checksum and suffix.
    #[error("invalid frame length field {0}")]
    InvalidLength(u32),

    #[error("checksum mismatch (frame carries 0x{actual:08x}, computed 0x{expected:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Errors raised by the payload cipher.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Local keys are 16 bytes (AES-128).
    #[error("device key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("ciphertext is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    InvalidLength(usize),

    #[error("invalid padding in decrypted payload")]
    InvalidPadding,
}

/// Errors surfaced by the device client and its transport.
#[derive(Debug, thiserror::Error)]
pub enum TuyaError {
    /// No IP address configured for the device. Never retried.
    #[error("device has no IP address configured")]
    MissingAddress,

    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),

    #[error("error communicating with device at {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} connecting to device at {addr}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("device at {addr} did not respond within {timeout:?}")]
    ResponseTimeout { addr: String, timeout: Duration },

    #[error("device replied with an unusable frame: {0}")]
    Frame(#[from] FrameError),

    #[error("device payload could not be decrypted: {0}")]
    Cipher(#[from] CipherError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response from device: {0}")]
    UnexpectedResponse(String),

    #[error("request cancelled")]
    Cancelled,
}

impl TuyaError {
    /// Whether the failure is transient network trouble worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TuyaError::Connection { .. }
                | TuyaError::ConnectTimeout { .. }
                | TuyaError::ResponseTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TuyaError>;
