use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::error::CipherError;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// Length of the signature carried in a control envelope.
pub const SIGNATURE_LEN: usize = 16;

/// Signature over a control payload: the middle 16 hex characters of
/// `md5("data=" + ciphertext + "||lpv=" + version + "||" + key)`.
pub fn sign(ciphertext: &[u8], version: &str, key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"data=");
    hasher.update(ciphertext);
    hasher.update(b"||lpv=");
    hasher.update(version.as_bytes());
    hasher.update(b"||");
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[8..8 + SIGNATURE_LEN].to_string()
}

/// AES-128-ECB payload cipher for one device.
///
/// Stateless after construction, so a single instance can be shared freely.
#[derive(Clone)]
pub struct CipherSuite {
    key: String,
    version: String,
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CipherSuite {
    pub fn new(key: &str, version: &str) -> Result<Self, CipherError> {
        if key.len() != BLOCK_SIZE {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        Ok(Self {
            key: key.to_string(),
            version: version.to_string(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Encrypt and base64-encode a plaintext payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let enc = Aes128EcbEnc::new(self.key.as_bytes().into());
        let raw = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        STANDARD.encode(raw).into_bytes()
    }

    /// Decrypt a base64 ciphertext, with or without the `version || signature` header.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let header = self.version.len() + SIGNATURE_LEN;
        let encoded = if data.starts_with(self.version.as_bytes()) && data.len() > header {
            &data[header..]
        } else {
            data
        };

        let raw = STANDARD.decode(encoded)?;
        if raw.is_empty() || raw.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::InvalidLength(raw.len()));
        }

        let dec = Aes128EcbDec::new(self.key.as_bytes().into());
        dec.decrypt_padded_vec_mut::<Pkcs7>(&raw)
            .map_err(|_| CipherError::InvalidPadding)
    }

    pub fn sign(&self, ciphertext: &[u8]) -> String {
        sign(ciphertext, &self.version, &self.key)
    }

    /// Build a control envelope: `version || signature || ciphertext`.
    pub fn envelope(&self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = self.encrypt(plaintext);
        let signature = self.sign(&ciphertext);

        let mut out =
            Vec::with_capacity(self.version.len() + signature.len() + ciphertext.len());
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(signature.as_bytes());
        out.extend_from_slice(&ciphertext);
        out
    }
}
