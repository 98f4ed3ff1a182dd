use std::fmt;
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 16;
pub const GCM_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
pub const GCM_OVERHEAD: usize = GCM_NONCE_SIZE + GCM_TAG_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    EmptyPayload,
    KeyLength,
    BlockAlignment,
    Padding,
    Cipher,
    TooShort,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::EmptyPayload => write!(f, "empty payload"),
            CryptoError::KeyLength => write!(f, "wrong key length"),
            CryptoError::BlockAlignment => write!(f, "input is not full blocks"),
            CryptoError::Padding => write!(f, "padding error"),
            CryptoError::Cipher => write!(f, "cipher error"),
            CryptoError::TooShort => write!(f, "ciphertext too short"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Supported payload encryption methods.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    None,
    Aes256Ecb,
    Aes256Gcm,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Method> {
        match name {
            "none" => Some(Method::None),
            "aes-256-ecb" => Some(Method::Aes256Ecb),
            "aes-256-gcm" => Some(Method::Aes256Gcm),
            _ => None,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Aes256Ecb => "aes-256-ecb",
            Method::Aes256Gcm => "aes-256-gcm",
        }
    }

    #[inline]
    pub fn key_size(&self) -> usize {
        match self {
            Method::None => 0,
            Method::Aes256Ecb | Method::Aes256Gcm => KEY_SIZE,
        }
    }
}

/// A symmetric payload cipher. The ciphertext length is a pure function of
/// the plaintext length so frame sizes can be accounted for up front.
pub trait Encryptor: Send + Sync {
    /// Encrypts the plain text. Fails on an empty input for the AES variants.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Decrypts the cipher text produced by `encrypt`.
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Length of the ciphertext for a plaintext of `plain_len` bytes.
    fn cipher_len(&self, plain_len: usize) -> usize;
    /// The raw key material.
    fn key(&self) -> &[u8];
}

/// Creates an encryptor for the given method. The key must match
/// `method.key_size()`.
pub fn create(method: Method, key: &[u8]) -> Result<Arc<dyn Encryptor>, CryptoError> {
    match method {
        Method::None => Ok(Arc::new(Identity { key: key.to_vec() })),
        Method::Aes256Ecb => Ok(Arc::new(AesEcb::new(key)?)),
        Method::Aes256Gcm => Ok(Arc::new(AesGcm::new(key)?)),
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

/// Generates a fresh random key.
#[inline]
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    random_bytes(&mut key);
    key
}

struct Identity {
    key: Vec<u8>,
}

impl Encryptor for Identity {
    #[inline]
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plain.to_vec())
    }

    #[inline]
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(cipher.to_vec())
    }

    #[inline]
    fn cipher_len(&self, plain_len: usize) -> usize {
        plain_len
    }

    #[inline]
    fn key(&self) -> &[u8] {
        &self.key
    }
}

/// AES-256 in ECB mode with PKCS#5 padding. The mode is iterated by hand over
/// the block cipher; the deterministic `cipher_len` is what the framing layer
/// relies on.
struct AesEcb {
    key: Vec<u8>,
    cipher: Aes256,
}

impl AesEcb {
    fn new(key: &[u8]) -> Result<AesEcb, CryptoError> {
        let cipher = Aes256::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
        Ok(AesEcb {
            key: key.to_vec(),
            cipher,
        })
    }
}

impl Encryptor for AesEcb {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plain.is_empty() {
            return Err(CryptoError::EmptyPayload);
        }

        let mut data = pkcs5_pad(plain, BLOCK_SIZE);
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }

        Ok(data)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.is_empty() || cipher.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::BlockAlignment);
        }

        let mut data = cipher.to_vec();
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }

        pkcs5_unpad(data)
    }

    #[inline]
    fn cipher_len(&self, plain_len: usize) -> usize {
        plain_len + BLOCK_SIZE - plain_len % BLOCK_SIZE
    }

    #[inline]
    fn key(&self) -> &[u8] {
        &self.key
    }
}

/// AES-256-GCM with a random 12-byte nonce prepended to the ciphertext and
/// the 16-byte tag appended by the AEAD. Nonces come from the process CSPRNG;
/// keys are per-session-ephemeral so the nonce space is never exhausted.
struct AesGcm {
    key: Vec<u8>,
    gcm: Aes256Gcm,
}

impl AesGcm {
    fn new(key: &[u8]) -> Result<AesGcm, CryptoError> {
        let gcm = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
        Ok(AesGcm {
            key: key.to_vec(),
            gcm,
        })
    }
}

impl Encryptor for AesGcm {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plain.is_empty() {
            return Err(CryptoError::EmptyPayload);
        }

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        random_bytes(&mut nonce);

        let cipher = self
            .gcm
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptoError::Cipher)?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + cipher.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&cipher);

        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.len() < GCM_OVERHEAD {
            return Err(CryptoError::TooShort);
        }

        let (nonce, data) = cipher.split_at(GCM_NONCE_SIZE);

        self.gcm
            .decrypt(Nonce::from_slice(nonce), data)
            .map_err(|_| CryptoError::Cipher)
    }

    #[inline]
    fn cipher_len(&self, plain_len: usize) -> usize {
        plain_len + GCM_OVERHEAD
    }

    #[inline]
    fn key(&self) -> &[u8] {
        &self.key
    }
}

fn pkcs5_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padding = block_size - data.len() % block_size;
    let mut out = Vec::with_capacity(data.len() + padding);
    out.extend_from_slice(data);
    out.resize(data.len() + padding, padding as u8);
    out
}

fn pkcs5_unpad(mut data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let padding = *data.last().ok_or(CryptoError::Padding)? as usize;
    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return Err(CryptoError::Padding);
    }
    data.truncate(data.len() - padding);
    Ok(data)
}
