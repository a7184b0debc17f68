//! AES-256-GCM block encryption and Argon2id key derivation.
//!
//! Key derivation: Argon2id(password, salt = session UUID bytes) → 32-byte key
//! Encryption:     AES-256-GCM with an explicit 12-byte nonce per block
//!
//! Nonce = 4-byte session prefix ‖ 8-byte big-endian block counter.  The salt
//! is a fresh UUIDv4 per write session, so a (key, nonce) pair is never reused.
//!
//! Everything a reader needs besides the password lives in the block's
//! encryption-method string:
//!
//! ```text
//! aes-256/gcm:n<iterations>:m<memory KiB>:s<salt hex>:i<nonce hex>
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Largest Argon2 pass count accepted from a method string.
pub const MAX_KDF_ITERATIONS: u32 = 64;
/// Largest Argon2 memory cost accepted from a method string (4 GiB).
pub const MAX_KDF_MEMORY_KIB: u32 = 4 * 1024 * 1024;

const METHOD_PREFIX: &str = "aes-256/gcm";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed for block at offset {offset}")]
    DecryptionFailed { offset: u64 },
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("block at offset {offset} is encrypted but no password was provided")]
    MissingKey { offset: u64 },
    #[error("unrecognised encryption method '{0}'")]
    BadMethod(String),
    #[error("block at offset {offset} records unusable key derivation parameters: {reason}")]
    UnusableKdf { offset: u64, reason: String },
    #[error("block at offset {offset} needs {required} bytes for key derivation, {available} bytes available")]
    KdfMemory { offset: u64, required: u64, available: u64 },
}

/// Argon2id cost parameters, recorded per block so readers can re-derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KdfParams {
    pub iterations: u32,
    pub memory_kib: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: 3, memory_kib: 64 * 1024 }
    }
}

/// 256-bit key, wiped when dropped.
pub type Key = Zeroizing<[u8; KEY_LEN]>;

/// Derive a 256-bit encryption key from a password and a salt using Argon2id.
pub fn derive_key(password: &str, salt: &[u8], kdf: KdfParams) -> Result<Key, CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, 1, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt one block payload.  Returns `ciphertext || GCM tag (16 B)`.
pub fn encrypt_block(
    key:       &[u8; KEY_LEN],
    nonce:     &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt and authenticate one block payload produced by [`encrypt_block`].
///
/// A wrong key and a modified ciphertext are indistinguishable here; both
/// surface as [`CryptoError::DecryptionFailed`] for `offset`.
pub fn decrypt_block(
    key:        &[u8; KEY_LEN],
    nonce:      &[u8; NONCE_LEN],
    ciphertext: &[u8],
    offset:     u64,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed { offset });
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::DecryptionFailed { offset })?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed { offset })
}

// ── Method string ────────────────────────────────────────────────────────────

/// Parsed form of a block's encryption-method string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMethod {
    pub kdf:   KdfParams,
    pub salt:  [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl EncryptionMethod {
    pub fn to_method_string(&self) -> String {
        format!(
            "{METHOD_PREFIX}:n{}:m{}:s{}:i{}",
            self.kdf.iterations,
            self.kdf.memory_kib,
            hex::encode(self.salt),
            hex::encode(self.nonce),
        )
    }

    /// Parse a method string.  Fields after the cipher name may come in any order.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let bad = || CryptoError::BadMethod(s.to_string());
        let mut parts = s.split(':');
        if parts.next() != Some(METHOD_PREFIX) {
            return Err(bad());
        }

        let mut iterations = None;
        let mut memory_kib = None;
        let mut salt = None;
        let mut nonce = None;
        for part in parts {
            let mut chars = part.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('n') => iterations = Some(value.parse::<u32>().map_err(|_| bad())?),
                Some('m') => memory_kib = Some(value.parse::<u32>().map_err(|_| bad())?),
                Some('s') => {
                    let mut buf = [0u8; SALT_LEN];
                    hex::decode_to_slice(value, &mut buf).map_err(|_| bad())?;
                    salt = Some(buf);
                }
                Some('i') => {
                    let mut buf = [0u8; NONCE_LEN];
                    hex::decode_to_slice(value, &mut buf).map_err(|_| bad())?;
                    nonce = Some(buf);
                }
                _ => return Err(bad()),
            }
        }

        let kdf = KdfParams {
            iterations: iterations.ok_or_else(bad)?,
            memory_kib: memory_kib.ok_or_else(bad)?,
        };
        if kdf.iterations == 0 || kdf.iterations > MAX_KDF_ITERATIONS || kdf.memory_kib > MAX_KDF_MEMORY_KIB {
            return Err(bad());
        }
        Ok(Self {
            kdf,
            salt:  salt.ok_or_else(bad)?,
            nonce: nonce.ok_or_else(bad)?,
        })
    }
}

// ── Session context ──────────────────────────────────────────────────────────

/// Write-side encryption state for one session.
///
/// Holds the derived key.  The block counter half of each nonce is the
/// block's sequence number within the session, so workers can seal blocks in
/// any order through a shared reference.
pub struct EncryptionContext {
    key:          Key,
    salt:         [u8; SALT_LEN],
    kdf:          KdfParams,
    nonce_prefix: [u8; 4],
}

impl EncryptionContext {
    /// Derive the session key.  Runs Argon2id once, on the calling thread.
    pub fn new(password: &str, kdf: KdfParams) -> Result<Self, CryptoError> {
        let session = uuid::Uuid::new_v4();
        let salt = *session.as_bytes();
        let key = derive_key(password, &salt, kdf)?;
        let prefix_src = uuid::Uuid::new_v4();
        let mut nonce_prefix = [0u8; 4];
        nonce_prefix.copy_from_slice(&prefix_src.as_bytes()[..4]);
        log::debug!("encryption session {session} (kdf n={} m={}KiB)", kdf.iterations, kdf.memory_kib);
        Ok(Self { key, salt, kdf, nonce_prefix })
    }

    /// Nonce for block `counter` of this session.
    pub fn nonce_for(&self, counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypt block `counter`.  Returns the payload and the method string to
    /// store in the block descriptor.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<(Vec<u8>, String), CryptoError> {
        let nonce = self.nonce_for(counter);
        let payload = encrypt_block(&self.key, &nonce, plaintext)?;
        let method = EncryptionMethod { kdf: self.kdf, salt: self.salt, nonce };
        Ok((payload, method.to_method_string()))
    }
}

impl Drop for EncryptionContext {
    fn drop(&mut self) {
        self.nonce_prefix.zeroize();
        self.salt.zeroize();
    }
}

// ── Read-side key cache ──────────────────────────────────────────────────────

/// Lazily derived keys, one per (salt, kdf) seen while reading.
///
/// Appended archives may carry several sessions, each with its own salt.
/// KDF costs come from the archive, so each is checked against a memory
/// budget before Argon2 allocates anything.
pub struct KeyCache {
    password:      Option<Zeroizing<String>>,
    keys:          std::collections::HashMap<([u8; SALT_LEN], KdfParams), Key>,
    /// `None`: the memory available when the first key is derived.
    memory_budget: Option<u64>,
}

impl KeyCache {
    pub fn new(password: Option<&str>) -> Self {
        Self {
            password:      password.map(|p| Zeroizing::new(p.to_string())),
            keys:          std::collections::HashMap::new(),
            memory_budget: None,
        }
    }

    pub fn with_budget(password: Option<&str>, memory_budget: u64) -> Self {
        Self { memory_budget: Some(memory_budget), ..Self::new(password) }
    }

    fn budget(&self) -> u64 {
        self.memory_budget.unwrap_or_else(|| match crate::dedup::memory::available_memory() {
            // Not reported on this platform.
            0 => u64::MAX,
            n => n,
        })
    }

    /// Decrypt a payload described by `method`, deriving the key on first use.
    pub fn open(&mut self, method: &str, ciphertext: &[u8], offset: u64) -> Result<Vec<u8>, CryptoError> {
        let parsed = EncryptionMethod::parse(method)?;
        let password = self.password.as_ref().ok_or(CryptoError::MissingKey { offset })?;
        let slot = (parsed.salt, parsed.kdf);
        if !self.keys.contains_key(&slot) {
            let required = u64::from(parsed.kdf.memory_kib) * 1024;
            let available = self.budget();
            if required > available {
                return Err(CryptoError::KdfMemory { offset, required, available });
            }
            log::debug!("deriving key for salt {}", hex::encode(parsed.salt));
            let key = derive_key(password.as_str(), &parsed.salt, parsed.kdf).map_err(|e| match e {
                CryptoError::KeyDerivation(reason) => CryptoError::UnusableKdf { offset, reason },
                other => other,
            })?;
            self.keys.insert(slot, key);
        }
        let key = &self.keys[&slot];
        decrypt_block(key, &parsed.nonce, ciphertext, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams { iterations: 1, memory_kib: 64 };

    #[test]
    fn test_wrong_key_fails_authentication() {
        let k1 = derive_key("right", b"0123456789abcdef", FAST).unwrap();
        let k2 = derive_key("wrong", b"0123456789abcdef", FAST).unwrap();
        let nonce = [7u8; NONCE_LEN];
        let ct = encrypt_block(&k1, &nonce, b"payload").unwrap();
        assert_eq!(ct.len(), 7 + TAG_LEN);
        assert_eq!(decrypt_block(&k1, &nonce, &ct, 0).unwrap(), b"payload");
        assert!(matches!(
            decrypt_block(&k2, &nonce, &ct, 42),
            Err(CryptoError::DecryptionFailed { offset: 42 })
        ));
    }

    #[test]
    fn test_nonces_are_unique_per_session() {
        let ctx = EncryptionContext::new("pw", FAST).unwrap();
        let a = ctx.nonce_for(0);
        let b = ctx.nonce_for(1);
        assert_ne!(a, b);
        assert_eq!(a[..4], b[..4]);
    }

    #[test]
    fn test_method_string_roundtrip() {
        let m = EncryptionMethod {
            kdf:   KdfParams { iterations: 3, memory_kib: 65536 },
            salt:  [0xab; SALT_LEN],
            nonce: [0x01; NONCE_LEN],
        };
        let s = m.to_method_string();
        assert!(s.starts_with("aes-256/gcm:n3:m65536:s"));
        assert_eq!(EncryptionMethod::parse(&s).unwrap(), m);
        assert!(EncryptionMethod::parse("aes-256/ctr:n3").is_err());
        assert!(EncryptionMethod::parse("aes-256/gcm:n3:m8").is_err());
    }

    #[test]
    fn test_key_cache_roundtrip() {
        let ctx = EncryptionContext::new("pw", FAST).unwrap();
        let (ct, method) = ctx.seal(0, b"hello").unwrap();

        let mut cache = KeyCache::new(Some("pw"));
        assert_eq!(cache.open(&method, &ct, 5).unwrap(), b"hello");

        let mut none = KeyCache::new(None);
        assert!(matches!(none.open(&method, &ct, 5), Err(CryptoError::MissingKey { offset: 5 })));
    }

    #[test]
    fn test_method_string_costs_are_capped() {
        let salt = "ab".repeat(SALT_LEN);
        let nonce = "01".repeat(NONCE_LEN);
        let ok = format!("aes-256/gcm:n64:m{MAX_KDF_MEMORY_KIB}:s{salt}:i{nonce}");
        assert!(EncryptionMethod::parse(&ok).is_ok());
        for bad in [
            format!("aes-256/gcm:n65:m64:s{salt}:i{nonce}"),
            format!("aes-256/gcm:n0:m64:s{salt}:i{nonce}"),
            format!("aes-256/gcm:n1:m67108864:s{salt}:i{nonce}"),
        ] {
            assert!(matches!(EncryptionMethod::parse(&bad), Err(CryptoError::BadMethod(_))), "{bad}");
        }
    }

    #[test]
    fn test_key_cache_refuses_kdf_over_budget() {
        let ctx = EncryptionContext::new("pw", FAST).unwrap();
        let (ct, method) = ctx.seal(0, b"hello").unwrap();

        let mut tight = KeyCache::with_budget(Some("pw"), 32 * 1024);
        assert!(matches!(
            tight.open(&method, &ct, 9),
            Err(CryptoError::KdfMemory { offset: 9, required: 65536, available: 32768 })
        ));
        let mut roomy = KeyCache::with_budget(Some("pw"), 1 << 20);
        assert_eq!(roomy.open(&method, &ct, 9).unwrap(), b"hello");
    }
}
