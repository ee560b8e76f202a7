//! Security Layer
//!
//! Symmetric packet encryption for the gossip wire. A [`Keyring`] holds zero
//! or more AES keys: the key at index 0 is the primary and is the only key
//! used to encrypt, while decryption tries every installed key in a
//! deterministic order (primary first, then insertion order) so a cluster can
//! rotate keys without a flag day.
//!
//! Payload layout on the wire: `nonce (12 bytes) || AES-GCM ciphertext`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{AesGcm, aead::consts::U12};
use anyhow::{Context, Result, bail};
use rand::RngCore;

type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

const NONCE_LEN: usize = 12;

/// Checks that a key selects one of AES-128, AES-192 or AES-256.
pub fn validate_key_len(key: &[u8]) -> Result<()> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => bail!("encryption key must be 16, 24 or 32 bytes, got {}", n),
    }
}

/// Ordered list of symmetric keys. Index 0 is the primary key.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: Vec<Vec<u8>>,
}

impl Keyring {
    /// Creates a keyring with a single primary key.
    pub fn new(primary: Vec<u8>) -> Result<Self> {
        validate_key_len(&primary)?;
        Ok(Self { keys: vec![primary] })
    }

    /// Creates a keyring from a primary key plus additional decrypt-only keys.
    pub fn with_keys(primary: Vec<u8>, extra: Vec<Vec<u8>>) -> Result<Self> {
        let mut ring = Self::new(primary)?;
        for key in extra {
            ring.install(key)?;
        }
        Ok(ring)
    }

    /// Installs a key for decryption. Installing an already-present key is a
    /// no-op; the primary stays where it is.
    pub fn install(&mut self, key: Vec<u8>) -> Result<()> {
        validate_key_len(&key)?;
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        Ok(())
    }

    /// Promotes an installed key to primary (index 0).
    pub fn use_key(&mut self, key: &[u8]) -> Result<()> {
        let Some(pos) = self.keys.iter().position(|k| k == key) else {
            bail!("key is not installed in the keyring");
        };
        let key = self.keys.remove(pos);
        self.keys.insert(0, key);
        Ok(())
    }

    /// Removes an installed key. The primary cannot be removed.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let Some(pos) = self.keys.iter().position(|k| k == key) else {
            bail!("key is not installed in the keyring");
        };
        if pos == 0 {
            bail!("cannot remove the primary key");
        }
        self.keys.remove(pos);
        Ok(())
    }

    pub fn primary(&self) -> Option<&[u8]> {
        self.keys.first().map(|k| k.as_slice())
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encrypts with the primary key. Fails if the ring is empty.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .primary()
            .context("cannot encrypt with an empty keyring")?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = seal(key, &nonce, plaintext)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Tries every installed key in ring order until one authenticates.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            bail!("encrypted payload too short");
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        for key in &self.keys {
            if let Ok(plaintext) = open(key, nonce, ciphertext) {
                return Ok(plaintext);
            }
        }
        bail!("no installed key authenticates this payload");
    }
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = GenericArray::from_slice(nonce);
    let sealed = match key.len() {
        16 => Aes128Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, plaintext),
        24 => Aes192Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, plaintext),
        32 => Aes256Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, plaintext),
        n => bail!("unsupported key length {}", n),
    };
    sealed.map_err(|_| anyhow::anyhow!("encryption failed"))
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let nonce = GenericArray::from_slice(nonce);
    let opened = match key.len() {
        16 => Aes128Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, ciphertext),
        24 => Aes192Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, ciphertext),
        32 => Aes256Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, ciphertext),
        n => bail!("unsupported key length {}", n),
    };
    opened.map_err(|_| anyhow::anyhow!("decryption failed"))
}
