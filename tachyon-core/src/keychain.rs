//! Per-container AES-256-GCM encryption (spec 4.5). Each container that
//! opts into encryption gets its own key and IV from a shared, append-only
//! keychain; the container stores only a random 64-bit `field_id`
//! (the spec's `identifier` slot) needed to look the key back up, never the
//! key material itself. The RNG is an injectable trait (spec section 9's
//! design note) so tests can supply deterministic keys.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use tachyon_base::{err_kind, Kind, Result};

/// Source of cryptographically-random bytes for key/IV/field-id
/// generation. `OsRngSource` is the production implementation;
/// tests supply a deterministic source so fixtures are reproducible.
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

#[derive(Default)]
pub struct OsRngSource;

impl RandomSource for OsRngSource {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

/// A deterministic source for tests: an xorshift64 stream keyed by a seed,
/// never to be used outside test fixtures.
pub struct DeterministicTestSource {
    state: Mutex<u64>,
}

impl DeterministicTestSource {
    pub fn new(seed: u64) -> Self {
        DeterministicTestSource {
            state: Mutex::new(seed | 1),
        }
    }
}

impl RandomSource for DeterministicTestSource {
    fn fill(&self, buf: &mut [u8]) {
        let mut s = self.state.lock().unwrap();
        for chunk in buf.chunks_mut(8) {
            *s ^= *s << 13;
            *s ^= *s >> 7;
            *s ^= *s << 17;
            let bytes = s.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

#[derive(Clone)]
pub struct KeychainEntry {
    pub field_id: u64,
    pub key: [u8; 32],
    /// 128-bit IV per spec 4.5; only the first 96 bits are used as the
    /// AES-GCM nonce (RustCrypto's `Aes256Gcm` fixes the nonce at 96 bits,
    /// the size NIST recommends for GCM) — see DESIGN.md.
    pub iv: [u8; 16],
}

/// Shared, append-only keychain (spec section 5's "Shared-resource
/// policy"): a spinlock-equivalent (`Mutex`) around the hash-table insert.
/// Persisted separately from the `.yon` file itself (spec scenario S5).
#[derive(Default)]
pub struct Keychain {
    entries: Mutex<HashMap<u64, KeychainEntry>>,
}

impl Keychain {
    pub fn new() -> Self {
        Keychain::default()
    }

    /// Generates a fresh key/IV under a new random `field_id`, rejecting
    /// collisions at insert time (spec 4.5).
    pub fn insert_new(&self, rng: &dyn RandomSource) -> KeychainEntry {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let mut id_bytes = [0u8; 8];
            rng.fill(&mut id_bytes);
            let field_id = u64::from_le_bytes(id_bytes);
            if field_id == 0 || entries.contains_key(&field_id) {
                continue;
            }
            let mut key = [0u8; 32];
            rng.fill(&mut key);
            let mut iv = [0u8; 16];
            rng.fill(&mut iv);
            let entry = KeychainEntry { field_id, key, iv };
            entries.insert(field_id, entry.clone());
            return entry;
        }
    }

    pub fn get(&self, field_id: u64) -> Result<KeychainEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(&field_id)
            .cloned()
            .ok_or_else(|| err_kind(Kind::KeychainMiss, "field_id not present in keychain"))
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn cipher_for(entry: &KeychainEntry) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&entry.key))
}

/// Encrypts `plaintext` (the concatenation of a container's serialized
/// header, data sub-stream, and stride sub-stream per spec 4.5) under
/// `entry`'s key. The returned bytes are ciphertext with the 16-byte GCM
/// tag appended, matching how `aes-gcm` lays out its output.
pub fn encrypt(entry: &KeychainEntry, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(entry);
    let nonce = Nonce::from_slice(&entry.iv[..12]);
    cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &entry.field_id.to_le_bytes(),
            },
        )
        .map_err(|_| err_kind(Kind::Encoder, "AES-GCM encryption failed"))
}

/// Inverse of `encrypt`; fails with `IntegrityFailure` if the GCM tag
/// doesn't verify (spec scenario S6: tampering is caught here).
pub fn decrypt(entry: &KeychainEntry, ciphertext_and_tag: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(entry);
    let nonce = Nonce::from_slice(&entry.iv[..12]);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext_and_tag,
                aad: &entry.field_id.to_le_bytes(),
            },
        )
        .map_err(|_| err_kind(Kind::IntegrityFailure, "AES-GCM tag verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keychain_roundtrip() {
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(42);
        let entry = kc.insert_new(&rng);
        let plaintext = b"some container header + data + stride bytes";
        let ct = encrypt(&entry, plaintext).unwrap();
        assert_ne!(&ct[..plaintext.len()], &plaintext[..]);
        let looked_up = kc.get(entry.field_id).unwrap();
        let pt = decrypt(&looked_up, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn test_keychain_miss_on_unknown_field_id() {
        let kc = Keychain::new();
        assert_eq!(kc.get(0xdead_beef).unwrap_err().kind(), Kind::KeychainMiss);
    }

    #[test]
    fn test_tamper_detected() {
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(7);
        let entry = kc.insert_new(&rng);
        let mut ct = encrypt(&entry, b"hello world, this is a container").unwrap();
        ct[0] ^= 0xff;
        assert_eq!(
            decrypt(&entry, &ct).unwrap_err().kind(),
            Kind::IntegrityFailure
        );
    }

    #[test]
    fn test_no_collisions_across_many_inserts() {
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(1);
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            let e = kc.insert_new(&rng);
            assert!(ids.insert(e.field_id));
        }
        assert_eq!(kc.entry_count(), 500);
    }
}
