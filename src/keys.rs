use std::fmt;
use std::str::FromStr as _;
use std::sync::Mutex;

use bip39::{Language, Mnemonic};
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Keypair, PublicKey, Secp256k1};
use bitcoin::{Network, XOnlyPublicKey};
use rand::RngCore as _;
use rand::rngs::OsRng;

use crate::error::{Error, Result};

pub const DERIVATION_PATH_PREFIX: &str = "m/44/0/0/0";

/// Where the wallet mnemonic and the next free key index live.
pub trait KeyStore: Send + Sync {
    fn mnemonic(&self) -> Result<Option<String>>;

    fn set_mnemonic(&self, mnemonic: &str) -> Result<()>;

    /// Returns the next unused index and advances the counter.
    fn next_index(&self) -> Result<u32>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: Mutex<(Option<String>, u32)>,
}

impl MemoryKeyStore {
    pub fn with_mnemonic(mnemonic: &str) -> Self {
        Self {
            state: Mutex::new((Some(mnemonic.to_string()), 0)),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn mnemonic(&self) -> Result<Option<String>> {
        Ok(self.state.lock().expect("key store mutex poisoned").0.clone())
    }

    fn set_mnemonic(&self, mnemonic: &str) -> Result<()> {
        self.state.lock().expect("key store mutex poisoned").0 = Some(mnemonic.to_string());
        Ok(())
    }

    fn next_index(&self) -> Result<u32> {
        let mut state = self.state.lock().expect("key store mutex poisoned");
        let index = state.1;
        state.1 = index
            .checked_add(1)
            .ok_or_else(|| Error::KeyDerivation("key index space exhausted".into()))?;
        Ok(index)
    }
}

pub struct SwapKeys {
    pub mnemonic: String,
    pub index: u32,
    pub keypair: Keypair,
    pub preimage: [u8; 32],
    pub preimage_hash: [u8; 32],
}

impl fmt::Debug for SwapKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapKeys")
            .field("index", &self.index)
            .field("public_key", &self.public_key())
            .field("preimage_hash", &hex::encode(self.preimage_hash))
            .finish_non_exhaustive()
    }
}

impl SwapKeys {
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().serialize())
    }

    pub fn preimage_hex(&self) -> String {
        hex::encode(self.preimage)
    }

    pub fn preimage_hash_hex(&self) -> String {
        hex::encode(self.preimage_hash)
    }

    /// Replaces the derived preimage with one drawn from the OS RNG. The key
    /// pair stays deterministic.
    pub fn with_random_preimage(mut self) -> Self {
        let (preimage, preimage_hash) = random_preimage();
        self.preimage = preimage;
        self.preimage_hash = preimage_hash;
        self
    }
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(bytes).to_byte_array()
}

pub fn new_mnemonic() -> Result<String> {
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| Error::KeyDerivation(format!("generate mnemonic: {e}")))?;
    Ok(mnemonic.to_string())
}

pub fn random_preimage() -> ([u8; 32], [u8; 32]) {
    let mut preimage = [0u8; 32];
    OsRng.fill_bytes(&mut preimage);
    let hash = sha256(&preimage);
    (preimage, hash)
}

/// Deterministic: the same mnemonic and index always give the same key pair
/// and preimage. `preimage = sha256(secret key)`, `hash = sha256(preimage)`.
pub fn derive_keys(mnemonic: &str, index: u32) -> Result<SwapKeys> {
    let parsed = Mnemonic::parse_in(Language::English, mnemonic)
        .map_err(|e| Error::KeyDerivation(format!("parse mnemonic: {e}")))?;
    let seed = parsed.to_seed("");

    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Bitcoin, &seed)
        .map_err(|e| Error::KeyDerivation(format!("master key: {e}")))?;
    let path = DerivationPath::from_str(&format!("{DERIVATION_PATH_PREFIX}/{index}"))
        .map_err(|e| Error::KeyDerivation(format!("derivation path: {e}")))?;
    let child = master
        .derive_priv(&secp, &path)
        .map_err(|e| Error::KeyDerivation(format!("derive {path}: {e}")))?;

    let secret_bytes = child.private_key.secret_bytes();
    if secret_bytes.iter().all(|b| *b == 0) {
        return Err(Error::KeyDerivation(format!(
            "derived empty private key at index {index}"
        )));
    }

    let keypair = Keypair::from_secret_key(&secp, &child.private_key);
    let preimage = sha256(&secret_bytes);
    let preimage_hash = sha256(&preimage);

    Ok(SwapKeys {
        mnemonic: parsed.to_string(),
        index,
        keypair,
        preimage,
        preimage_hash,
    })
}

/// Resolves missing parameters from the key store: a fresh mnemonic is
/// generated and persisted on first use, a missing index takes the next one.
pub fn generate_keys(
    store: &impl KeyStore,
    mnemonic: Option<&str>,
    index: Option<u32>,
) -> Result<SwapKeys> {
    let mnemonic = match mnemonic {
        Some(m) => m.to_string(),
        None => match store.mnemonic()? {
            Some(m) => m,
            None => {
                let m = new_mnemonic()?;
                store.set_mnemonic(&m)?;
                tracing::info!("generated new swap mnemonic");
                m
            }
        },
    };
    let index = match index {
        Some(i) => i,
        None => store.next_index()?,
    };
    derive_keys(&mnemonic, index)
}

pub fn parse_hash32(hex_str: &str, what: &str) -> Result<[u8; 32]> {
    let bytes =
        hex::decode(hex_str).map_err(|e| Error::InvalidPreimage(format!("{what} hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::InvalidPreimage(format!("{what} must be 32 bytes, got {}", b.len())))
}

pub fn verify_preimage(preimage: &[u8; 32], preimage_hash: &[u8; 32]) -> Result<()> {
    if sha256(preimage) != *preimage_hash {
        return Err(Error::InvalidPreimage(
            "preimage does not hash to preimage hash".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_keys(MNEMONIC, 3).unwrap();
        let b = derive_keys(MNEMONIC, 3).unwrap();
        let c = derive_keys(MNEMONIC, 4).unwrap();
        assert_eq!(a.preimage, b.preimage);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
        assert_eq!(a.preimage_hash, sha256(&a.preimage));
        assert_eq!(a.preimage, sha256(&a.keypair.secret_bytes()));
    }

    #[test]
    fn generate_keys_persists_mnemonic_and_advances_index() {
        let store = MemoryKeyStore::default();
        let first = generate_keys(&store, None, None).unwrap();
        let second = generate_keys(&store, None, None).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(store.mnemonic().unwrap().as_deref(), Some(first.mnemonic.as_str()));

        let again = derive_keys(&first.mnemonic, 0).unwrap();
        assert_eq!(again.preimage, first.preimage);
    }

    #[test]
    fn random_preimage_keeps_keys_deterministic() {
        let derived = derive_keys(MNEMONIC, 0).unwrap();
        let random = derive_keys(MNEMONIC, 0).unwrap().with_random_preimage();
        assert_eq!(derived.public_key(), random.public_key());
        assert_ne!(derived.preimage, random.preimage);
        verify_preimage(&random.preimage, &random.preimage_hash).unwrap();
    }

    #[test]
    fn rejects_bad_mnemonic_and_hash() {
        assert!(matches!(
            derive_keys("not a mnemonic", 0),
            Err(Error::KeyDerivation(_))
        ));
        assert!(parse_hash32("abcd", "preimage hash").is_err());
        assert!(verify_preimage(&[1; 32], &[2; 32]).is_err());
    }
}
