//! Key vault
//!
//! Produces wallet key material and protects it at rest:
//! - Argon2id for passphrase-based key derivation
//! - ChaCha20-Poly1305 for authenticated encryption
//!
//! The vault never persists anything itself; the store owns persistence.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::keys::{bitcoin, ethereum, Chain, KeyPair, PublicKey};
use crate::crypto::mnemonic::{generate_mnemonic, mnemonic_to_seed, validate_mnemonic, MnemonicStrength};
use crate::error::{Error, Result};

/// Argon2id parameters for the master-key KDF.
const KDF_MEMORY_KIB: u32 = 65536; // 64 MB
const KDF_ITERATIONS: u32 = 3;
const KDF_LANES: u32 = 4;

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;
/// KDF salt length in bytes.
const SALT_LEN: usize = 16;

/// Freshly generated wallet material for one chain.
///
/// The mnemonic and private key are shown to the user exactly once at
/// creation time; the secret fields zeroize on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WalletMaterial {
    #[zeroize(skip)]
    pub chain: Chain,
    /// Chain-native receiving address.
    #[zeroize(skip)]
    pub address: String,
    /// Raw public key bytes (compressed for Bitcoin, uncompressed for Ethereum).
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    /// Raw private key bytes.
    pub private_key: Vec<u8>,
    /// BIP39 recovery phrase.
    pub mnemonic: String,
    /// Wallet-import-format rendering of the private key (Bitcoin only).
    pub wif: Option<String>,
}

impl WalletMaterial {
    /// The private key as a typed key for signing.
    pub fn private_key(&self) -> crate::crypto::keys::PrivateKey {
        crate::crypto::keys::PrivateKey::new(self.private_key.clone(), self.chain)
    }
}

impl std::fmt::Debug for WalletMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletMaterial")
            .field("chain", &self.chain)
            .field("address", &self.address)
            .field("private_key", &"[redacted]")
            .field("mnemonic", &"[redacted]")
            .finish()
    }
}

/// AEAD-protected secret as persisted in the wallet store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Hex-encoded ciphertext with the Poly1305 tag appended.
    pub ciphertext: String,
    /// Hex-encoded 96-bit nonce.
    pub nonce: String,
    /// Hex-encoded Argon2id salt.
    pub salt: String,
}

/// Generates per-chain key material and owns the at-rest encryption contract.
pub struct KeyVault {
    network: bitcoin::Network,
}

impl KeyVault {
    /// Create a vault targeting `network` for Bitcoin address encoding.
    pub fn new(network: bitcoin::Network) -> Self {
        Self { network }
    }

    /// Generate fresh material for `chain` from 256 bits of OS entropy.
    pub fn generate(&self, chain: Chain) -> Result<WalletMaterial> {
        let mnemonic = Zeroizing::new(generate_mnemonic(MnemonicStrength::Words24)?);
        self.from_mnemonic(chain, &mnemonic)
    }

    /// Rebuild material for `chain` from an existing mnemonic phrase.
    pub fn from_mnemonic(&self, chain: Chain, mnemonic: &str) -> Result<WalletMaterial> {
        validate_mnemonic(mnemonic)?;
        let seed = Zeroizing::new(mnemonic_to_seed(mnemonic, None)?);
        let key_pair = self.derive_at(chain, &seed, chain.derivation_path())?;
        self.material_from_key_pair(chain, mnemonic, &key_pair)
    }

    /// Derive the key pair for `chain` at an explicit derivation path.
    pub fn derive_at(&self, chain: Chain, seed: &[u8], path: &str) -> Result<KeyPair> {
        crate::crypto::keys::derive_key_pair(seed, chain, path)
    }

    /// Chain-native address for a derived public key.
    pub fn address_for(&self, public_key: &PublicKey) -> Result<String> {
        match public_key.chain() {
            Chain::Bitcoin => bitcoin::public_key_to_address(public_key, self.network),
            Chain::Ethereum => ethereum::public_key_to_address(public_key),
        }
    }

    fn material_from_key_pair(
        &self,
        chain: Chain,
        mnemonic: &str,
        key_pair: &KeyPair,
    ) -> Result<WalletMaterial> {
        let address = self.address_for(key_pair.public_key())?;
        let wif = match chain {
            Chain::Bitcoin => Some(bitcoin::private_key_to_wif(key_pair.private_key(), self.network)?),
            Chain::Ethereum => None,
        };

        Ok(WalletMaterial {
            chain,
            address,
            public_key: key_pair.public_key().as_bytes().to_vec(),
            private_key: key_pair.private_key().as_bytes().to_vec(),
            mnemonic: mnemonic.to_string(),
            wif,
        })
    }

    /// Encrypt secret bytes under a key derived from `master_key`.
    pub fn encrypt(&self, plaintext: &[u8], master_key: &str) -> Result<EncryptedSecret> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|e| Error::Entropy(format!("system RNG unavailable: {}", e)))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| Error::Entropy(format!("system RNG unavailable: {}", e)))?;

        let key = derive_cipher_key(master_key, &salt)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| Error::Encryption("Failed to create cipher".to_string()))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

        Ok(EncryptedSecret {
            ciphertext: hex::encode(ciphertext),
            nonce: hex::encode(nonce_bytes),
            salt: hex::encode(salt),
        })
    }

    /// Decrypt an [`EncryptedSecret`].
    ///
    /// Wrong key or tampered ciphertext fails with [`Error::Decryption`];
    /// the AEAD construction guarantees no partial plaintext escapes.
    pub fn decrypt(&self, secret: &EncryptedSecret, master_key: &str) -> Result<Zeroizing<Vec<u8>>> {
        let salt = hex::decode(&secret.salt)
            .map_err(|_| Error::Decryption("Malformed salt".to_string()))?;
        let nonce_bytes = hex::decode(&secret.nonce)
            .map_err(|_| Error::Decryption("Malformed nonce".to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Decryption("Malformed nonce".to_string()));
        }
        let ciphertext = hex::decode(&secret.ciphertext)
            .map_err(|_| Error::Decryption("Malformed ciphertext".to_string()))?;

        let key = derive_cipher_key(master_key, &salt)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| Error::Decryption("Failed to create cipher".to_string()))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| Error::Decryption("Authentication failed".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Check that `address` is re-derivable from `private_key` — the
    /// self-consistency invariant every wallet record must satisfy.
    pub fn verify_material(&self, chain: Chain, private_key: &[u8], address: &str) -> Result<()> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|e| Error::KeyDerivation(format!("Invalid private key: {}", e)))?;
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);

        let encoded = match chain {
            Chain::Bitcoin => PublicKey::new(public_key.serialize().to_vec(), chain),
            Chain::Ethereum => PublicKey::new(public_key.serialize_uncompressed().to_vec(), chain),
        };
        let derived = self.address_for(&encoded)?;

        if derived != address {
            return Err(Error::KeyDerivation(
                "Address on record is not derivable from the private key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive the 256-bit cipher key from the master passphrase and salt.
fn derive_cipher_key(master_key: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_LANES, Some(32))
        .map_err(|e| Error::Encryption(format!("KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(master_key.as_bytes(), salt, &mut key[..])
        .map_err(|e| Error::Encryption(format!("KDF failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::new(bitcoin::Network::Bitcoin)
    }

    #[test]
    fn test_generated_material_is_self_consistent() {
        let vault = vault();
        for chain in [Chain::Bitcoin, Chain::Ethereum] {
            let material = vault.generate(chain).unwrap();
            vault
                .verify_material(chain, &material.private_key, &material.address)
                .unwrap();
        }
    }

    #[test]
    fn test_same_mnemonic_same_material() {
        let vault = vault();
        let mnemonic = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

        let first = vault.from_mnemonic(Chain::Bitcoin, mnemonic).unwrap();
        let second = vault.from_mnemonic(Chain::Bitcoin, mnemonic).unwrap();

        assert_eq!(first.address, second.address);
        assert_eq!(first.private_key, second.private_key);
    }

    #[test]
    fn test_bitcoin_material_carries_wif() {
        let vault = vault();
        let material = vault.generate(Chain::Bitcoin).unwrap();
        let wif = material.wif.as_deref().unwrap();
        assert!(wif.starts_with('K') || wif.starts_with('L'));

        let material = vault.generate(Chain::Ethereum).unwrap();
        assert!(material.wif.is_none());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = vault();
        let secret = vault.encrypt(b"super secret key bytes", "correct horse").unwrap();
        let plaintext = vault.decrypt(&secret, "correct horse").unwrap();
        assert_eq!(plaintext.as_slice(), b"super secret key bytes");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let vault = vault();
        let secret = vault.encrypt(b"super secret key bytes", "correct horse").unwrap();
        match vault.decrypt(&secret, "battery staple") {
            Err(Error::Decryption(_)) => {}
            other => panic!("expected decryption failure, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails() {
        let vault = vault();
        let mut secret = vault.encrypt(b"super secret key bytes", "correct horse").unwrap();

        // Flip one nibble of the ciphertext.
        let mut bytes = hex::decode(&secret.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        secret.ciphertext = hex::encode(bytes);

        match vault.decrypt(&secret, "correct horse") {
            Err(Error::Decryption(_)) => {}
            other => panic!("expected decryption failure, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_encryption() {
        let vault = vault();
        let first = vault.encrypt(b"same plaintext", "same key").unwrap();
        let second = vault.encrypt(b"same plaintext", "same key").unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.ciphertext, second.ciphertext);
    }
}
