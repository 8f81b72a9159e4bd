//! Bitcoin key derivation and address encoding

use bitcoin::hashes::{sha256d, Hash};
pub use bitcoin::Network;
use secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1};

use crate::error::{Error, Result};
use super::derivation::{derive_secret_key, Chain, KeyPair, PrivateKey, PublicKey};

/// Derive a Bitcoin key pair from a seed and derivation path
pub fn derive_bitcoin_key_pair(seed: &[u8], path: &str) -> Result<KeyPair> {
    let secret_key = derive_secret_key(seed, path)?;

    let secp = Secp256k1::new();
    let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);

    let private_key = PrivateKey::new(secret_key.secret_bytes().to_vec(), Chain::Bitcoin);
    let public_key = PublicKey::new(public_key.serialize().to_vec(), Chain::Bitcoin);

    KeyPair::new(private_key, public_key)
}

/// Encode a compressed public key as a native segwit (P2WPKH) address.
pub fn public_key_to_address(public_key: &PublicKey, network: Network) -> Result<String> {
    if public_key.chain() != Chain::Bitcoin {
        return Err(Error::KeyDerivation("Not a Bitcoin public key".to_string()));
    }

    let key = bitcoin::PublicKey::from_slice(public_key.as_bytes())
        .map_err(|e| Error::KeyDerivation(format!("Invalid Bitcoin public key: {}", e)))?;

    let address = bitcoin::Address::p2wpkh(&key, network)
        .map_err(|e| Error::KeyDerivation(format!("Key not usable for segwit: {}", e)))?;

    Ok(address.to_string())
}

/// Encode a private key in wallet import format (compressed).
pub fn private_key_to_wif(private_key: &PrivateKey, network: Network) -> Result<String> {
    if private_key.chain() != Chain::Bitcoin {
        return Err(Error::KeyDerivation("Not a Bitcoin private key".to_string()));
    }
    if private_key.as_bytes().len() != 32 {
        return Err(Error::KeyDerivation("Invalid Bitcoin private key length".to_string()));
    }

    let mut payload = Vec::with_capacity(38);
    payload.push(match network {
        Network::Bitcoin => 0x80, // Mainnet
        _ => 0xef, // Testnet
    });
    payload.extend_from_slice(private_key.as_bytes());
    payload.push(0x01); // compressed public key flag

    // Add checksum
    let checksum = sha256d::Hash::hash(&payload).to_byte_array();
    payload.extend_from_slice(&checksum[0..4]);

    Ok(bs58::encode(payload).into_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mnemonic::mnemonic_to_seed;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_bip84_first_receive_key() {
        let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();
        let key_pair = derive_bitcoin_key_pair(&seed, "m/84'/0'/0'/0/0").unwrap();

        assert_eq!(
            hex::encode(key_pair.public_key().as_bytes()),
            "0330d54fd0dd420a6e5f8d3624f5f3482cae350f79d5f0753bf5beef9c2d91af3c"
        );

        let address = public_key_to_address(key_pair.public_key(), Network::Bitcoin).unwrap();
        assert_eq!(address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    #[test]
    fn test_bip84_first_receive_wif() {
        let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();
        let key_pair = derive_bitcoin_key_pair(&seed, "m/84'/0'/0'/0/0").unwrap();

        let wif = private_key_to_wif(key_pair.private_key(), Network::Bitcoin).unwrap();
        assert_eq!(wif, "KyZpNDKnfs94vbrwhJneDi77V6jF64PWPF8x5cdJb8ifgg2DUc9d");
    }

    #[test]
    fn test_address_rejects_wrong_chain_key() {
        let key = PublicKey::new(vec![2u8; 33], Chain::Ethereum);
        assert!(public_key_to_address(&key, Network::Bitcoin).is_err());
    }
}
