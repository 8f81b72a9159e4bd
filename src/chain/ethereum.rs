//! Ethereum adapter
//!
//! Balance, nonce, and broadcast over JSON-RPC with ordered endpoint
//! fallback. Only plain value transfers are supported, as legacy EIP-155
//! transactions: 21000 gas, no calldata.

use std::sync::Arc;

use async_trait::async_trait;
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use serde_json::json;
use tracing::warn;

use crate::config::EthereumEndpoints;
use crate::crypto::keys::ethereum::keccak256;
use crate::crypto::keys::{self, Chain, PrivateKey, PublicKey};
use crate::error::{EndpointFailure, Error, Result};
use crate::fee::{parse_hex_quantity, FeeQuote};
use crate::net::{NetworkClient, OpClass};
use super::{ActiveKey, Balance, ChainAdapter, SendMode, TransactionRequest, UnsignedTransaction};

/// Gas limit of a plain value transfer.
const GAS_LIMIT_TRANSFER: u64 = 21_000;

/// Ethereum mainnet chain id.
const MAINNET_CHAIN_ID: u64 = 1;

/// A built-but-unsigned Ethereum transfer.
#[derive(Debug, Clone)]
pub struct UnsignedEthereumTx {
    /// Sender address, lowercase `0x` hex.
    pub from: String,
    /// Destination address, lowercase `0x` hex.
    pub to: String,
    /// Value in wei.
    pub value: u128,
    /// Account nonce, fetched fresh from the network per build.
    pub nonce: u64,
    pub gas_limit: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    pub fee_quote: FeeQuote,
}

impl UnsignedEthereumTx {
    /// Maximum fee in wei.
    pub fn fee(&self) -> u128 {
        self.gas_price.saturating_mul(u128::from(self.gas_limit))
    }
}

/// Ethereum chain adapter.
pub struct EthereumAdapter {
    endpoints: EthereumEndpoints,
    client: Arc<NetworkClient>,
    chain_id: u64,
}

impl EthereumAdapter {
    pub fn new(endpoints: EthereumEndpoints, client: Arc<NetworkClient>) -> Self {
        Self {
            endpoints,
            client,
            chain_id: MAINNET_CHAIN_ID,
        }
    }

    /// Current account nonce, never cached: a stale nonce either sticks the
    /// transaction or replays an old one.
    async fn fetch_nonce(&self, address: &str) -> Result<u64> {
        let value = self
            .client
            .rpc(
                &self.endpoints.rpc,
                "eth_getTransactionCount",
                json!([address, "latest"]),
                OpClass::Read,
            )
            .await?;
        let nonce = parse_hex_quantity(&value)
            .ok_or_else(|| Error::Network("malformed nonce response".to_string()))?;
        u64::try_from(nonce).map_err(|_| Error::Network("nonce out of range".to_string()))
    }
}

#[async_trait]
impl ChainAdapter for EthereumAdapter {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    fn derive_address(&self, public_key: &PublicKey) -> Result<String> {
        keys::ethereum::public_key_to_address(public_key)
    }

    fn validate_address(&self, address: &str) -> Result<()> {
        normalize_address(address).map(|_| ())
    }

    async fn get_balance(&self, address: &str) -> Result<Balance> {
        let value = self
            .client
            .rpc(
                &self.endpoints.rpc,
                "eth_getBalance",
                json!([address, "latest"]),
                OpClass::Read,
            )
            .await
            .map_err(|e| match e {
                Error::AllEndpointsFailed { .. } => Error::BalanceUnavailable(e.to_string()),
                other => other,
            })?;

        let confirmed = parse_hex_quantity(&value)
            .ok_or_else(|| Error::BalanceUnavailable("malformed balance response".to_string()))?;
        Ok(Balance {
            confirmed,
            pending: 0,
        })
    }

    /// Account chains have one canonical address; nothing can drift.
    async fn reconcile_address(&self, seed: &[u8]) -> Result<ActiveKey> {
        let key_pair = keys::ethereum::derive_ethereum_key_pair(seed, Chain::Ethereum.derivation_path())?;
        let address = self.derive_address(key_pair.public_key())?;
        Ok(ActiveKey { address, key_pair })
    }

    async fn build_transaction(
        &self,
        request: &TransactionRequest,
        quote: FeeQuote,
    ) -> Result<UnsignedTransaction> {
        if request.chain != Chain::Ethereum {
            return Err(Error::InvalidInput("not an Ethereum request".to_string()));
        }
        let to = normalize_address(&request.to)?;
        let from = normalize_address(&request.from)?;

        let gas_price = quote.rate;
        let gas_cost = gas_price.saturating_mul(u128::from(GAS_LIMIT_TRANSFER));
        let balance = self.get_balance(&from).await?.confirmed;

        let value = match request.mode {
            SendMode::Send => {
                if request.amount == 0 {
                    return Err(Error::InvalidInput("amount must be greater than zero".to_string()));
                }
                let required = request
                    .amount
                    .checked_add(gas_cost)
                    .ok_or_else(|| Error::InvalidInput("amount plus fee overflows".to_string()))?;
                if balance < required {
                    return Err(Error::InsufficientFunds {
                        available: balance,
                        required,
                        fee: gas_cost,
                        max_sendable: balance.saturating_sub(gas_cost),
                    });
                }
                request.amount
            }
            SendMode::Sweep => {
                if balance <= gas_cost {
                    return Err(Error::DustAmount {
                        available: balance,
                        fee: gas_cost,
                    });
                }
                balance - gas_cost
            }
        };

        let nonce = self.fetch_nonce(&from).await?;

        Ok(UnsignedTransaction::Ethereum(UnsignedEthereumTx {
            from,
            to,
            value,
            nonce,
            gas_limit: GAS_LIMIT_TRANSFER,
            gas_price,
            fee_quote: quote,
        }))
    }

    fn sign_transaction(&self, tx: &UnsignedTransaction, private_key: &PrivateKey) -> Result<Vec<u8>> {
        let UnsignedTransaction::Ethereum(tx) = tx else {
            return Err(Error::Signing("not an Ethereum transaction".to_string()));
        };
        if private_key.chain() != Chain::Ethereum {
            return Err(Error::Signing("not an Ethereum private key".to_string()));
        }

        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(private_key.as_bytes())
            .map_err(|e| Error::Signing(format!("invalid private key: {}", e)))?;
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);

        let derived = self.derive_address(&PublicKey::new(
            public_key.serialize_uncompressed().to_vec(),
            Chain::Ethereum,
        ))?;
        if derived != tx.from {
            return Err(Error::Signing(
                "key does not control the sending address".to_string(),
            ));
        }

        let to = decode_address(&tx.to)?;
        let digest = signing_digest(tx, &to, self.chain_id);
        let (v, r, s) = sign_recoverable(&secp, &digest, &secret_key, self.chain_id)?;
        Ok(encode_signed(tx, &to, v, &r, &s))
    }

    async fn broadcast_transaction(&self, signed: &[u8]) -> Result<String> {
        let raw = format!("0x{}", hex::encode(signed));
        let mut failures = Vec::new();

        for endpoint in &self.endpoints.rpc {
            match self
                .client
                .rpc_single(endpoint, "eth_sendRawTransaction", json!([raw]), OpClass::Broadcast)
                .await
            {
                Ok(value) => match value.as_str() {
                    Some(txid) if is_valid_txid(txid) => return Ok(txid.to_lowercase()),
                    other => {
                        failures.push(EndpointFailure {
                            endpoint: endpoint.name.clone(),
                            reason: format!("invalid transaction hash in response: {:?}", other),
                        });
                    }
                },
                Err(ambiguous @ Error::BroadcastAmbiguous(_)) => return Err(ambiguous),
                Err(Error::Rpc { code, message }) => {
                    let lowered = message.to_lowercase();
                    // These mean the same bytes already landed, via an
                    // earlier endpoint or a prior attempt; keep walking.
                    if lowered.contains("nonce too low") || lowered.contains("already known") {
                        warn!(endpoint = %endpoint.name, message = %message, "transaction may already be known");
                        failures.push(EndpointFailure {
                            endpoint: endpoint.name.clone(),
                            reason: message,
                        });
                        continue;
                    }
                    // Any other node-side rejection is definitive.
                    return Err(Error::Rpc { code, message });
                }
                Err(e) => {
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Error::AllEndpointsFailed { failures })
    }
}

/// Normalize to lowercase `0x`-prefixed form, validating the hex payload.
fn normalize_address(address: &str) -> Result<String> {
    let lowered = address.trim().to_lowercase();
    let digits = lowered.strip_prefix("0x").unwrap_or(&lowered);
    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidAddress(format!(
            "not an Ethereum address: {}",
            address.trim()
        )));
    }
    Ok(format!("0x{}", digits))
}

fn decode_address(address: &str) -> Result<[u8; 20]> {
    let normalized = normalize_address(address)?;
    let decoded = hex::decode(&normalized[2..])
        .map_err(|_| Error::InvalidAddress(format!("not an Ethereum address: {}", address)))?;
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

fn is_valid_txid(txid: &str) -> bool {
    txid.len() == 66
        && txid.starts_with("0x")
        && txid[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Keccak digest of the EIP-155 signing payload:
/// `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`.
fn signing_digest(tx: &UnsignedEthereumTx, to: &[u8; 20], chain_id: u64) -> [u8; 32] {
    let mut payload = Vec::new();
    rlp_uint(&mut payload, u128::from(tx.nonce));
    rlp_uint(&mut payload, tx.gas_price);
    rlp_uint(&mut payload, u128::from(tx.gas_limit));
    rlp_bytes(&mut payload, to);
    rlp_uint(&mut payload, tx.value);
    rlp_bytes(&mut payload, &[]); // no calldata on plain transfers
    rlp_uint(&mut payload, u128::from(chain_id));
    rlp_uint(&mut payload, 0);
    rlp_uint(&mut payload, 0);
    keccak256(&rlp_list(&payload))
}

/// Recoverable signature over `digest` with the EIP-155 `v` encoding.
fn sign_recoverable(
    secp: &Secp256k1<secp256k1::All>,
    digest: &[u8; 32],
    secret_key: &SecretKey,
    chain_id: u64,
) -> Result<(u64, [u8; 32], [u8; 32])> {
    let message = Message::from_digest_slice(digest).map_err(|e| Error::Signing(e.to_string()))?;
    let signature = secp.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = signature.serialize_compact();

    let v = 35 + 2 * chain_id + recovery_id.to_i32() as u64;
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);
    Ok((v, r, s))
}

/// `rlp([nonce, gasPrice, gas, to, value, data, v, r, s])`.
fn encode_signed(tx: &UnsignedEthereumTx, to: &[u8; 20], v: u64, r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::new();
    rlp_uint(&mut payload, u128::from(tx.nonce));
    rlp_uint(&mut payload, tx.gas_price);
    rlp_uint(&mut payload, u128::from(tx.gas_limit));
    rlp_bytes(&mut payload, to);
    rlp_uint(&mut payload, tx.value);
    rlp_bytes(&mut payload, &[]);
    rlp_uint(&mut payload, u128::from(v));
    rlp_uint_bytes(&mut payload, r);
    rlp_uint_bytes(&mut payload, s);
    rlp_list(&payload)
}

fn rlp_bytes(out: &mut Vec<u8>, data: &[u8]) {
    if data.len() == 1 && data[0] < 0x80 {
        out.push(data[0]);
    } else {
        rlp_length(out, data.len(), 0x80);
        out.extend_from_slice(data);
    }
}

fn rlp_uint(out: &mut Vec<u8>, value: u128) {
    rlp_uint_bytes(out, &value.to_be_bytes());
}

/// Big-endian integer bytes in minimal form (leading zeroes stripped).
fn rlp_uint_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    match bytes.iter().position(|b| *b != 0) {
        Some(start) => rlp_bytes(out, &bytes[start..]),
        None => out.push(0x80), // zero encodes as the empty string
    }
}

fn rlp_list(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    rlp_length(&mut out, payload.len(), 0xc0);
    out.extend_from_slice(payload);
    out
}

fn rlp_length(out: &mut Vec<u8>, len: usize, base: u8) {
    if len <= 55 {
        out.push(base + len as u8);
    } else {
        let len_bytes = (len as u64).to_be_bytes();
        let start = len_bytes.iter().position(|b| *b != 0).unwrap_or(7);
        let len_of_len = (8 - start) as u8;
        out.push(base + 55 + len_of_len);
        out.extend_from_slice(&len_bytes[start..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee::FeeTier;
    use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};

    fn quote(rate: u128) -> FeeQuote {
        FeeQuote {
            tier: FeeTier::Normal,
            rate,
            source: "test".to_string(),
            fallback_depth: 0,
        }
    }

    fn adapter() -> EthereumAdapter {
        EthereumAdapter::new(
            crate::config::WalletConfig::default().ethereum,
            Arc::new(
                NetworkClient::new(
                    std::time::Duration::from_secs(1),
                    std::time::Duration::from_secs(1),
                )
                .unwrap(),
            ),
        )
    }

    #[test]
    fn test_rlp_integer_encoding() {
        let mut out = Vec::new();
        rlp_uint(&mut out, 0);
        assert_eq!(out, vec![0x80]);

        out.clear();
        rlp_uint(&mut out, 15);
        assert_eq!(out, vec![0x0f]);

        out.clear();
        rlp_uint(&mut out, 1024);
        assert_eq!(out, vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn test_rlp_string_and_list_encoding() {
        let mut out = Vec::new();
        rlp_bytes(&mut out, b"dog");
        assert_eq!(out, vec![0x83, b'd', b'o', b'g']);

        let mut payload = Vec::new();
        rlp_bytes(&mut payload, b"cat");
        rlp_bytes(&mut payload, b"dog");
        let list = rlp_list(&payload);
        assert_eq!(list[0], 0xc8);
        assert_eq!(list.len(), 9);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(" 0x9858EfFD232B4033E47d90003D41EC34EcaEda94 ").unwrap(),
            "0x9858effd232b4033e47d90003d41ec34ecaeda94"
        );
        assert_eq!(
            normalize_address("9858effd232b4033e47d90003d41ec34ecaeda94").unwrap(),
            "0x9858effd232b4033e47d90003d41ec34ecaeda94"
        );
        assert!(normalize_address("0x123").is_err());
        assert!(normalize_address("0xzz58effd232b4033e47d90003d41ec34ecaeda94").is_err());
    }

    #[test]
    fn test_txid_format_check() {
        assert!(is_valid_txid(&format!("0x{}", "ab".repeat(32))));
        assert!(!is_valid_txid(&"ab".repeat(33)));
        assert!(!is_valid_txid("0x1234"));
    }

    /// The worked example from the EIP-155 specification: nonce 9, 20 gwei,
    /// 21000 gas, 1 ether to 0x3535...35, signed with the all-46 key.
    #[test]
    fn test_eip155_worked_example() {
        let secret_key = SecretKey::from_slice(&[0x46u8; 32]).unwrap();
        let secp = Secp256k1::new();
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);
        let from = keys::ethereum::public_key_to_address(&PublicKey::new(
            public_key.serialize_uncompressed().to_vec(),
            Chain::Ethereum,
        ))
        .unwrap();

        let tx = UnsignedEthereumTx {
            from,
            to: format!("0x{}", "35".repeat(20)),
            value: 1_000_000_000_000_000_000,
            nonce: 9,
            gas_limit: 21_000,
            gas_price: 20_000_000_000,
            fee_quote: quote(20_000_000_000),
        };
        let to = decode_address(&tx.to).unwrap();

        let digest = signing_digest(&tx, &to, MAINNET_CHAIN_ID);
        assert_eq!(
            hex::encode(digest),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );

        let signed = adapter()
            .sign_transaction(&UnsignedTransaction::Ethereum(tx), &PrivateKey::new(vec![0x46; 32], Chain::Ethereum))
            .unwrap();
        assert_eq!(
            hex::encode(signed),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn test_signer_address_recoverable_from_signature() {
        let seed = crate::crypto::mnemonic::mnemonic_to_seed(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            None,
        )
        .unwrap();
        let key_pair =
            keys::ethereum::derive_ethereum_key_pair(&seed, "m/44'/60'/0'/0/0").unwrap();
        let from = keys::ethereum::public_key_to_address(key_pair.public_key()).unwrap();

        let tx = UnsignedEthereumTx {
            from: from.clone(),
            to: "0x1111111111111111111111111111111111111111".to_string(),
            value: 42,
            nonce: 7,
            gas_limit: 21_000,
            gas_price: 30_000_000_000,
            fee_quote: quote(30_000_000_000),
        };
        let to = decode_address(&tx.to).unwrap();

        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(key_pair.private_key().as_bytes()).unwrap();
        let digest = signing_digest(&tx, &to, MAINNET_CHAIN_ID);
        let (v, r, s) = sign_recoverable(&secp, &digest, &secret_key, MAINNET_CHAIN_ID).unwrap();

        // Undo the EIP-155 v encoding and recover the signer.
        let recovery_id = RecoveryId::from_i32((v - 35 - 2 * MAINNET_CHAIN_ID) as i32).unwrap();
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&r);
        compact[32..].copy_from_slice(&s);
        let signature = RecoverableSignature::from_compact(&compact, recovery_id).unwrap();
        let message = Message::from_digest_slice(&digest).unwrap();
        let recovered = secp.recover_ecdsa(&message, &signature).unwrap();

        let recovered_address = keys::ethereum::public_key_to_address(&PublicKey::new(
            recovered.serialize_uncompressed().to_vec(),
            Chain::Ethereum,
        ))
        .unwrap();
        assert_eq!(recovered_address, from);
    }

    #[test]
    fn test_sign_rejects_foreign_key() {
        let tx = UnsignedEthereumTx {
            from: "0x9858effd232b4033e47d90003d41ec34ecaeda94".to_string(),
            to: "0x1111111111111111111111111111111111111111".to_string(),
            value: 42,
            nonce: 0,
            gas_limit: 21_000,
            gas_price: 30_000_000_000,
            fee_quote: quote(30_000_000_000),
        };

        // The all-46 key does not control that sender.
        let result = adapter().sign_transaction(
            &UnsignedTransaction::Ethereum(tx),
            &PrivateKey::new(vec![0x46; 32], Chain::Ethereum),
        );
        match result {
            Err(Error::Signing(message)) => assert!(message.contains("sending address")),
            other => panic!("expected Signing error, got {:?}", other.map(hex::encode)),
        }
    }

    #[test]
    fn test_fee_is_gas_times_price() {
        let tx = UnsignedEthereumTx {
            from: "0x9858effd232b4033e47d90003d41ec34ecaeda94".to_string(),
            to: "0x1111111111111111111111111111111111111111".to_string(),
            value: 1,
            nonce: 0,
            gas_limit: 21_000,
            gas_price: 25_000_000_000,
            fee_quote: quote(25_000_000_000),
        };
        assert_eq!(tx.fee(), 21_000 * 25_000_000_000);
    }
}
