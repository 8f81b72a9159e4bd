//! Bitcoin adapter
//!
//! Balance, UTXO snapshots, and broadcast go through esplora-compatible
//! indexers in an ordered fallback list. Transactions spend every available
//! UTXO to one destination plus optional change, and are signed per BIP-143
//! for P2WPKH inputs.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::Network;
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::BitcoinEndpoints;
use crate::crypto::keys::{self, Chain, PrivateKey, PublicKey};
use crate::error::{Error, Result};
use crate::fee::FeeQuote;
use crate::net::{Endpoint, NetworkClient, OpClass};
use super::{ActiveKey, Balance, ChainAdapter, SendMode, TransactionRequest, UnsignedTransaction};

/// Fixed transaction-size approximation: overhead plus per-input and
/// per-output costs, in bytes. Not exact virtual-size accounting.
const TX_OVERHEAD_BYTES: u64 = 10;
const TX_INPUT_BYTES: u64 = 148;
const TX_OUTPUT_BYTES: u64 = 34;

/// Outputs below this value are not relayed by default nodes; change smaller
/// than this is folded into the fee instead.
const DUST_LIMIT_SAT: u64 = 546;

/// Hard upper bound on a single send: total supply in satoshis.
const MAX_SATOSHI: u64 = 21_000_000 * 100_000_000;

/// External receiving addresses scanned when repairing address drift.
const SCAN_WINDOW: u32 = 10;

const SIGHASH_ALL: u32 = 1;
const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const TX_VERSION: u32 = 2;

/// One spendable output as reported by the indexer.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    /// Transaction id in display (big-endian) hex.
    pub txid: String,
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    #[serde(default)]
    pub status: UtxoStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtxoStatus {
    #[serde(default)]
    pub confirmed: bool,
}

/// esplora `GET /address/{addr}` response.
#[derive(Debug, Deserialize)]
struct AddressStats {
    chain_stats: TxoSums,
    mempool_stats: TxoSums,
}

#[derive(Debug, Deserialize)]
struct TxoSums {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

/// One output of a transaction under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A built-but-unsigned Bitcoin transaction.
#[derive(Debug, Clone)]
pub struct UnsignedBitcoinTx {
    /// Funding address whose key signs every input.
    pub from: String,
    pub inputs: Vec<Utxo>,
    /// Destination first, change (if any) last.
    pub outputs: Vec<TxOutput>,
    /// Satoshis paid to the destination.
    pub amount: u64,
    /// Total fee in satoshis.
    pub fee: u64,
    pub fee_quote: FeeQuote,
}

/// Bitcoin chain adapter.
pub struct BitcoinAdapter {
    network: Network,
    endpoints: BitcoinEndpoints,
    client: Arc<NetworkClient>,
}

impl BitcoinAdapter {
    pub fn new(network: Network, endpoints: BitcoinEndpoints, client: Arc<NetworkClient>) -> Self {
        Self {
            network,
            endpoints,
            client,
        }
    }

    fn explorer_urls(&self, path: &str) -> Vec<Endpoint> {
        self.endpoints
            .explorers
            .iter()
            .map(|e| Endpoint::new(&e.name, &format!("{}{}", e.url, path)))
            .collect()
    }

    /// Snapshot of the spendable outputs for `address`. Fetched fresh per
    /// build; balances change underneath us, so nothing is cached.
    async fn fetch_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoints = self.explorer_urls(&format!("/address/{}/utxo", address));
        self.client
            .get_with(&endpoints, OpClass::Read, |body| {
                serde_json::from_str::<Vec<Utxo>>(body)
                    .map_err(|e| Error::Serialization(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    fn derive_address(&self, public_key: &PublicKey) -> Result<String> {
        keys::bitcoin::public_key_to_address(public_key, self.network)
    }

    fn validate_address(&self, address: &str) -> Result<()> {
        script_pubkey_for(address, self.network).map(|_| ())
    }

    async fn get_balance(&self, address: &str) -> Result<Balance> {
        let endpoints = self.explorer_urls(&format!("/address/{}", address));
        self.client
            .get_with(&endpoints, OpClass::Read, |body| {
                let stats: AddressStats = serde_json::from_str(body)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(Balance {
                    confirmed: u128::from(
                        stats.chain_stats.funded_txo_sum
                            .saturating_sub(stats.chain_stats.spent_txo_sum),
                    ),
                    // An outgoing spend can leave mempool spent > funded;
                    // clamp at zero, pending is best-effort display data.
                    pending: u128::from(
                        stats.mempool_stats.funded_txo_sum
                            .saturating_sub(stats.mempool_stats.spent_txo_sum),
                    ),
                })
            })
            .await
            .map_err(|e| match e {
                Error::AllEndpointsFailed { .. } => Error::BalanceUnavailable(e.to_string()),
                other => other,
            })
    }

    /// Earlier wallet revisions rotated the receiving address on every
    /// creation call, so funds can sit on a sibling address the store does
    /// not point at. Scan the derivation window and prefer the best-funded
    /// address; an empty wallet resolves to the canonical index 0.
    async fn reconcile_address(&self, seed: &[u8]) -> Result<ActiveKey> {
        let mut candidates = Vec::with_capacity(SCAN_WINDOW as usize);
        for index in 0..SCAN_WINDOW {
            let path = format!("m/84'/0'/0'/0/{}", index);
            let key_pair = keys::bitcoin::derive_bitcoin_key_pair(seed, &path)?;
            let address = self.derive_address(key_pair.public_key())?;
            candidates.push((address, key_pair));
        }

        let mut best = 0usize;
        let mut best_balance = 0u128;
        for (index, (address, _)) in candidates.iter().enumerate() {
            match self.get_balance(address).await {
                Ok(balance) => {
                    let total = balance.confirmed + balance.pending;
                    if total > best_balance {
                        best_balance = total;
                        best = index;
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "scan lookup failed; treating as empty");
                }
            }
        }

        if best != 0 {
            debug!(index = best, balance = best_balance, "funds found on a sibling address");
        }
        let (address, key_pair) = candidates.swap_remove(best);
        Ok(ActiveKey { address, key_pair })
    }

    async fn build_transaction(
        &self,
        request: &TransactionRequest,
        quote: FeeQuote,
    ) -> Result<UnsignedTransaction> {
        if request.chain != Chain::Bitcoin {
            return Err(Error::InvalidInput("not a Bitcoin request".to_string()));
        }
        self.validate_address(&request.to)?;

        let amount = match request.mode {
            SendMode::Send => {
                if request.amount == 0 {
                    return Err(Error::InvalidInput("amount must be greater than zero".to_string()));
                }
                if request.amount > u128::from(MAX_SATOSHI) {
                    return Err(Error::InvalidInput(
                        "amount exceeds total Bitcoin supply".to_string(),
                    ));
                }
                request.amount as u64
            }
            SendMode::Sweep => 0,
        };

        let utxos = self.fetch_utxos(&request.from).await?;
        let dest_script = script_pubkey_for(&request.to, self.network)?;
        let change_script = script_pubkey_for(&request.from, self.network)?;

        let tx = build_with_rate(
            &request.from,
            utxos,
            quote,
            request.mode,
            amount,
            dest_script,
            change_script,
        )?;
        Ok(UnsignedTransaction::Bitcoin(tx))
    }

    fn sign_transaction(&self, tx: &UnsignedTransaction, private_key: &PrivateKey) -> Result<Vec<u8>> {
        let UnsignedTransaction::Bitcoin(tx) = tx else {
            return Err(Error::Signing("not a Bitcoin transaction".to_string()));
        };
        if private_key.chain() != Chain::Bitcoin {
            return Err(Error::Signing("not a Bitcoin private key".to_string()));
        }
        if tx.inputs.is_empty() {
            return Err(Error::Signing("transaction has no inputs".to_string()));
        }

        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(private_key.as_bytes())
            .map_err(|e| Error::Signing(format!("invalid private key: {}", e)))?;
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);
        let pubkey_bytes = public_key.serialize();

        // The record invariant: the funding address must be derivable from
        // the key we are about to sign with.
        let derived = self.derive_address(&PublicKey::new(pubkey_bytes.to_vec(), Chain::Bitcoin))?;
        if derived != tx.from {
            return Err(Error::Signing(
                "key does not control the funding address".to_string(),
            ));
        }

        let pubkey_hash = hash160::Hash::hash(&pubkey_bytes).to_byte_array();
        let mut witnesses = Vec::with_capacity(tx.inputs.len());
        for index in 0..tx.inputs.len() {
            let digest = segwit_sighash(tx, index, &pubkey_hash)?;
            let message = Message::from_digest_slice(&digest)
                .map_err(|e| Error::Signing(e.to_string()))?;
            let signature = secp.sign_ecdsa(&message, &secret_key);

            let mut sig_bytes = signature.serialize_der().to_vec();
            sig_bytes.push(SIGHASH_ALL as u8);
            witnesses.push(vec![sig_bytes, pubkey_bytes.to_vec()]);
        }

        serialize_tx(tx, Some(&witnesses))
    }

    async fn broadcast_transaction(&self, signed: &[u8]) -> Result<String> {
        let raw = hex::encode(signed);
        self.client
            .broadcast_with(&self.endpoints.broadcast, "text/plain", &raw, |body| {
                let txid = body.trim().to_lowercase();
                if txid.len() == 64 && txid.bytes().all(|b| b.is_ascii_hexdigit()) {
                    Ok(txid)
                } else {
                    Err(Error::Network(format!(
                        "invalid txid in response: {}",
                        body.trim()
                    )))
                }
            })
            .await
    }
}

/// scriptPubKey for a destination address on `network`.
fn script_pubkey_for(address: &str, network: Network) -> Result<Vec<u8>> {
    let parsed = bitcoin::Address::from_str(address)
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;
    let checked = parsed
        .require_network(network)
        .map_err(|_| Error::InvalidAddress(format!("{} is not a {} address", address, network)))?;
    Ok(checked.script_pubkey().to_bytes())
}

/// Estimated serialized size for the fixed approximation formula.
fn estimate_tx_size(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_BYTES + TX_INPUT_BYTES * inputs as u64 + TX_OUTPUT_BYTES * outputs as u64
}

/// Price the transaction from the quoted rate and hand off to the fund
/// checks. Sends reserve two outputs (destination plus change); sweeps one.
fn build_with_rate(
    from: &str,
    utxos: Vec<Utxo>,
    quote: FeeQuote,
    mode: SendMode,
    amount: u64,
    dest_script: Vec<u8>,
    change_script: Vec<u8>,
) -> Result<UnsignedBitcoinTx> {
    let outputs = match mode {
        SendMode::Send => 2,
        SendMode::Sweep => 1,
    };
    let size = estimate_tx_size(utxos.len(), outputs);
    let fee = u64::try_from(quote.rate.saturating_mul(u128::from(size)))
        .map_err(|_| Error::InvalidInput("fee overflows".to_string()))?;

    build_with_fee(from, utxos, fee, quote, mode, amount, dest_script, change_script)
}

/// Assemble the transaction once the total fee is known, enforcing the fund
/// invariants. Every available UTXO is spent; coin selection is not
/// attempted.
#[allow(clippy::too_many_arguments)]
fn build_with_fee(
    from: &str,
    utxos: Vec<Utxo>,
    mut fee: u64,
    quote: FeeQuote,
    mode: SendMode,
    amount: u64,
    dest_script: Vec<u8>,
    change_script: Vec<u8>,
) -> Result<UnsignedBitcoinTx> {
    let mut balance: u64 = 0;
    for utxo in &utxos {
        balance = balance
            .checked_add(utxo.value)
            .ok_or_else(|| Error::InvalidInput("UTXO values overflow".to_string()))?;
    }

    if balance <= fee {
        return Err(Error::DustAmount {
            available: u128::from(balance),
            fee: u128::from(fee),
        });
    }

    let mut outputs = Vec::with_capacity(2);
    let amount = match mode {
        SendMode::Send => {
            let required = amount
                .checked_add(fee)
                .ok_or_else(|| Error::InvalidInput("amount plus fee overflows".to_string()))?;
            if balance < required {
                return Err(Error::InsufficientFunds {
                    available: u128::from(balance),
                    required: u128::from(required),
                    fee: u128::from(fee),
                    max_sendable: u128::from(balance - fee),
                });
            }

            outputs.push(TxOutput {
                value: amount,
                script_pubkey: dest_script,
            });
            let change = balance - amount - fee;
            if change >= DUST_LIMIT_SAT {
                outputs.push(TxOutput {
                    value: change,
                    script_pubkey: change_script,
                });
            } else {
                // Sub-dust change is unrelayable; it goes to the miners.
                fee += change;
            }
            amount
        }
        SendMode::Sweep => {
            let amount = balance - fee;
            outputs.push(TxOutput {
                value: amount,
                script_pubkey: dest_script,
            });
            amount
        }
    };

    Ok(UnsignedBitcoinTx {
        from: from.to_string(),
        inputs: utxos,
        outputs,
        amount,
        fee,
        fee_quote: quote,
    })
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Display-order txid hex to wire (little-endian) bytes.
fn txid_wire_bytes(txid: &str) -> Result<[u8; 32]> {
    let decoded = hex::decode(txid)
        .map_err(|_| Error::Signing(format!("malformed txid: {}", txid)))?;
    if decoded.len() != 32 {
        return Err(Error::Signing(format!("malformed txid: {}", txid)));
    }
    let mut bytes = [0u8; 32];
    for (index, byte) in decoded.iter().rev().enumerate() {
        bytes[index] = *byte;
    }
    Ok(bytes)
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn serialize_outputs(outputs: &[TxOutput]) -> Vec<u8> {
    let mut out = Vec::new();
    for output in outputs {
        out.extend_from_slice(&output.value.to_le_bytes());
        push_varint(&mut out, output.script_pubkey.len() as u64);
        out.extend_from_slice(&output.script_pubkey);
    }
    out
}

/// BIP-143 sighash for the P2WPKH input at `index`, with SIGHASH_ALL.
fn segwit_sighash(tx: &UnsignedBitcoinTx, index: usize, pubkey_hash: &[u8; 20]) -> Result<[u8; 32]> {
    let input = tx
        .inputs
        .get(index)
        .ok_or_else(|| Error::Signing("input index out of range".to_string()))?;

    let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
    let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
    for utxo in &tx.inputs {
        prevouts.extend_from_slice(&txid_wire_bytes(&utxo.txid)?);
        prevouts.extend_from_slice(&utxo.vout.to_le_bytes());
        sequences.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    }
    let hash_prevouts = double_sha256(&prevouts);
    let hash_sequence = double_sha256(&sequences);
    let hash_outputs = double_sha256(&serialize_outputs(&tx.outputs));

    // scriptCode of a P2WPKH input is the canonical P2PKH script.
    let mut script_code = Vec::with_capacity(26);
    script_code.extend_from_slice(&[0x19, 0x76, 0xa9, 0x14]);
    script_code.extend_from_slice(pubkey_hash);
    script_code.extend_from_slice(&[0x88, 0xac]);

    let mut preimage = Vec::with_capacity(156);
    preimage.extend_from_slice(&TX_VERSION.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&txid_wire_bytes(&input.txid)?);
    preimage.extend_from_slice(&input.vout.to_le_bytes());
    preimage.extend_from_slice(&script_code);
    preimage.extend_from_slice(&input.value.to_le_bytes());
    preimage.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&0u32.to_le_bytes()); // locktime
    preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());

    Ok(double_sha256(&preimage))
}

/// Serialize the transaction. With witnesses the segwit framing is used;
/// without them the legacy framing, which is what the txid commits to.
fn serialize_tx(tx: &UnsignedBitcoinTx, witnesses: Option<&[Vec<Vec<u8>>]>) -> Result<Vec<u8>> {
    if let Some(witnesses) = witnesses {
        if witnesses.len() != tx.inputs.len() {
            return Err(Error::Signing("witness count mismatch".to_string()));
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&TX_VERSION.to_le_bytes());
    if witnesses.is_some() {
        out.push(0x00); // marker
        out.push(0x01); // flag
    }

    push_varint(&mut out, tx.inputs.len() as u64);
    for utxo in &tx.inputs {
        out.extend_from_slice(&txid_wire_bytes(&utxo.txid)?);
        out.extend_from_slice(&utxo.vout.to_le_bytes());
        out.push(0x00); // empty scriptSig
        out.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    }

    push_varint(&mut out, tx.outputs.len() as u64);
    out.extend_from_slice(&serialize_outputs(&tx.outputs));

    if let Some(witnesses) = witnesses {
        for witness in witnesses {
            push_varint(&mut out, witness.len() as u64);
            for item in witness {
                push_varint(&mut out, item.len() as u64);
                out.extend_from_slice(item);
            }
        }
    }

    out.extend_from_slice(&0u32.to_le_bytes()); // locktime
    Ok(out)
}

/// Transaction id (display order) of a built transaction: double-SHA256 of
/// the legacy serialization, reversed.
pub fn txid_of(tx: &UnsignedBitcoinTx) -> Result<String> {
    let legacy = serialize_tx(tx, None)?;
    let mut digest = double_sha256(&legacy);
    digest.reverse();
    Ok(hex::encode(digest))
}
