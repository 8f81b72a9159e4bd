//! Fee estimation
//!
//! Quotes a fee rate per chain and urgency tier from an ordered oracle list.
//! Estimation degrades to conservative hardcoded defaults instead of
//! erroring: a spend must never be blocked because a fee oracle is down.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::crypto::keys::Chain;
use crate::net::{Endpoint, NetworkClient, OpClass};

/// Fee urgency tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FeeTier {
    Slow,
    Normal,
    Fast,
}

impl FeeTier {
    /// Multiplier applied to the network's base rate, in percent.
    fn multiplier_pct(&self) -> u128 {
        match self {
            Self::Slow => 90,
            Self::Normal => 110,
            Self::Fast => 130,
        }
    }
}

impl std::fmt::Display for FeeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Slow => "slow",
            Self::Normal => "normal",
            Self::Fast => "fast",
        };
        f.write_str(name)
    }
}

/// A fee rate quote. The unit is chain-specific: satoshis per virtual byte
/// for Bitcoin, wei per gas for Ethereum. Never persisted; recomputed per
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuote {
    pub tier: FeeTier,
    pub rate: u128,
    /// Oracle that answered, or [`FALLBACK_SOURCE`].
    pub source: String,
    /// Endpoints that failed before this quote was obtained; equals the
    /// oracle count when the hardcoded fallback was used.
    pub fallback_depth: usize,
}

/// Source marker for quotes produced without any oracle.
pub const FALLBACK_SOURCE: &str = "fallback";

/// Minimum viable rates, to avoid transactions stuck below network floors.
pub const MIN_SAT_PER_VB: u128 = 1;
pub const MIN_WEI_PER_GAS: u128 = 12_000_000_000; // 12 gwei

/// Conservative defaults when every oracle fails. Placeholder policy, not a
/// validated economic model.
pub const FALLBACK_SAT_PER_VB: u128 = 25;

const WEI_PER_GWEI: u128 = 1_000_000_000;

fn fallback_wei_per_gas(tier: FeeTier) -> u128 {
    let gwei: u128 = match tier {
        FeeTier::Slow => 18,
        FeeTier::Normal => 25,
        FeeTier::Fast => 35,
    };
    gwei * WEI_PER_GWEI
}

/// Queries network congestion and proposes tiered fee rates.
pub struct FeeEstimator {
    client: Arc<NetworkClient>,
    bitcoin_oracles: Vec<Endpoint>,
    ethereum_rpc: Vec<Endpoint>,
}

impl FeeEstimator {
    pub fn new(
        client: Arc<NetworkClient>,
        bitcoin_oracles: Vec<Endpoint>,
        ethereum_rpc: Vec<Endpoint>,
    ) -> Self {
        Self {
            client,
            bitcoin_oracles,
            ethereum_rpc,
        }
    }

    /// Quote a fee rate for `chain` at `tier`.
    ///
    /// Walks the oracle list in order and scales the first answer by the
    /// tier multiplier, clamped to the chain's minimum viable rate. If every
    /// oracle fails the hardcoded fallback is returned — never an error.
    pub async fn quote(&self, chain: Chain, tier: FeeTier) -> FeeQuote {
        match chain {
            Chain::Bitcoin => self.quote_bitcoin(tier).await,
            Chain::Ethereum => self.quote_ethereum(tier).await,
        }
    }

    async fn quote_bitcoin(&self, tier: FeeTier) -> FeeQuote {
        for (depth, oracle) in self.bitcoin_oracles.iter().enumerate() {
            match self.client.get_text(&oracle.url, OpClass::Read).await {
                Ok(body) => {
                    if let Some(base) = parse_bitcoin_oracle(&body) {
                        let rate = scale_rate(base, tier, MIN_SAT_PER_VB);
                        debug!(oracle = %oracle.name, base, rate, tier = %tier, "bitcoin fee quote");
                        return FeeQuote {
                            tier,
                            rate,
                            source: oracle.name.clone(),
                            fallback_depth: depth,
                        };
                    }
                    warn!(oracle = %oracle.name, "unrecognized fee oracle response");
                }
                Err(e) => warn!(oracle = %oracle.name, error = %e, "fee oracle failed"),
            }
        }

        warn!(tier = %tier, "all bitcoin fee oracles failed, using fallback rate");
        FeeQuote {
            tier,
            rate: scale_rate(FALLBACK_SAT_PER_VB, tier, MIN_SAT_PER_VB),
            source: FALLBACK_SOURCE.to_string(),
            fallback_depth: self.bitcoin_oracles.len(),
        }
    }

    async fn quote_ethereum(&self, tier: FeeTier) -> FeeQuote {
        for (depth, endpoint) in self.ethereum_rpc.iter().enumerate() {
            match self
                .client
                .rpc_single(endpoint, "eth_gasPrice", json!([]), OpClass::Read)
                .await
            {
                Ok(value) => {
                    if let Some(base) = parse_hex_quantity(&value) {
                        let rate = scale_rate(base, tier, MIN_WEI_PER_GAS);
                        debug!(endpoint = %endpoint.name, base, rate, tier = %tier, "ethereum gas quote");
                        return FeeQuote {
                            tier,
                            rate,
                            source: endpoint.name.clone(),
                            fallback_depth: depth,
                        };
                    }
                    warn!(endpoint = %endpoint.name, "unrecognized eth_gasPrice response");
                }
                Err(e) => warn!(endpoint = %endpoint.name, error = %e, "gas price lookup failed"),
            }
        }

        warn!(tier = %tier, "all gas price sources failed, using fallback rate");
        FeeQuote {
            tier,
            rate: fallback_wei_per_gas(tier),
            source: FALLBACK_SOURCE.to_string(),
            fallback_depth: self.ethereum_rpc.len(),
        }
    }
}

/// Scale a base rate by the tier multiplier and clamp to the chain minimum.
fn scale_rate(base: u128, tier: FeeTier, minimum: u128) -> u128 {
    let scaled = base.saturating_mul(tier.multiplier_pct()) / 100;
    scaled.max(minimum)
}

/// Extract a base sat/vB rate from either supported oracle shape:
/// `{"fastestFee": .., "halfHourFee": ..}` (mempool.space recommended) or
/// `{"6": 24.2, ..}` (esplora fee-estimates keyed by confirmation target).
fn parse_bitcoin_oracle(body: &str) -> Option<u128> {
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;

    if let Some(rate) = object.get("halfHourFee").and_then(Value::as_u64) {
        return Some(u128::from(rate.max(1)));
    }
    if let Some(rate) = object.get("6").and_then(Value::as_f64) {
        if rate.is_finite() && rate >= 0.0 {
            return Some((rate.ceil() as u64).max(1) as u128);
        }
    }
    None
}

/// Parse a JSON-RPC hex quantity (`"0x..."`) into an integer.
pub(crate) fn parse_hex_quantity(value: &Value) -> Option<u128> {
    let text = value.as_str()?;
    let digits = text.strip_prefix("0x")?;
    u128::from_str_radix(digits, 16).ok()
}
