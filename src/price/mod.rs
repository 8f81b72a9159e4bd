//! Price service client
//!
//! The desktop shell shows fiat prices from the TyWallet price service; the
//! core only fetches and validates. Prices are display data, so any
//! non-numeric response degrades to [`Error::PriceUnavailable`] instead of
//! failing the caller — unlike fund-affecting lookups, which never
//! substitute defaults.

use std::sync::Arc;

use crate::crypto::keys::Chain;
use crate::error::{Error, Result};
use crate::net::{Endpoint, NetworkClient, OpClass};

pub struct PriceClient {
    client: Arc<NetworkClient>,
    endpoints: Vec<Endpoint>,
}

impl PriceClient {
    pub fn new(client: Arc<NetworkClient>, endpoints: Vec<Endpoint>) -> Self {
        Self { client, endpoints }
    }

    /// Current price of `chain`'s coin, as quoted by the first service that
    /// answers with a plain decimal body.
    pub async fn price(&self, chain: Chain) -> Result<f64> {
        let urls: Vec<Endpoint> = self
            .endpoints
            .iter()
            .map(|e| Endpoint::new(&e.name, &format!("{}/prices/{}", e.url, chain.coin_id())))
            .collect();

        self.client
            .get_with(&urls, OpClass::Read, parse_price)
            .await
            .map_err(|e| match e {
                Error::AllEndpointsFailed { .. } => Error::PriceUnavailable(e.to_string()),
                other => other,
            })
    }
}

/// The service answers with a plain decimal string (possibly with thousands
/// separators), or a human-readable error sentence.
fn parse_price(body: &str) -> Result<f64> {
    let cleaned = body.trim().replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(price) if price.is_finite() && price >= 0.0 => Ok(price),
        _ => Err(Error::PriceUnavailable(format!(
            "non-numeric price response: {}",
            body.trim().chars().take(80).collect::<String>()
        ))),
    }
}
