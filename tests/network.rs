//! Tests for ordered endpoint fallback against local servers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tywallet_core::chain::ethereum::EthereumAdapter;
use tywallet_core::chain::ChainAdapter;
use tywallet_core::config::EthereumEndpoints;
use tywallet_core::crypto::keys::{bitcoin as btc_keys, Chain};
use tywallet_core::crypto::mnemonic::mnemonic_to_seed;
use tywallet_core::error::Error;
use tywallet_core::net::{Endpoint, NetworkClient, OpClass};
use tywallet_core::price::PriceClient;

const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn client() -> Arc<NetworkClient> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tywallet_core=debug")
        .try_init();
    Arc::new(NetworkClient::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap())
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Serve canned responses chosen per request path; counts requests.
async fn serve<F>(respond: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        let respond = Arc::new(respond);
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let respond = respond.clone();
            tokio::spawn(async move {
                let mut buffer = [0u8; 8192];
                let read = socket.read(&mut buffer).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buffer[..read]).to_string();
                let path = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let _ = socket.write_all(respond(&path).as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), hits)
}

#[tokio::test]
async fn test_second_endpoint_wins_and_third_is_never_tried() {
    let (failing, _) = serve(|_| http_response("500 Internal Server Error", "boom")).await;
    let (working, _) = serve(|_| http_response("200 OK", "42")).await;
    let (untouched, untouched_hits) = serve(|_| http_response("200 OK", "never")).await;

    let endpoints = [
        Endpoint::new("E1", &failing),
        Endpoint::new("E2", &working),
        Endpoint::new("E3", &untouched),
    ];

    let value = client()
        .get_with(&endpoints, OpClass::Read, |body| {
            body.trim()
                .parse::<u32>()
                .map_err(|e| Error::Serialization(e.to_string()))
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(untouched_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_response_advances_like_a_network_error() {
    let (malformed, _) = serve(|_| http_response("200 OK", "not a number")).await;
    let (working, _) = serve(|_| http_response("200 OK", "7")).await;

    let endpoints = [Endpoint::new("E1", &malformed), Endpoint::new("E2", &working)];

    let value = client()
        .get_with(&endpoints, OpClass::Read, |body| {
            body.trim()
                .parse::<u32>()
                .map_err(|e| Error::Serialization(e.to_string()))
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn test_all_endpoints_failing_enumerates_each_failure() {
    let (failing, _) = serve(|_| http_response("500 Internal Server Error", "boom")).await;

    let endpoints = [
        Endpoint::new("E1", &failing),
        // Nothing listens on port 9; connection is refused outright.
        Endpoint::new("E2", "http://127.0.0.1:9"),
    ];

    match client()
        .get_with(&endpoints, OpClass::Read, |_| Ok(()))
        .await
    {
        Err(Error::AllEndpointsFailed { failures }) => {
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].endpoint, "E1");
            assert!(failures[0].reason.contains("500"));
            assert_eq!(failures[1].endpoint, "E2");
        }
        other => panic!("expected AllEndpointsFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ethereum_balance_over_json_rpc_fallback() {
    let rpc_body = r#"{"jsonrpc":"2.0","id":1,"result":"0x2540be400"}"#;
    let (failing, _) = serve(|_| http_response("503 Service Unavailable", "maintenance")).await;
    let (working, _) = serve(move |_| http_response("200 OK", rpc_body)).await;

    let adapter = EthereumAdapter::new(
        EthereumEndpoints {
            rpc: vec![Endpoint::new("Down", &failing), Endpoint::new("Up", &working)],
        },
        client(),
    );

    let balance = adapter
        .get_balance("0x9858effd232b4033e47d90003d41ec34ecaeda94")
        .await
        .unwrap();
    assert_eq!(balance.confirmed, 10_000_000_000);
    assert_eq!(balance.pending, 0);
}

#[tokio::test]
async fn test_ethereum_balance_unavailable_after_every_endpoint() {
    let adapter = EthereumAdapter::new(
        EthereumEndpoints {
            rpc: vec![Endpoint::new("Refused", "http://127.0.0.1:9")],
        },
        client(),
    );

    match adapter.get_balance("0x9858effd232b4033e47d90003d41ec34ecaeda94").await {
        Err(Error::BalanceUnavailable(reason)) => assert!(reason.contains("Refused")),
        other => panic!("expected BalanceUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_price_client_degrades_on_error_sentence() {
    let (working, _) = serve(|path| {
        assert!(path.starts_with("/prices/"));
        http_response("200 OK", "117234.55")
    })
    .await;

    let prices = PriceClient::new(client(), vec![Endpoint::new("Prices", &working)]);
    let price = prices.price(Chain::Bitcoin).await.unwrap();
    assert_eq!(price, 117234.55);

    let (broken, _) = serve(|_| http_response("200 OK", "Error: Price data could not be fetched!")).await;
    let prices = PriceClient::new(client(), vec![Endpoint::new("Prices", &broken)]);
    match prices.price(Chain::Ethereum).await {
        Err(Error::PriceUnavailable(_)) => {}
        other => panic!("expected PriceUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bitcoin_reconcile_prefers_funded_sibling_address() {
    use tywallet_core::chain::bitcoin::BitcoinAdapter;
    use tywallet_core::config::BitcoinEndpoints;

    let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();

    // The store's canonical address is index 0, but the funds sit on the
    // sibling at index 3 (an artifact of older revisions rotating the
    // receiving address).
    let funded = {
        let key_pair = btc_keys::derive_bitcoin_key_pair(&seed, "m/84'/0'/0'/0/3").unwrap();
        btc_keys::public_key_to_address(key_pair.public_key(), btc_keys::Network::Bitcoin).unwrap()
    };

    let funded_for_route = funded.clone();
    let (explorer, _) = serve(move |path| {
        let body = if path == format!("/address/{}", funded_for_route) {
            r#"{"chain_stats":{"funded_txo_sum":50000,"spent_txo_sum":0},"mempool_stats":{"funded_txo_sum":0,"spent_txo_sum":0}}"#
        } else {
            r#"{"chain_stats":{"funded_txo_sum":0,"spent_txo_sum":0},"mempool_stats":{"funded_txo_sum":0,"spent_txo_sum":0}}"#
        };
        http_response("200 OK", body)
    })
    .await;

    let adapter = BitcoinAdapter::new(
        btc_keys::Network::Bitcoin,
        BitcoinEndpoints {
            explorers: vec![Endpoint::new("Explorer", &explorer)],
            broadcast: vec![],
            fee_oracles: vec![],
        },
        client(),
    );

    let active = adapter.reconcile_address(&seed).await.unwrap();
    assert_eq!(active.address, funded);

    // The resolved key pair controls the resolved address.
    let derived = adapter.derive_address(active.key_pair.public_key()).unwrap();
    assert_eq!(derived, active.address);
}

#[tokio::test]
async fn test_bitcoin_reconcile_defaults_to_index_zero_when_empty() {
    use tywallet_core::chain::bitcoin::BitcoinAdapter;
    use tywallet_core::config::BitcoinEndpoints;

    let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();
    let (explorer, _) = serve(|_| {
        http_response(
            "200 OK",
            r#"{"chain_stats":{"funded_txo_sum":0,"spent_txo_sum":0},"mempool_stats":{"funded_txo_sum":0,"spent_txo_sum":0}}"#,
        )
    })
    .await;

    let adapter = BitcoinAdapter::new(
        btc_keys::Network::Bitcoin,
        BitcoinEndpoints {
            explorers: vec![Endpoint::new("Explorer", &explorer)],
            broadcast: vec![],
            fee_oracles: vec![],
        },
        client(),
    );

    let active = adapter.reconcile_address(&seed).await.unwrap();
    assert_eq!(active.address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
}
