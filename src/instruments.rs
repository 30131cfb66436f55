//! One-shot instrument listing over REST
//!
//! Independent of the session: a plain GET of
//! `/api/v2/public/get_instruments` on the host the WebSocket endpoint
//! points at.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use dlink_app::{load_settings, load_settings_from};
use dlink_core::prelude::*;

const INSTRUMENTS_PATH: &str = "/api/v2/public/get_instruments";

/// Build the REST URL for `currency` on the same host as `ws_url`.
///
/// `ws` maps to `http` and `wss` to `https`; anything else is already a
/// REST base and keeps its scheme.
pub fn instruments_url(ws_url: &str, currency: &str, kind: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(ws_url)
        .map_err(|e| Error::config_invalid(format!("{ws_url:?} is not a URL: {e}")))?;

    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| Error::config_invalid(format!("cannot use scheme {scheme:?} for REST")))?;

    url.set_path(INSTRUMENTS_PATH);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("currency", currency);
        if let Some(kind) = kind {
            query.append_pair("kind", kind);
        }
    }
    Ok(url)
}

/// Extract `result` from a JSON-RPC style REST body.
pub fn parse_instruments_body(body: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_str(body)?;
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::rpc(code, message));
    }
    value
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| Error::malformed("instruments response lacks result"))
}

/// GET the instrument list.
pub async fn fetch_instruments(client: &reqwest::Client, url: Url) -> Result<Value> {
    debug!("GET {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::http(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::http(e.to_string()))?;

    // Deribit reports bad parameters as 400 with a JSON-RPC error body.
    if !status.is_success() && body.trim().is_empty() {
        return Err(Error::http(format!("server answered {status}")));
    }
    parse_instruments_body(&body)
}

/// `dlink instruments`: print the list as pretty JSON on stdout.
pub async fn run_instruments(
    config_path: Option<&Path>,
    currency: &str,
    kind: Option<&str>,
) -> Result<()> {
    let settings = match config_path {
        Some(path) => load_settings_from(path)?,
        None => load_settings(&std::env::current_dir()?),
    };

    let url = instruments_url(&settings.connection.url, currency, kind)?;
    info!("Listing {} instruments from {}", currency, url);

    let instruments = fetch_instruments(&reqwest::Client::new(), url).await?;
    println!("{}", serde_json::to_string_pretty(&instruments)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_testnet_ws() {
        let url = instruments_url("wss://test.deribit.com/ws/api/v2", "BTC", None).unwrap();
        assert_eq!(
            url.as_str(),
            "https://test.deribit.com/api/v2/public/get_instruments?currency=BTC"
        );
    }

    #[test]
    fn test_url_keeps_port_and_maps_plain_ws() {
        let url =
            instruments_url("ws://127.0.0.1:9000/ws/api/v2", "ETH", Some("future")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/api/v2/public/get_instruments?currency=ETH&kind=future"
        );
    }

    #[test]
    fn test_url_rejects_garbage() {
        let err = instruments_url("not a url", "BTC", None).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_parse_body_returns_result() {
        let body = r#"{"jsonrpc":"2.0","result":[{"instrument_name":"BTC-PERPETUAL","kind":"future"}],"usIn":1,"usOut":2,"testnet":true}"#;
        let result = parse_instruments_body(body).unwrap();
        assert_eq!(result[0]["instrument_name"], "BTC-PERPETUAL");
    }

    #[test]
    fn test_parse_body_maps_rpc_error() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":10004,"message":"bad_arguments"}}"#;
        match parse_instruments_body(body).unwrap_err() {
            Error::Rpc { code, message } => {
                assert_eq!(code, 10004);
                assert_eq!(message, "bad_arguments");
            }
            other => panic!("Expected Rpc, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_body_without_result_is_malformed() {
        let err = parse_instruments_body(r#"{"jsonrpc":"2.0"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage { .. }));
    }
}
