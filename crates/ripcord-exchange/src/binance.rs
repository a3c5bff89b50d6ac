//! Binance spot REST client with HMAC-SHA256 signed requests.
//!
//! The secret key is used exclusively for signing and never logged or
//! serialized. Signed requests carry the API key in `X-MBX-APIKEY`
//! and a `recvWindow` to tolerate minor clock drift.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use ripcord_core::{ExchangeId, OrderSide, OrderStatus, OrderType, Price, Qty, SymbolRules};

use crate::client::{ExchangeClient, ExchangeEndpoints};
use crate::error::{ExchangeError, Result};
use crate::types::{AssetBalance, BalanceSheet, NewOrder, OrderAck};

type HmacSha256 = Hmac<Sha256>;

/// Binance spot REST API client.
pub struct BinanceClient {
    secret: String,
    base_url: String,
    recv_window_ms: u64,
    http: reqwest::Client,
}

impl BinanceClient {
    pub fn new(endpoints: &ExchangeEndpoints, api_key: &str, secret: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key_value = HeaderValue::from_str(api_key)
            .map_err(|e| ExchangeError::Auth(format!("API key is not a valid header: {e}")))?;
        headers.insert("X-MBX-APIKEY", key_value);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            secret: secret.to_string(),
            base_url: endpoints.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: endpoints.recv_window_ms,
            http,
        })
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        sign_query(&self.secret, query)
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Full query string for a signed request: appends timestamp,
    /// recvWindow, and the signature over everything before it.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let recv = self.recv_window_ms;
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={recv}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={recv}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn read_json(&self, resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Parse(format!("bad response body: {e}")));
        }

        Err(error_from_response(status, &body))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn balances(&self) -> Result<BalanceSheet> {
        let qs = self.signed_query("omitZeroBalances=true");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let body = self.read_json(self.http.get(&url).send().await?).await?;
        let account: AccountResponse = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Parse(format!("account response: {e}")))?;

        let balances = account
            .balances
            .into_iter()
            .map(|b| AssetBalance {
                asset: b.asset,
                free: Qty::new(b.free),
                locked: Qty::new(b.locked),
            })
            .collect();
        Ok(BalanceSheet::new(balances))
    }

    async fn place_order(&self, order: &NewOrder) -> Result<OrderAck> {
        let params = build_order_params(order);
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            qty = %order.qty,
            "submitting order"
        );

        let body = self.read_json(self.http.post(&url).send().await?).await?;
        let resp: OrderResponse = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Parse(format!("order response: {e}")))?;

        Ok(OrderAck {
            exchange_order_id: resp.order_id.to_string(),
            client_order_id: Some(resp.client_order_id),
            status: resp.status,
            executed_qty: Qty::new(resp.executed_qty),
            cumulative_quote: resp.cumulative_quote_qty,
        })
    }

    async fn cancel_all(&self, symbol: &str) -> Result<u32> {
        let qs = self.signed_query(&format!("symbol={symbol}"));
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        match self.read_json(self.http.delete(&url).send().await?).await {
            Ok(body) => Ok(body.as_array().map(|a| a.len() as u32).unwrap_or(0)),
            // -2011: nothing resting on the symbol.
            Err(ExchangeError::Api { code: -2011, .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);

        let body = self.read_json(self.http.get(&url).send().await?).await?;
        parse_symbol_rules(&body, symbol)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// HMAC-SHA256 hex signature, shared with tests.
fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Query parameters for POST /api/v3/order.
///
/// `newOrderRespType=RESULT` makes the ack carry executedQty and
/// cummulativeQuoteQty for both limit and market orders.
fn build_order_params(order: &NewOrder) -> String {
    let side = match order.side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    };
    let qty = order.qty.inner().normalize();

    let mut params = match order.order_type {
        OrderType::Limit => {
            let price = order
                .price
                .map(|p| p.inner().normalize())
                .unwrap_or(Decimal::ZERO);
            format!(
                "symbol={}&side={side}&type=LIMIT&timeInForce={}&quantity={qty}&price={price}",
                order.symbol,
                order.tif.to_string().to_uppercase(),
            )
        }
        OrderType::Market => {
            format!("symbol={}&side={side}&type=MARKET&quantity={qty}", order.symbol)
        }
    };

    params.push_str(&format!(
        "&newClientOrderId={}&newOrderRespType=RESULT",
        order.client_order_id
    ));
    params
}

/// Map a non-2xx response to the error taxonomy.
fn error_from_response(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited(body.to_string());
    }
    if status.is_server_error() {
        return ExchangeError::Unavailable {
            status: status.as_u16(),
            body: body.to_string(),
        };
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => map_api_error(err.code, err.msg),
        Err(_) => ExchangeError::Api {
            code: status.as_u16() as i64,
            message: body.to_string(),
        },
    }
}

/// Binance error codes that need dedicated handling upstream.
fn map_api_error(code: i64, msg: String) -> ExchangeError {
    match code {
        -2010 | -2019 => ExchangeError::InsufficientBalance(msg),
        -1121 => ExchangeError::InvalidSymbol(msg),
        // -1013: filter failure, which for our floored orders means
        // the notional fell under the venue minimum.
        -1013 => ExchangeError::NotionalTooSmall(msg),
        -1021 | -1022 | -2014 | -2015 => ExchangeError::Auth(msg),
        _ => ExchangeError::Api { code, message: msg },
    }
}

/// Extract tick/step/notional from an exchangeInfo response.
fn parse_symbol_rules(body: &serde_json::Value, symbol: &str) -> Result<SymbolRules> {
    let info = body["symbols"]
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;

    let mut rules = SymbolRules::unconstrained();
    let filters = info["filters"].as_array().cloned().unwrap_or_default();

    for filter in &filters {
        match filter["filterType"].as_str() {
            Some("LOT_SIZE") => {
                rules.qty_step = Qty::new(parse_decimal_field(filter, "stepSize")?);
            }
            Some("PRICE_FILTER") => {
                rules.price_tick = Price::new(parse_decimal_field(filter, "tickSize")?);
            }
            // NOTIONAL replaced MIN_NOTIONAL; older symbols may still
            // carry the legacy filter.
            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                rules.min_notional = parse_decimal_field(filter, "minNotional")?;
            }
            _ => {}
        }
    }

    if rules.qty_step.is_zero() {
        warn!(symbol, "exchangeInfo carried no LOT_SIZE filter");
    }
    Ok(rules)
}

fn parse_decimal_field(value: &serde_json::Value, field: &str) -> Result<Decimal> {
    value[field]
        .as_str()
        .ok_or_else(|| ExchangeError::Parse(format!("missing filter field {field}")))?
        .parse()
        .map_err(|e| ExchangeError::Parse(format!("bad decimal in {field}: {e}")))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    client_order_id: String,
    status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty", with = "rust_decimal::serde::str")]
    cumulative_quote_qty: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripcord_core::{ClientOrderId, OrderSide, TimeInForce};
    use rust_decimal_macros::dec;

    // Signature example published in the Binance API documentation.
    #[test]
    fn test_sign_query_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_build_limit_order_params() {
        let order = NewOrder {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            qty: Qty::new(dec!(0.500)),
            price: Some(Price::new(dec!(50250.10))),
            tif: TimeInForce::GoodTilCancelled,
            client_order_id: ClientOrderId::from_string("rip_t_1".into()),
        };

        let params = build_order_params(&order);
        assert_eq!(
            params,
            "symbol=BTCUSDT&side=SELL&type=LIMIT&timeInForce=GTC&quantity=0.5&price=50250.1\
             &newClientOrderId=rip_t_1&newOrderRespType=RESULT"
        );
    }

    #[test]
    fn test_build_market_order_params() {
        let order = NewOrder {
            symbol: "ETHUSDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            qty: Qty::new(dec!(1.25)),
            price: None,
            tif: TimeInForce::GoodTilCancelled,
            client_order_id: ClientOrderId::from_string("rip_t_2".into()),
        };

        let params = build_order_params(&order);
        assert_eq!(
            params,
            "symbol=ETHUSDT&side=SELL&type=MARKET&quantity=1.25\
             &newClientOrderId=rip_t_2&newOrderRespType=RESULT"
        );
    }

    #[test]
    fn test_map_api_error_codes() {
        assert!(matches!(
            map_api_error(-2010, "insufficient".into()),
            ExchangeError::InsufficientBalance(_)
        ));
        assert!(matches!(
            map_api_error(-1121, "bad symbol".into()),
            ExchangeError::InvalidSymbol(_)
        ));
        assert!(matches!(
            map_api_error(-1013, "filter".into()),
            ExchangeError::NotionalTooSmall(_)
        ));
        assert!(matches!(
            map_api_error(-2014, "key".into()),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            map_api_error(-1000, "other".into()),
            ExchangeError::Api { code: -1000, .. }
        ));
    }

    #[test]
    fn test_error_from_response_statuses() {
        assert!(matches!(
            error_from_response(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(
            error_from_response(StatusCode::BAD_GATEWAY, "upstream"),
            ExchangeError::Unavailable { status: 502, .. }
        ));
        assert!(matches!(
            error_from_response(
                StatusCode::BAD_REQUEST,
                r#"{"code":-2010,"msg":"Account has insufficient balance."}"#
            ),
            ExchangeError::InsufficientBalance(_)
        ));
    }

    #[test]
    fn test_parse_symbol_rules() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{
                "symbols": [{
                    "symbol": "BTCUSDT",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000", "tickSize": "0.01"},
                        {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000", "stepSize": "0.00001"},
                        {"filterType": "NOTIONAL", "minNotional": "5.00000000"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let rules = parse_symbol_rules(&body, "BTCUSDT").unwrap();
        assert_eq!(rules.qty_step, Qty::new(dec!(0.00001)));
        assert_eq!(rules.price_tick, Price::new(dec!(0.01)));
        assert_eq!(rules.min_notional, dec!(5.00000000));
    }

    #[test]
    fn test_parse_symbol_rules_unknown_symbol() {
        let body: serde_json::Value = serde_json::from_str(r#"{"symbols": []}"#).unwrap();
        assert!(matches!(
            parse_symbol_rules(&body, "NOPEUSDT"),
            Err(ExchangeError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn test_order_response_parse() {
        let raw = r#"{
            "symbol": "BTCUSDT",
            "orderId": 28,
            "orderListId": -1,
            "clientOrderId": "rip_1_abc",
            "transactTime": 1507725176595,
            "price": "0.00000000",
            "origQty": "10.00000000",
            "executedQty": "10.00000000",
            "cummulativeQuoteQty": "10.00000000",
            "status": "FILLED",
            "timeInForce": "GTC",
            "type": "MARKET",
            "side": "SELL"
        }"#;

        let resp: OrderResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.order_id, 28);
        assert_eq!(resp.status, OrderStatus::Filled);
        assert_eq!(resp.executed_qty, dec!(10));
        assert_eq!(resp.cumulative_quote_qty, dec!(10));
    }
}
