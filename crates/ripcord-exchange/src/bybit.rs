//! Bybit v5 REST client with header-based HMAC-SHA256 signing.
//!
//! Bybit signs `timestamp + api_key + recv_window + payload` and
//! carries the signature in `X-BAPI-SIGN` next to the key and
//! timestamp headers. Every response arrives in a `retCode` envelope
//! even on HTTP 200, so venue errors are mapped from the envelope,
//! not the status line.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use ripcord_core::{ExchangeId, OrderSide, OrderStatus, OrderType, Price, Qty, SymbolRules};

use crate::client::{ExchangeClient, ExchangeEndpoints};
use crate::error::{ExchangeError, Result};
use crate::types::{AssetBalance, BalanceSheet, NewOrder, OrderAck};

type HmacSha256 = Hmac<Sha256>;

/// Bybit v5 REST API client (spot category).
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    recv_window_ms: u64,
    http: reqwest::Client,
}

impl BybitClient {
    pub fn new(endpoints: &ExchangeEndpoints, api_key: &str, secret: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.to_string(),
            secret: secret.to_string(),
            base_url: endpoints.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: endpoints.recv_window_ms,
            http,
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Signed GET: the payload under the signature is the raw query
    /// string.
    async fn signed_get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T> {
        let ts = Self::timestamp_ms();
        let sig = sign_request(&self.secret, ts, &self.api_key, self.recv_window_ms, query);
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await?;

        read_envelope(resp).await
    }

    /// Signed POST: the payload under the signature is the exact JSON
    /// body sent on the wire. The body is serialized once and reused
    /// so the two can never diverge.
    async fn signed_post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_string(body)?;
        let ts = Self::timestamp_ms();
        let sig = sign_request(&self.secret, ts, &self.api_key, self.recv_window_ms, &body);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        read_envelope(resp).await
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn balances(&self) -> Result<BalanceSheet> {
        let result: WalletBalanceResult = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let coins = result
            .list
            .into_iter()
            .next()
            .map(|account| account.coin)
            .unwrap_or_default();

        let balances = coins
            .into_iter()
            .map(|c| {
                let locked = c.locked.unwrap_or(Decimal::ZERO);
                let free = (c.wallet_balance - locked).max(Decimal::ZERO);
                AssetBalance {
                    asset: c.coin,
                    free: Qty::new(free),
                    locked: Qty::new(locked),
                }
            })
            .collect();
        Ok(BalanceSheet::new(balances))
    }

    async fn place_order(&self, order: &NewOrder) -> Result<OrderAck> {
        let request = CreateOrderRequest::from_order(order);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            qty = %order.qty,
            "submitting order"
        );

        let result: CreateOrderResult = self.signed_post("/v5/order/create", &request).await?;

        // The create ack carries ids only; fills arrive on the
        // private order stream.
        Ok(OrderAck {
            exchange_order_id: result.order_id,
            client_order_id: Some(result.order_link_id),
            status: OrderStatus::New,
            executed_qty: Qty::ZERO,
            cumulative_quote: Decimal::ZERO,
        })
    }

    async fn cancel_all(&self, symbol: &str) -> Result<u32> {
        #[derive(Serialize)]
        struct CancelAllRequest<'a> {
            category: &'a str,
            symbol: &'a str,
        }

        let result: CancelAllResult = self
            .signed_post(
                "/v5/order/cancel-all",
                &CancelAllRequest {
                    category: "spot",
                    symbol,
                },
            )
            .await?;
        Ok(result.list.map(|l| l.len() as u32).unwrap_or(0))
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules> {
        let query = format!("category=spot&symbol={symbol}");
        let result: InstrumentsResult = self
            .signed_get("/v5/market/instruments-info", &query)
            .await?;

        let instrument = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;

        Ok(SymbolRules {
            qty_step: Qty::new(instrument.lot_size_filter.base_precision),
            price_tick: Price::new(instrument.price_filter.tick_size),
            min_notional: instrument
                .lot_size_filter
                .min_order_amt
                .unwrap_or(Decimal::ZERO),
        })
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// v5 signature: HMAC-SHA256 over `{ts}{api_key}{recv_window}{payload}`.
fn sign_request(secret: &str, ts: u64, api_key: &str, recv_window_ms: u64, payload: &str) -> String {
    let material = format!("{ts}{api_key}{recv_window_ms}{payload}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(material.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Unwrap the retCode envelope, mapping venue rejections.
///
/// The result payload is only typed after the envelope checks out:
/// error responses carry `"result": {}` which would not deserialize
/// into the success shape.
async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await?;

    if status.as_u16() == 429 {
        return Err(ExchangeError::RateLimited(body));
    }
    if status.is_server_error() {
        return Err(ExchangeError::Unavailable {
            status: status.as_u16(),
            body,
        });
    }

    let envelope: Envelope = serde_json::from_str(&body)
        .map_err(|e| ExchangeError::Parse(format!("bad envelope: {e}")))?;

    if envelope.ret_code != 0 {
        return Err(map_ret_code(envelope.ret_code, envelope.ret_msg));
    }
    let result = envelope
        .result
        .ok_or_else(|| ExchangeError::Parse("envelope missing result".into()))?;
    serde_json::from_value(result)
        .map_err(|e| ExchangeError::Parse(format!("bad result payload: {e}")))
}

/// Bybit retCodes that need dedicated handling upstream.
fn map_ret_code(code: i64, msg: String) -> ExchangeError {
    match code {
        110007 | 170131 => ExchangeError::InsufficientBalance(msg),
        10001 => ExchangeError::InvalidSymbol(msg),
        170140 | 170136 => ExchangeError::NotionalTooSmall(msg),
        10006 | 10018 => ExchangeError::RateLimited(msg),
        10003 | 10004 | 10005 | 33004 => ExchangeError::Auth(msg),
        _ => ExchangeError::Api { code, message: msg },
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WalletBalanceResult {
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
struct WalletCoin {
    coin: String,
    #[serde(rename = "walletBalance", with = "rust_decimal::serde::str")]
    wallet_balance: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    locked: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderRequest {
    category: &'static str,
    symbol: String,
    side: &'static str,
    order_type: &'static str,
    qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<&'static str>,
    /// Base-denominated market sells; without this Bybit reads spot
    /// market quantities as quote amounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    market_unit: Option<&'static str>,
    order_link_id: String,
}

impl CreateOrderRequest {
    fn from_order(order: &NewOrder) -> Self {
        let side = match order.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };

        match order.order_type {
            OrderType::Limit => Self {
                category: "spot",
                symbol: order.symbol.clone(),
                side,
                order_type: "Limit",
                qty: order.qty.inner().normalize().to_string(),
                price: order.price.map(|p| p.inner().normalize().to_string()),
                time_in_force: Some("GTC"),
                market_unit: None,
                order_link_id: order.client_order_id.to_string(),
            },
            OrderType::Market => Self {
                category: "spot",
                symbol: order.symbol.clone(),
                side,
                order_type: "Market",
                qty: order.qty.inner().normalize().to_string(),
                price: None,
                time_in_force: None,
                market_unit: Some("baseCoin"),
                order_link_id: order.client_order_id.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderLinkId")]
    order_link_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelAllResult {
    #[serde(default)]
    list: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "basePrecision", with = "rust_decimal::serde::str")]
    base_precision: Decimal,
    #[serde(default, rename = "minOrderAmt", with = "rust_decimal::serde::str_option")]
    min_order_amt: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize", with = "rust_decimal::serde::str")]
    tick_size: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripcord_core::{ClientOrderId, TimeInForce};
    use rust_decimal_macros::dec;

    #[test]
    fn test_sign_request_is_deterministic() {
        let a = sign_request("secret", 1700000000000, "key", 5000, "accountType=UNIFIED");
        let b = sign_request("secret", 1700000000000, "key", 5000, "accountType=UNIFIED");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_request_varies_with_payload() {
        let a = sign_request("secret", 1700000000000, "key", 5000, "payload-a");
        let b = sign_request("secret", 1700000000000, "key", 5000, "payload-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_ret_code() {
        assert!(matches!(
            map_ret_code(170131, "insufficient".into()),
            ExchangeError::InsufficientBalance(_)
        ));
        assert!(matches!(
            map_ret_code(10001, "symbol invalid".into()),
            ExchangeError::InvalidSymbol(_)
        ));
        assert!(matches!(
            map_ret_code(170140, "too small".into()),
            ExchangeError::NotionalTooSmall(_)
        ));
        assert!(matches!(
            map_ret_code(10006, "limited".into()),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(
            map_ret_code(10004, "sign".into()),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            map_ret_code(999, "other".into()),
            ExchangeError::Api { code: 999, .. }
        ));
    }

    #[test]
    fn test_market_sell_request_shape() {
        let order = NewOrder {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            qty: Qty::new(dec!(0.250)),
            price: None,
            tif: TimeInForce::GoodTilCancelled,
            client_order_id: ClientOrderId::from_string("rip_t_3".into()),
        };

        let body = serde_json::to_value(CreateOrderRequest::from_order(&order)).unwrap();
        assert_eq!(body["category"], "spot");
        assert_eq!(body["side"], "Sell");
        assert_eq!(body["orderType"], "Market");
        assert_eq!(body["qty"], "0.25");
        assert_eq!(body["marketUnit"], "baseCoin");
        assert!(body.get("price").is_none());
        assert!(body.get("timeInForce").is_none());
    }

    #[test]
    fn test_limit_sell_request_shape() {
        let order = NewOrder {
            symbol: "ETHUSDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            qty: Qty::new(dec!(1.5)),
            price: Some(Price::new(dec!(3200.50))),
            tif: TimeInForce::GoodTilCancelled,
            client_order_id: ClientOrderId::from_string("rip_t_4".into()),
        };

        let body = serde_json::to_value(CreateOrderRequest::from_order(&order)).unwrap();
        assert_eq!(body["orderType"], "Limit");
        assert_eq!(body["price"], "3200.5");
        assert_eq!(body["timeInForce"], "GTC");
        assert!(body.get("marketUnit").is_none());
    }

    #[test]
    fn test_envelope_error_short_circuits() {
        // Error envelopes carry an empty result object; the code and
        // message must still come through.
        let raw = r#"{"retCode":170131,"retMsg":"Insufficient balance","result":{}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, 170131);
        assert_eq!(envelope.ret_msg, "Insufficient balance");
    }

    #[test]
    fn test_instruments_parse() {
        let raw = r#"{
            "list": [{
                "symbol": "BTCUSDT",
                "lotSizeFilter": {"basePrecision": "0.000001", "minOrderQty": "0.000048", "minOrderAmt": "1"},
                "priceFilter": {"tickSize": "0.01"}
            }]
        }"#;

        let result: InstrumentsResult = serde_json::from_str(raw).unwrap();
        let instrument = &result.list[0];
        assert_eq!(instrument.lot_size_filter.base_precision, dec!(0.000001));
        assert_eq!(instrument.price_filter.tick_size, dec!(0.01));
        assert_eq!(instrument.lot_size_filter.min_order_amt, Some(dec!(1)));
    }

    #[test]
    fn test_wallet_balance_parse() {
        let raw = r#"{
            "list": [{
                "accountType": "UNIFIED",
                "coin": [
                    {"coin": "BTC", "walletBalance": "0.5", "locked": "0.1"},
                    {"coin": "USDT", "walletBalance": "1000"}
                ]
            }]
        }"#;

        let result: WalletBalanceResult = serde_json::from_str(raw).unwrap();
        let coins = &result.list[0].coin;
        assert_eq!(coins[0].wallet_balance, dec!(0.5));
        assert_eq!(coins[0].locked, Some(dec!(0.1)));
        assert_eq!(coins[1].locked, None);
    }
}
