//! CLOB REST client: order submission, cancellation, open orders, balance.
//!
//! Every authenticated call carries the L2 header set: address, api key,
//! timestamp, passphrase, and an HMAC-SHA256 signature (URL-safe base64)
//! over `timestamp || method || path || body`, keyed by the URL-safe-base64
//! decoded api secret.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::signing::SignedOrder;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failures, timeouts and 5xx responses; retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// 4xx rejections; not retryable.
    #[error("Order rejected ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Time-in-force for submitted orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Gtc,
    Gtd,
    Fok,
    Fak,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Gtc => "GTC",
            OrderType::Gtd => "GTD",
            OrderType::Fok => "FOK",
            OrderType::Fak => "FAK",
        }
    }
}

/// L2 API credentials.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// POST /order payload.
#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    order: &'a SignedOrder,
    owner: &'a str,
    #[serde(rename = "orderType")]
    order_type: &'a str,
    #[serde(rename = "postOnly", skip_serializing_if = "std::ops::Not::not")]
    post_only: bool,
}

/// Response from the order endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id", default)]
    pub order_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    pub error_msg: Option<String>,
    #[serde(rename = "makingAmount", default)]
    pub making_amount: Option<String>,
    #[serde(rename = "takingAmount", default)]
    pub taking_amount: Option<String>,
}

impl OrderAck {
    /// Matched at submission time.
    pub fn is_filled(&self) -> bool {
        matches!(self.status.as_deref(), Some("matched") | Some("delayed"))
    }

    /// Resting on the book, waiting for a counterparty.
    pub fn is_live(&self) -> bool {
        self.status.as_deref() == Some("live")
    }
}

/// One open order from GET /orders.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveOrder {
    #[serde(rename = "id", alias = "orderID", alias = "order_id")]
    pub order_id: String,
    #[serde(rename = "asset_id", alias = "tokenID", default)]
    pub token_id: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(rename = "size_matched", default)]
    pub size_matched: Option<String>,
}

/// Balance response, 6-decimal fixed point.
#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    balance: String,
}

/// Authenticated CLOB REST client.
pub struct ClobRestClient {
    client: Client,
    host: String,
    creds: ExchangeCredentials,
    /// Wallet address for the POLY_ADDRESS header.
    address: String,
}

impl std::fmt::Debug for ClobRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobRestClient")
            .field("host", &self.host)
            .field("address", &self.address)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl ClobRestClient {
    pub fn new(
        host: &str,
        creds: ExchangeCredentials,
        address: String,
        request_timeout_sec: u64,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_sec))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            creds,
            address,
        })
    }

    /// HMAC signature over `timestamp || method || path || body`.
    fn sign_request(
        &self,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
    ) -> Result<String, ExchangeError> {
        let message = format!("{timestamp}{method}{path}{body}");

        // Secrets come base64-encoded; accept both URL-safe and standard
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .map_err(|_| ExchangeError::Auth("failed to decode api secret".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| ExchangeError::Auth(format!("HMAC key error: {e}")))?;
        mac.update(message.as_bytes());

        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// Build the L2 auth header set for one request.
    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(&'static str, String)>, ExchangeError> {
        // Timestamp in seconds, not milliseconds
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;

        Ok(vec![
            ("POLY_ADDRESS", self.address.clone()),
            ("POLY_API_KEY", self.creds.api_key.clone()),
            ("POLY_SIGNATURE", signature),
            ("POLY_TIMESTAMP", timestamp.to_string()),
            ("POLY_PASSPHRASE", self.creds.passphrase.clone()),
        ])
    }

    async fn send_authed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(u16, String), ExchangeError> {
        let body_str = body.clone().unwrap_or_default();
        let headers = self.auth_headers(method.as_str(), path, &body_str)?;
        let url = format!("{}{}", self.host, path);

        let mut request = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(ExchangeError::Transport(format!(
                "server error {status}: {text}"
            )));
        }
        if status.is_client_error() {
            return Err(ExchangeError::Permanent {
                status: status.as_u16(),
                message: text,
            });
        }

        Ok((status.as_u16(), text))
    }

    /// Submit a signed order.
    pub async fn post_order(
        &self,
        order: &SignedOrder,
        order_type: OrderType,
        post_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let payload = OrderPayload {
            order,
            owner: &self.creds.api_key,
            order_type: order_type.as_str(),
            post_only,
        };
        let body =
            serde_json::to_string(&payload).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        debug!(token_id = %order.token_id, side = %order.side, "submitting order");

        let (_, text) = self
            .send_authed(reqwest::Method::POST, "/order", Some(body))
            .await?;

        let ack: OrderAck =
            serde_json::from_str(&text).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        if let Some(ref msg) = ack.error_msg {
            if !msg.is_empty() {
                return Err(ExchangeError::Permanent {
                    status: 200,
                    message: msg.clone(),
                });
            }
        }

        Ok(ack)
    }

    /// Cancel one order.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        self.send_authed(reqwest::Method::DELETE, "/order", Some(body))
            .await?;
        Ok(())
    }

    /// Cancel every open order for this account.
    pub async fn cancel_all(&self) -> Result<(), ExchangeError> {
        self.send_authed(reqwest::Method::DELETE, "/cancel-all", None)
            .await?;
        Ok(())
    }

    /// List orders currently live on the book.
    pub async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
        let (_, text) = self
            .send_authed(reqwest::Method::GET, "/orders?status=live", None)
            .await?;

        serde_json::from_str(&text).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    /// Collateral balance in USDC.
    pub async fn balance(&self) -> Result<Decimal, ExchangeError> {
        let (_, text) = self
            .send_authed(
                reqwest::Method::GET,
                "/balance-allowance?asset_type=COLLATERAL",
                None,
            )
            .await?;

        let parsed: BalanceResponse =
            serde_json::from_str(&text).map_err(|e| ExchangeError::Parse(e.to_string()))?;

        let raw: Decimal = parsed.balance.parse().unwrap_or_else(|_| {
            warn!("could not parse balance response: {}", text);
            Decimal::ZERO
        });

        // Balance comes back in 6-decimal fixed point
        Ok(raw / Decimal::from(1_000_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{OrderArgs, OrderSide, OrderSigner};
    use rust_decimal_macros::dec;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

    fn client() -> ClobRestClient {
        ClobRestClient::new(
            "https://clob.example.com",
            ExchangeCredentials {
                api_key: "key-1".to_string(),
                secret: URL_SAFE.encode(b"super-secret-hmac-key"),
                passphrase: "phrase".to_string(),
            },
            "0x1111111111111111111111111111111111111111".to_string(),
            30,
        )
        .unwrap()
    }

    #[test]
    fn test_sign_request_deterministic() {
        let client = client();
        let a = client.sign_request("POST", "/order", "{}", 1_754_000_000).unwrap();
        let b = client.sign_request("POST", "/order", "{}", 1_754_000_000).unwrap();
        assert_eq!(a, b);

        // HMAC-SHA256 digest is 32 bytes under the URL-safe alphabet
        let decoded = URL_SAFE.decode(&a).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_sign_request_varies_with_inputs() {
        let client = client();
        let base = client.sign_request("POST", "/order", "{}", 1_754_000_000).unwrap();
        assert_ne!(
            base,
            client.sign_request("POST", "/order", "{}", 1_754_000_001).unwrap()
        );
        assert_ne!(
            base,
            client.sign_request("DELETE", "/order", "{}", 1_754_000_000).unwrap()
        );
        assert_ne!(
            base,
            client.sign_request("POST", "/order", "{\"a\":1}", 1_754_000_000).unwrap()
        );
    }

    #[test]
    fn test_auth_header_set() {
        let client = client();
        let headers = client.auth_headers("GET", "/orders?status=live", "").unwrap();
        let names: Vec<&str> = headers.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            names,
            vec![
                "POLY_ADDRESS",
                "POLY_API_KEY",
                "POLY_SIGNATURE",
                "POLY_TIMESTAMP",
                "POLY_PASSPHRASE"
            ]
        );
    }

    #[test]
    fn test_order_payload_shape() {
        let signer = OrderSigner::new(TEST_KEY, TEST_EXCHANGE).unwrap();
        let order = signer
            .sign_order(
                &OrderArgs {
                    token_id: "777".to_string(),
                    price: dec!(0.42),
                    shares: dec!(5),
                    side: OrderSide::Buy,
                    expiration: 0,
                },
                7,
            )
            .unwrap();

        let payload = OrderPayload {
            order: &order,
            owner: "key-1",
            order_type: OrderType::Fak.as_str(),
            post_only: false,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"orderType\":\"FAK\""));
        assert!(json.contains("\"owner\":\"key-1\""));
        assert!(json.contains("\"tokenID\":\"777\""));
        assert!(json.contains("\"makerAmount\":\"2100000\""));
        // postOnly omitted when false
        assert!(!json.contains("postOnly"));
    }

    #[test]
    fn test_order_ack_status_helpers() {
        let matched: OrderAck =
            serde_json::from_str(r#"{"orderID": "o1", "status": "matched"}"#).unwrap();
        assert!(matched.is_filled());
        assert!(!matched.is_live());

        let live: OrderAck =
            serde_json::from_str(r#"{"orderID": "o2", "status": "live"}"#).unwrap();
        assert!(live.is_live());
        assert!(!live.is_filled());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Transport("timeout".to_string()).is_transient());
        assert!(!ExchangeError::Permanent {
            status: 400,
            message: "bad order".to_string()
        }
        .is_transient());
    }
}
