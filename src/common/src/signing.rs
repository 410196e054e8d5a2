//! EIP-712 order construction and signing for the CTF Exchange.
//!
//! The domain and type strings are part of the venue contract and must be
//! bit-exact; they are compiled in here. Amounts follow the USDC 6-decimal
//! convention: for a BUY, makerAmount is collateral in and takerAmount is
//! shares out; a SELL swaps the two.

use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// EIP-712 domain name and version for the exchange.
const DOMAIN_NAME: &str = "Polymarket CTF Exchange";
const DOMAIN_VERSION: &str = "1";
/// Polygon mainnet.
const CHAIN_ID: u64 = 137;

/// USDC and share amounts are fixed-point with 6 decimals.
const AMOUNT_SCALE: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("Invalid private key")]
    InvalidKey,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid token id: {0}")]
    InvalidTokenId(String),

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("Signing failed: {0}")]
    SignatureError(String),
}

sol! {
    /// Canonical order record hashed under the exchange domain.
    struct Order {
        uint256 salt;
        address maker;
        address signer;
        address taker;
        uint256 tokenId;
        uint256 makerAmount;
        uint256 takerAmount;
        uint256 expiration;
        uint256 nonce;
        uint256 feeRateBps;
        uint8 side;
        uint8 signatureType;
    }
}

/// BUY = 0, SELL = 1 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_u8(&self) -> u8 {
        match self {
            OrderSide::Buy => 0,
            OrderSide::Sell => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Inputs for one order.
#[derive(Debug, Clone)]
pub struct OrderArgs {
    pub token_id: String,
    pub price: Decimal,
    pub shares: Decimal,
    pub side: OrderSide,
    /// Unix expiration, 0 for GTC.
    pub expiration: u64,
}

/// Signed order in wire form, ready to be wrapped into the REST payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    #[serde(rename = "tokenID")]
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub side: String,
    pub signature_type: u8,
    pub signature: String,
}

/// Scale a decimal amount to 6-decimal fixed point, flooring.
fn scale_amount(value: Decimal, what: &str) -> Result<U256, SignError> {
    if value < Decimal::ZERO {
        return Err(SignError::AmountOutOfRange(what.to_string()));
    }
    let scaled = (value * Decimal::from(AMOUNT_SCALE)).floor();
    let raw = scaled
        .to_u128()
        .ok_or_else(|| SignError::AmountOutOfRange(what.to_string()))?;
    Ok(U256::from(raw))
}

/// Maker/taker amounts for an order per the exchange convention.
pub fn order_amounts(
    side: OrderSide,
    price: Decimal,
    shares: Decimal,
) -> Result<(U256, U256), SignError> {
    let collateral = scale_amount(shares * price, "collateral")?;
    let outcome = scale_amount(shares, "shares")?;
    match side {
        OrderSide::Buy => Ok((collateral, outcome)),
        OrderSide::Sell => Ok((outcome, collateral)),
    }
}

/// Signs CTF-Exchange orders with a wallet key.
pub struct OrderSigner {
    signer: PrivateKeySigner,
    domain: Eip712Domain,
}

impl OrderSigner {
    /// Build a signer from a hex private key (with or without `0x`).
    pub fn new(private_key: &str, exchange_address: &str) -> Result<Self, SignError> {
        let key = if private_key.starts_with("0x") {
            private_key.to_string()
        } else {
            format!("0x{private_key}")
        };

        let signer = PrivateKeySigner::from_str(&key).map_err(|_| SignError::InvalidKey)?;
        let exchange = Address::from_str(exchange_address)
            .map_err(|_| SignError::InvalidAddress(exchange_address.to_string()))?;

        let domain = eip712_domain! {
            name: DOMAIN_NAME,
            version: DOMAIN_VERSION,
            chain_id: CHAIN_ID,
            verifying_contract: exchange,
        };

        Ok(Self { signer, domain })
    }

    /// The maker/signer address derived from the key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Hex address in wire form.
    pub fn address_hex(&self) -> String {
        format!("{:#x}", self.signer.address())
    }

    /// Build and sign an order. The salt is supplied by the caller so tests
    /// can pin it.
    pub fn sign_order(&self, args: &OrderArgs, salt: u64) -> Result<SignedOrder, SignError> {
        let token_id = U256::from_str_radix(&args.token_id, 10)
            .map_err(|_| SignError::InvalidTokenId(args.token_id.clone()))?;
        let (maker_amount, taker_amount) = order_amounts(args.side, args.price, args.shares)?;

        let maker = self.signer.address();
        let order = Order {
            salt: U256::from(salt),
            maker,
            signer: maker,
            taker: Address::ZERO,
            tokenId: token_id,
            makerAmount: maker_amount,
            takerAmount: taker_amount,
            expiration: U256::from(args.expiration),
            nonce: U256::ZERO,
            feeRateBps: U256::ZERO,
            side: args.side.as_u8(),
            signatureType: 0,
        };

        let digest: B256 = order.eip712_signing_hash(&self.domain);
        let sig = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| SignError::SignatureError(e.to_string()))?;

        // 65-byte signature with the recovery byte normalised to 27/28
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&sig.r().to_be_bytes::<32>());
        bytes[32..64].copy_from_slice(&sig.s().to_be_bytes::<32>());
        bytes[64] = 27 + sig.v() as u8;

        Ok(SignedOrder {
            salt,
            maker: format!("{maker:#x}"),
            signer: format!("{maker:#x}"),
            taker: format!("{:#x}", Address::ZERO),
            token_id: args.token_id.clone(),
            maker_amount: maker_amount.to_string(),
            taker_amount: taker_amount.to_string(),
            expiration: args.expiration.to_string(),
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            side: args.side.as_str().to_string(),
            signature_type: 0,
            signature: format!("0x{}", hex::encode(bytes)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Throwaway key, never funded.
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

    fn signer() -> OrderSigner {
        OrderSigner::new(TEST_KEY, TEST_EXCHANGE).unwrap()
    }

    fn args() -> OrderArgs {
        OrderArgs {
            token_id: "1234567890".to_string(),
            price: dec!(0.42),
            shares: dec!(5),
            side: OrderSide::Buy,
            expiration: 0,
        }
    }

    #[test]
    fn test_buy_amount_convention() {
        let (maker, taker) = order_amounts(OrderSide::Buy, dec!(0.42), dec!(5)).unwrap();
        // 5 * 0.42 = 2.10 USDC in, 5 shares out
        assert_eq!(maker, U256::from(2_100_000u64));
        assert_eq!(taker, U256::from(5_000_000u64));
    }

    #[test]
    fn test_sell_swaps_amounts() {
        let (maker, taker) = order_amounts(OrderSide::Sell, dec!(0.42), dec!(5)).unwrap();
        assert_eq!(maker, U256::from(5_000_000u64));
        assert_eq!(taker, U256::from(2_100_000u64));
    }

    #[test]
    fn test_amounts_floor() {
        // 3 * 0.333333333 = 0.999999999 -> floors to 999999 micro-USDC
        let (maker, _) = order_amounts(OrderSide::Buy, dec!(0.333333333), dec!(3)).unwrap();
        assert_eq!(maker, U256::from(999_999u64));
    }

    #[test]
    fn test_signature_is_deterministic_and_normalised() {
        let signer = signer();
        let a = signer.sign_order(&args(), 42).unwrap();
        let b = signer.sign_order(&args(), 42).unwrap();
        assert_eq!(a.signature, b.signature);

        // 0x + 65 bytes hex
        assert_eq!(a.signature.len(), 2 + 130);
        let raw = hex::decode(a.signature.trim_start_matches("0x")).unwrap();
        assert!(raw[64] == 27 || raw[64] == 28);
    }

    #[test]
    fn test_salt_changes_signature() {
        let signer = signer();
        let a = signer.sign_order(&args(), 1).unwrap();
        let b = signer.sign_order(&args(), 2).unwrap();
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_key_without_prefix_accepted() {
        let stripped = TEST_KEY.trim_start_matches("0x");
        let signer = OrderSigner::new(stripped, TEST_EXCHANGE).unwrap();
        assert_eq!(signer.address_hex(), signer.address_hex().to_lowercase());
    }

    #[test]
    fn test_bad_token_id_rejected() {
        let signer = signer();
        let mut bad = args();
        bad.token_id = "not-a-number".to_string();
        assert!(matches!(
            signer.sign_order(&bad, 1),
            Err(SignError::InvalidTokenId(_))
        ));
    }

    #[test]
    fn test_wire_side_encoding() {
        assert_eq!(OrderSide::Buy.as_u8(), 0);
        assert_eq!(OrderSide::Sell.as_u8(), 1);
        assert_eq!(OrderSide::Buy.as_str(), "BUY");
    }
}
