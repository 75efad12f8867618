//! Caller-facing transaction intents.
//!
//! Amounts are decimal strings in display units ("1.5" ETH, "0.25" USDC);
//! they are converted to base units once the decimals are known.

use ethers::types::U256;
use ethers::utils::parse_units;
use serde::{Deserialize, Serialize};

use crate::core::chain::FeeParams;
use crate::core::errors::{SignerError, SignerResult};

/// What the caller wants to happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentKind {
    NativeTransfer {
        to: String,
        amount: String,
    },
    FungibleTokenTransfer {
        /// ERC-20 contract or SPL mint
        token: String,
        to: String,
        amount: String,
        /// Skips the metadata lookup when set
        #[serde(default)]
        decimals: Option<u8>,
        /// Solana only: create the recipient's associated token account if missing
        #[serde(default)]
        create_recipient_account: bool,
    },
    FungibleTokenApprove {
        token: String,
        spender: String,
        amount: String,
        #[serde(default)]
        decimals: Option<u8>,
    },
    ContractCall {
        contract: String,
        method: String,
        #[serde(default)]
        args: Vec<String>,
        /// JSON ABI; fetched from chain state when absent
        #[serde(default)]
        abi: Option<String>,
        /// Native value attached to the call, in display units
        #[serde(default)]
        value: Option<String>,
    },
}

impl IntentKind {
    pub fn name(&self) -> &'static str {
        match self {
            IntentKind::NativeTransfer { .. } => "native_transfer",
            IntentKind::FungibleTokenTransfer { .. } => "fungible_token_transfer",
            IntentKind::FungibleTokenApprove { .. } => "fungible_token_approve",
            IntentKind::ContractCall { .. } => "contract_call",
        }
    }
}

/// Caller-supplied values used verbatim instead of live chain state.
///
/// A nonce override is the caller's responsibility: it is not checked
/// against the pending transaction count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub fee: Option<FeeParams>,
    /// Gas limit (EVM) or compute unit limit (Solana)
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedIntent {
    /// Network key from the registry
    pub network: String,
    #[serde(flatten)]
    pub kind: IntentKind,
    #[serde(default)]
    pub overrides: Overrides,
    /// Solana memo instruction
    #[serde(default)]
    pub memo: Option<String>,
}

impl UnsignedIntent {
    pub fn new(network: impl Into<String>, kind: IntentKind) -> Self {
        Self {
            network: network.into(),
            kind,
            overrides: Overrides::default(),
            memo: None,
        }
    }

    pub fn native_transfer(
        network: impl Into<String>,
        to: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self::new(
            network,
            IntentKind::NativeTransfer {
                to: to.into(),
                amount: amount.into(),
            },
        )
    }

    pub fn token_transfer(
        network: impl Into<String>,
        token: impl Into<String>,
        to: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self::new(
            network,
            IntentKind::FungibleTokenTransfer {
                token: token.into(),
                to: to.into(),
                amount: amount.into(),
                decimals: None,
                create_recipient_account: false,
            },
        )
    }

    pub fn token_approve(
        network: impl Into<String>,
        token: impl Into<String>,
        spender: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self::new(
            network,
            IntentKind::FungibleTokenApprove {
                token: token.into(),
                spender: spender.into(),
                amount: amount.into(),
                decimals: None,
            },
        )
    }

    pub fn contract_call(
        network: impl Into<String>,
        contract: impl Into<String>,
        method: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self::new(
            network,
            IntentKind::ContractCall {
                contract: contract.into(),
                method: method.into(),
                args,
                abi: None,
                value: None,
            },
        )
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.overrides.nonce = Some(nonce);
        self
    }

    pub fn with_fee(mut self, fee: FeeParams) -> Self {
        self.overrides.fee = Some(fee);
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.overrides.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Sets token decimals on token intents; no-op otherwise.
    pub fn with_decimals(mut self, value: u8) -> Self {
        match &mut self.kind {
            IntentKind::FungibleTokenTransfer { decimals, .. }
            | IntentKind::FungibleTokenApprove { decimals, .. } => *decimals = Some(value),
            _ => {}
        }
        self
    }

    /// Requests creation of a missing recipient token account; no-op for other kinds.
    pub fn with_create_recipient_account(mut self) -> Self {
        if let IntentKind::FungibleTokenTransfer {
            create_recipient_account,
            ..
        } = &mut self.kind
        {
            *create_recipient_account = true;
        }
        self
    }

    pub fn with_abi(mut self, abi_json: impl Into<String>) -> Self {
        if let IntentKind::ContractCall { abi, .. } = &mut self.kind {
            *abi = Some(abi_json.into());
        }
        self
    }

    pub fn with_value(mut self, amount: impl Into<String>) -> Self {
        if let IntentKind::ContractCall { value, .. } = &mut self.kind {
            *value = Some(amount.into());
        }
        self
    }
}

/// Converts a display-unit decimal string into base units.
pub fn parse_amount(amount: &str, decimals: u8) -> SignerResult<U256> {
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(SignerError::invalid_intent("amount is empty"));
    }
    if trimmed.starts_with('-') {
        return Err(SignerError::invalid_intent(format!("amount '{}' is negative", amount)));
    }
    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.len() > decimals as usize {
            return Err(SignerError::invalid_intent(format!(
                "amount '{}' has more than {} decimal places",
                amount, decimals
            )));
        }
    }
    parse_units(trimmed, decimals as u32)
        .map(Into::into)
        .map_err(|e| SignerError::invalid_intent(format!("invalid amount '{}': {}", amount, e)))
}

/// Same as [`parse_amount`] for chains whose base units fit in a u64.
pub fn parse_amount_u64(amount: &str, decimals: u8) -> SignerResult<u64> {
    let value = parse_amount(amount, decimals)?;
    if value > U256::from(u64::MAX) {
        return Err(SignerError::invalid_intent(format!("amount '{}' is too large", amount)));
    }
    Ok(value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1", 18, "1000000000000000000" ; "whole ether")]
    #[test_case("0.999999", 18, "999999000000000000" ; "fractional ether")]
    #[test_case("0.000021", 18, "21000000000000" ; "gas sized")]
    #[test_case("2.5", 6, "2500000" ; "usdc")]
    #[test_case("0", 9, "0" ; "zero")]
    fn test_parse_amount(amount: &str, decimals: u8, expected: &str) {
        assert_eq!(parse_amount(amount, decimals).unwrap(), U256::from_dec_str(expected).unwrap());
    }

    #[test_case("" ; "empty")]
    #[test_case("-1" ; "negative")]
    #[test_case("abc" ; "garbage")]
    #[test_case("0.0000001" ; "too precise")]
    fn test_parse_amount_rejects(amount: &str) {
        let err = parse_amount(amount, 6).unwrap_err();
        assert!(matches!(err, SignerError::InvalidIntent { .. }));
    }

    #[test]
    fn test_parse_amount_u64_overflow() {
        assert!(parse_amount_u64("18446744073709551616", 0).is_err());
        assert_eq!(parse_amount_u64("1.5", 9).unwrap(), 1_500_000_000);
    }

    #[test]
    fn test_intent_json_shape() {
        let intent = UnsignedIntent::token_transfer("solana", "Mint111", "Owner222", "1.5")
            .with_decimals(6)
            .with_create_recipient_account()
            .with_memo("invoice 7");
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["type"], "fungible_token_transfer");
        assert_eq!(json["create_recipient_account"], true);
        assert_eq!(json["decimals"], 6);

        let back: UnsignedIntent = serde_json::from_value(json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn test_builders_ignore_unrelated_kinds() {
        let intent = UnsignedIntent::native_transfer("ethereum", "0x00", "1")
            .with_decimals(6)
            .with_abi("[]")
            .with_nonce(3);
        assert_eq!(
            intent.kind,
            IntentKind::NativeTransfer { to: "0x00".to_string(), amount: "1".to_string() }
        );
        assert_eq!(intent.overrides.nonce, Some(3));
    }
}
