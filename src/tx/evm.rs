//! EVM transaction assembly.

use async_trait::async_trait;
use ethers::abi::Address;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};
use ethers::utils::{format_units, to_checksum};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::blockchain::traits::{ChainStatePort, EstimateRequest};
use crate::core::abi::{
    encode_address_amount_call, encode_contract_call, parse_abi, ERC20_APPROVE, ERC20_TRANSFER,
};
use crate::core::chain::{ChainFamily, ChainProfile, FeeParams, NetworkRegistry};
use crate::core::errors::{BalanceShortfall, SignerError, SignerResult};
use crate::tx::fees::NonceFeeResolver;
use crate::tx::intent::{parse_amount, IntentKind, UnsignedIntent};
use crate::tx::prepared::{ExecutionLimit, PreparedTransaction, TxBody};
use crate::tx::TransactionAssembler;

/// Gas used by a plain value transfer to an externally owned account.
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Parses a 0x address; mixed-case input must carry a valid EIP-55 checksum.
pub fn parse_evm_address(network: &str, address: &str) -> SignerResult<Address> {
    let invalid = |reason: &str| SignerError::invalid_address(network, address, reason);

    let hex_part = address
        .strip_prefix("0x")
        .ok_or_else(|| invalid("missing 0x prefix"))?;
    if hex_part.len() != 40 {
        return Err(invalid("expected 20 bytes (40 hex characters)"));
    }
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("contains non-hex characters"));
    }
    let parsed = Address::from_str(hex_part).map_err(|e| invalid(&e.to_string()))?;

    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && to_checksum(&parsed, None) != address {
        return Err(invalid("EIP-55 checksum mismatch"));
    }
    Ok(parsed)
}

fn display_units(value: U256, decimals: u8) -> String {
    format_units(value, decimals as u32).unwrap_or_else(|_| value.to_string())
}

/// What the intent resolves to before chain state is consulted.
struct CallPlan {
    to: Address,
    value: U256,
    data: Vec<u8>,
    fixed_gas: Option<u64>,
}

pub struct EvmAssembler {
    chain_state: Arc<dyn ChainStatePort>,
    resolver: NonceFeeResolver,
    registry: Arc<NetworkRegistry>,
}

impl EvmAssembler {
    pub fn new(
        chain_state: Arc<dyn ChainStatePort>,
        resolver: NonceFeeResolver,
        registry: Arc<NetworkRegistry>,
    ) -> Self {
        Self {
            chain_state,
            resolver,
            registry,
        }
    }

    async fn token_decimals(
        &self,
        profile: &ChainProfile,
        token: &str,
        decimals: Option<u8>,
    ) -> SignerResult<u8> {
        match decimals {
            Some(d) => Ok(d),
            None => self.chain_state.get_token_decimals(&profile.key, token).await,
        }
    }

    async fn plan(&self, profile: &ChainProfile, kind: &IntentKind) -> SignerResult<CallPlan> {
        let network = profile.key.as_str();
        match kind {
            IntentKind::NativeTransfer { to, amount } => Ok(CallPlan {
                to: parse_evm_address(network, to)?,
                value: parse_amount(amount, profile.native_decimals)?,
                data: Vec::new(),
                fixed_gas: Some(NATIVE_TRANSFER_GAS),
            }),
            IntentKind::FungibleTokenTransfer {
                token,
                to,
                amount,
                decimals,
                ..
            } => {
                let token_address = parse_evm_address(network, token)?;
                let recipient = parse_evm_address(network, to)?;
                let decimals = self.token_decimals(profile, token, *decimals).await?;
                let units = parse_amount(amount, decimals)?;
                Ok(CallPlan {
                    to: token_address,
                    value: U256::zero(),
                    data: encode_address_amount_call(ERC20_TRANSFER, recipient, units),
                    fixed_gas: None,
                })
            }
            IntentKind::FungibleTokenApprove {
                token,
                spender,
                amount,
                decimals,
            } => {
                let token_address = parse_evm_address(network, token)?;
                let spender = parse_evm_address(network, spender)?;
                let decimals = self.token_decimals(profile, token, *decimals).await?;
                let units = parse_amount(amount, decimals)?;
                Ok(CallPlan {
                    to: token_address,
                    value: U256::zero(),
                    data: encode_address_amount_call(ERC20_APPROVE, spender, units),
                    fixed_gas: None,
                })
            }
            IntentKind::ContractCall {
                contract,
                method,
                args,
                abi,
                value,
            } => {
                let contract_address = parse_evm_address(network, contract)?;
                let abi_json = match abi {
                    Some(json) => json.clone(),
                    None => self
                        .chain_state
                        .get_abi(network, contract)
                        .await?
                        .ok_or_else(|| SignerError::MethodNotFound {
                            contract: contract.clone(),
                            method: method.clone(),
                        })?,
                };
                let abi = parse_abi(contract, &abi_json)?;
                let data = encode_contract_call(&abi, contract, method, args)?;
                let value = match value {
                    Some(v) => parse_amount(v, profile.native_decimals)?,
                    None => U256::zero(),
                };
                Ok(CallPlan {
                    to: contract_address,
                    value,
                    data,
                    fixed_gas: None,
                })
            }
        }
    }

    /// `balance >= value + gas_limit * fee_ceiling`, distinguishing which part is short.
    async fn check_balance(
        &self,
        profile: &ChainProfile,
        from: &str,
        value: U256,
        gas_limit: u64,
        fee: &FeeParams,
    ) -> SignerResult<()> {
        let ceiling = fee.gas_price_ceiling().unwrap_or_default();
        let gas_cost = U256::from(gas_limit).saturating_mul(ceiling);
        let required = value.saturating_add(gas_cost);
        let balance = self.chain_state.get_balance(&profile.key, from).await?;

        let shortfall = if balance < value {
            Some(BalanceShortfall::Amount)
        } else if balance < required {
            Some(BalanceShortfall::Gas)
        } else {
            None
        };

        match shortfall {
            None => Ok(()),
            Some(shortfall) => Err(SignerError::InsufficientBalance {
                network: profile.key.clone(),
                address: from.to_string(),
                shortfall,
                required: display_units(required, profile.native_decimals),
                available: display_units(balance, profile.native_decimals),
            }),
        }
    }
}

fn build_transaction(
    profile: &ChainProfile,
    from: Address,
    plan: &CallPlan,
    nonce: u64,
    gas_limit: u64,
    fee: &FeeParams,
) -> SignerResult<TypedTransaction> {
    let chain_id = profile.chain_id().ok_or_else(|| SignerError::UnsupportedNetwork {
        network: profile.key.clone(),
    })?;

    let tx: TypedTransaction = match *fee {
        FeeParams::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(from)
            .to(plan.to)
            .value(plan.value)
            .data(plan.data.clone())
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
        FeeParams::Legacy { gas_price } => TransactionRequest::new()
            .from(from)
            .to(plan.to)
            .value(plan.value)
            .data(plan.data.clone())
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(chain_id)
            .into(),
        FeeParams::Solana { .. } => {
            return Err(SignerError::invalid_intent(format!(
                "Solana fee parameters on EVM network {}",
                profile.key
            )))
        }
    };
    Ok(tx)
}

#[async_trait]
impl TransactionAssembler for EvmAssembler {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    async fn craft(&self, intent: &UnsignedIntent, from: &str) -> SignerResult<PreparedTransaction> {
        let profile = self.registry.get(&intent.network)?;
        if profile.family != ChainFamily::Evm {
            return Err(SignerError::invalid_intent(format!(
                "{} is not an EVM network",
                profile.key
            )));
        }
        let sender = parse_evm_address(&profile.key, from)?;
        let from = to_checksum(&sender, None);

        let plan = self.plan(profile, &intent.kind).await?;

        let nonce = self
            .resolver
            .resolve_nonce(&from, profile, intent.overrides.nonce)
            .await?
            .unwrap_or_default();
        let resolved_fee = self.resolver.resolve_fee(profile, intent.overrides.fee).await?;

        let gas_limit = match (intent.overrides.gas_limit, plan.fixed_gas) {
            (Some(limit), _) => limit,
            (None, Some(fixed)) => fixed,
            (None, None) => {
                let request = EstimateRequest {
                    from: from.clone(),
                    to: Some(to_checksum(&plan.to, None)),
                    value: plan.value,
                    payload: plan.data.clone(),
                };
                self.resolver.resolve_gas_or_compute(profile, &request, None).await?
            }
        };

        self.check_balance(profile, &from, plan.value, gas_limit, &resolved_fee.fee)
            .await?;

        let tx = build_transaction(profile, sender, &plan, nonce, gas_limit, &resolved_fee.fee)?;
        let message = tx.rlp().to_vec();
        if message.len() > profile.max_message_bytes {
            return Err(SignerError::MessageTooLarge {
                network: profile.key.clone(),
                size: message.len(),
                limit: profile.max_message_bytes,
            });
        }

        let prepared = PreparedTransaction {
            network: profile.key.clone(),
            family: ChainFamily::Evm,
            kind: intent.kind.name(),
            from,
            to: to_checksum(&plan.to, None),
            value: plan.value,
            payload: plan.data,
            nonce: Some(nonce),
            fee: resolved_fee.fee,
            fee_estimated: resolved_fee.estimated,
            limit: ExecutionLimit::Gas(gas_limit),
            recent_blockhash: None,
            message,
            body: TxBody::Evm(tx),
        };
        debug!(
            network = %prepared.network,
            nonce,
            gas_limit,
            message_len = prepared.message.len(),
            digest = %prepared.message_digest(),
            "assembled EVM message"
        );
        info!(network = %prepared.network, kind = prepared.kind, from = %prepared.from, "✅ EVM transaction prepared");
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::mock::MockChainState;
    use test_case::test_case;

    const FROM: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";
    const TO: &str = "0x2222222222222222222222222222222222222222";
    const TOKEN: &str = "0x3333333333333333333333333333333333333333";

    fn eth() -> U256 {
        U256::exp10(18)
    }

    fn setup() -> (Arc<MockChainState>, EvmAssembler) {
        let mock = Arc::new(MockChainState::new());
        mock.set_fee(
            "ethereum",
            FeeParams::Eip1559 {
                max_fee_per_gas: U256::exp10(9),
                max_priority_fee_per_gas: U256::exp10(8),
            },
        );
        mock.set_fee("bsc", FeeParams::Legacy { gas_price: U256::exp10(9) });
        mock.set_balance("ethereum", FROM, eth() * U256::from(10u64));
        mock.set_balance("bsc", FROM, eth() * U256::from(10u64));
        let resolver = NonceFeeResolver::new(mock.clone(), 20);
        let assembler = EvmAssembler::new(mock.clone(), resolver, Arc::new(NetworkRegistry::builtin()));
        (mock, assembler)
    }

    #[test_case("0x2222222222222222222222222222222222222222" ; "lowercase")]
    #[test_case("0x9858EfFD232B4033E47d90003D41EC34EcaEda94" ; "checksummed")]
    fn test_valid_addresses(address: &str) {
        assert!(parse_evm_address("ethereum", address).is_ok());
    }

    #[test_case("2222222222222222222222222222222222222222" ; "no prefix")]
    #[test_case("0x22222222" ; "short")]
    #[test_case("0xzz22222222222222222222222222222222222222" ; "non hex")]
    #[test_case("0x9858efFD232B4033E47d90003D41EC34EcaEda94" ; "bad checksum")]
    fn test_invalid_addresses(address: &str) {
        let err = parse_evm_address("ethereum", address).unwrap_err();
        assert!(matches!(err, SignerError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_native_transfer_eip1559() {
        let (mock, assembler) = setup();
        mock.set_transaction_count("ethereum", FROM, 5);
        mock.set_block_height("ethereum", 19_000_000);

        let intent = UnsignedIntent::native_transfer("ethereum", TO, "1");
        let prepared = assembler.craft(&intent, FROM).await.unwrap();

        assert_eq!(prepared.nonce, Some(5));
        assert_eq!(prepared.value, eth());
        assert!(prepared.payload.is_empty());
        assert_eq!(prepared.limit, ExecutionLimit::Gas(21_000));
        assert_eq!(prepared.message_bytes()[0], 0x02);
        assert!(matches!(prepared.evm_transaction(), Some(TypedTransaction::Eip1559(_))));
        assert!(!prepared.fee_estimated);
    }

    #[tokio::test]
    async fn test_legacy_shape_on_legacy_network() {
        let (_mock, assembler) = setup();
        let intent = UnsignedIntent::native_transfer("bsc", TO, "0.5");
        let prepared = assembler.craft(&intent, FROM).await.unwrap();
        assert!(matches!(prepared.evm_transaction(), Some(TypedTransaction::Legacy(_))));
        assert!(matches!(prepared.fee, FeeParams::Legacy { .. }));
    }

    #[tokio::test]
    async fn test_token_transfer_uses_metadata_decimals() {
        let (mock, assembler) = setup();
        mock.set_token_decimals("ethereum", TOKEN, 6);

        let intent = UnsignedIntent::token_transfer("ethereum", TOKEN, TO, "2.5");
        let prepared = assembler.craft(&intent, FROM).await.unwrap();

        assert_eq!(prepared.value, U256::zero());
        assert_eq!(prepared.to.to_lowercase(), TOKEN);
        assert_eq!(&prepared.payload[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(U256::from_big_endian(&prepared.payload[36..68]), U256::from(2_500_000u64));
        // 60_000 mock estimate + 20%
        assert_eq!(prepared.limit, ExecutionLimit::Gas(72_000));
    }

    #[tokio::test]
    async fn test_approve_with_decimals_override_skips_lookup() {
        let (mock, assembler) = setup();
        let intent = UnsignedIntent::token_approve("ethereum", TOKEN, TO, "100").with_decimals(18);
        let prepared = assembler.craft(&intent, FROM).await.unwrap();
        assert_eq!(&prepared.payload[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(mock.calls("get_token_decimals"), 0);
    }

    #[tokio::test]
    async fn test_contract_call_without_abi_is_method_not_found() {
        let (_mock, assembler) = setup();
        let intent = UnsignedIntent::contract_call("ethereum", TOKEN, "mint", vec![]);
        let err = assembler.craft(&intent, FROM).await.unwrap_err();
        assert!(matches!(err, SignerError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_contract_call_with_fetched_abi() {
        let (mock, assembler) = setup();
        mock.set_abi(
            "ethereum",
            TOKEN,
            r#"[{"type":"function","name":"setValue","stateMutability":"payable",
                "inputs":[{"name":"v","type":"uint256"}],"outputs":[]}]"#,
        );
        let intent = UnsignedIntent::contract_call("ethereum", TOKEN, "setValue", vec!["7".to_string()])
            .with_value("0.1");
        let prepared = assembler.craft(&intent, FROM).await.unwrap();
        assert_eq!(prepared.payload.len(), 4 + 32);
        assert_eq!(prepared.value, U256::exp10(17));

        let missing = UnsignedIntent::contract_call("ethereum", TOKEN, "getValue", vec![]);
        let err = assembler.craft(&missing, FROM).await.unwrap_err();
        assert!(matches!(err, SignerError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let (_mock, assembler) = setup();
        let intent = UnsignedIntent::native_transfer("ethereum", "0x1234", "1");
        let err = assembler.craft(&intent, FROM).await.unwrap_err();
        assert!(matches!(err, SignerError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_amount_shortfall() {
        let (mock, assembler) = setup();
        mock.set_balance("ethereum", FROM, eth());
        let intent = UnsignedIntent::native_transfer("ethereum", TO, "2");
        let err = assembler.craft(&intent, FROM).await.unwrap_err();
        assert!(matches!(
            err,
            SignerError::InsufficientBalance { shortfall: BalanceShortfall::Amount, .. }
        ));
    }

    #[tokio::test]
    async fn test_fee_fallback_is_flagged() {
        let (mock, assembler) = setup();
        mock.fail_operation("get_fee_estimate");
        let intent = UnsignedIntent::native_transfer("ethereum", TO, "1");
        let prepared = assembler.craft(&intent, FROM).await.unwrap();
        assert!(prepared.fee_estimated);
    }

    #[tokio::test]
    async fn test_solana_network_rejected() {
        let (_mock, assembler) = setup();
        let intent = UnsignedIntent::native_transfer("solana", TO, "1");
        let err = assembler.craft(&intent, FROM).await.unwrap_err();
        assert!(matches!(err, SignerError::InvalidIntent { .. }));
    }
}
