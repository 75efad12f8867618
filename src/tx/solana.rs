//! Solana transaction assembly.
//!
//! SPL token and memo instructions are encoded here directly from their
//! documented layouts so that only `solana-sdk` is needed.
#![allow(deprecated)]

use async_trait::async_trait;
use ethers::types::U256;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::Message;
use solana_sdk::packet::PACKET_DATA_SIZE;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{pubkey, system_instruction, system_program};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blockchain::traits::{ChainStatePort, EstimateRequest, RecentBlockhash};
use crate::core::chain::{ChainFamily, ChainProfile, FeeParams, NetworkRegistry};
use crate::core::config::AssemblyConfig;
use crate::core::errors::{BalanceShortfall, SignerError, SignerResult};
use crate::tx::fees::NonceFeeResolver;
use crate::tx::intent::{parse_amount_u64, IntentKind, UnsignedIntent};
use crate::tx::prepared::{ExecutionLimit, PreparedTransaction, TxBody};
use crate::tx::TransactionAssembler;

pub const TOKEN_PROGRAM_ID: Pubkey = pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");
pub const MEMO_PROGRAM_ID: Pubkey = pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

/// Rent-exempt minimum of a 165 byte SPL token account.
pub const TOKEN_ACCOUNT_RENT_LAMPORTS: u64 = 2_039_280;
/// Per-transaction compute unit cap.
pub const MAX_COMPUTE_UNIT_LIMIT: u64 = 1_400_000;

const SPL_TRANSFER_CHECKED: u8 = 12;
const SPL_APPROVE_CHECKED: u8 = 13;
const ATA_CREATE_IDEMPOTENT: u8 = 1;

/// Associated token account of `owner` for `mint` (classic token program).
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

pub fn parse_pubkey(network: &str, address: &str) -> SignerResult<Pubkey> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| SignerError::invalid_address(network, address, format!("not base58: {}", e)))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::invalid_address(network, address, format!("expected 32 bytes, got {}", b.len()))
    })?;
    Ok(Pubkey::new_from_array(bytes))
}

fn transfer_checked(
    source: &Pubkey,
    mint: &Pubkey,
    destination: &Pubkey,
    authority: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Instruction {
    let mut data = Vec::with_capacity(10);
    data.push(SPL_TRANSFER_CHECKED);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);
    Instruction::new_with_bytes(
        TOKEN_PROGRAM_ID,
        &data,
        vec![
            AccountMeta::new(*source, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new(*destination, false),
            AccountMeta::new_readonly(*authority, true),
        ],
    )
}

fn approve_checked(
    source: &Pubkey,
    mint: &Pubkey,
    delegate: &Pubkey,
    owner: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Instruction {
    let mut data = Vec::with_capacity(10);
    data.push(SPL_APPROVE_CHECKED);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);
    Instruction::new_with_bytes(
        TOKEN_PROGRAM_ID,
        &data,
        vec![
            AccountMeta::new(*source, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(*delegate, false),
            AccountMeta::new_readonly(*owner, true),
        ],
    )
}

fn create_associated_token_account(payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
    Instruction::new_with_bytes(
        ASSOCIATED_TOKEN_PROGRAM_ID,
        &[ATA_CREATE_IDEMPOTENT],
        vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(associated_token_address(owner, mint), false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
    )
}

fn memo(signer: &Pubkey, text: &str) -> Instruction {
    Instruction::new_with_bytes(
        MEMO_PROGRAM_ID,
        text.as_bytes(),
        vec![AccountMeta::new_readonly(*signer, true)],
    )
}

fn short_vec_len(n: usize) -> usize {
    match n {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        _ => 3,
    }
}

/// Rejects messages the device cannot sign or the network cannot carry.
pub fn check_message_size(
    profile: &ChainProfile,
    message_len: usize,
    num_signatures: usize,
) -> SignerResult<()> {
    if message_len > profile.max_message_bytes {
        return Err(SignerError::MessageTooLarge {
            network: profile.key.clone(),
            size: message_len,
            limit: profile.max_message_bytes,
        });
    }
    let transaction_len = short_vec_len(num_signatures) + 64 * num_signatures + message_len;
    if transaction_len > PACKET_DATA_SIZE {
        return Err(SignerError::MessageTooLarge {
            network: profile.key.clone(),
            size: transaction_len,
            limit: PACKET_DATA_SIZE,
        });
    }
    Ok(())
}

/// Instructions for the intent, before compute budget and memo.
struct InstructionPlan {
    instructions: Vec<Instruction>,
    to: String,
    /// Lamports leaving the payer as transfer value
    native_value: u64,
    /// Transferred base units reported on the prepared transaction
    reported_value: u64,
    /// Rent paid for accounts created by the transaction
    rent: u64,
}

pub struct SolanaAssembler {
    chain_state: Arc<dyn ChainStatePort>,
    resolver: NonceFeeResolver,
    registry: Arc<NetworkRegistry>,
    config: AssemblyConfig,
}

impl SolanaAssembler {
    pub fn new(
        chain_state: Arc<dyn ChainStatePort>,
        resolver: NonceFeeResolver,
        registry: Arc<NetworkRegistry>,
        config: AssemblyConfig,
    ) -> Self {
        Self {
            chain_state,
            resolver,
            registry,
            config,
        }
    }

    async fn token_decimals(
        &self,
        profile: &ChainProfile,
        mint: &str,
        decimals: Option<u8>,
    ) -> SignerResult<u8> {
        match decimals {
            Some(d) => Ok(d),
            None => self.chain_state.get_token_decimals(&profile.key, mint).await,
        }
    }

    /// Sender's token account; it must exist.
    async fn source_token_account(
        &self,
        profile: &ChainProfile,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> SignerResult<Pubkey> {
        let derived = associated_token_address(owner, mint);
        let info = self
            .chain_state
            .get_token_account(&profile.key, &owner.to_string(), &mint.to_string())
            .await?;
        if info.address != derived.to_string() {
            warn!(reported = %info.address, %derived, "chain state reported a different token account address");
        }
        if !info.exists {
            return Err(SignerError::SourceTokenAccountMissing {
                network: profile.key.clone(),
                owner: owner.to_string(),
                mint: mint.to_string(),
                token_account: derived.to_string(),
            });
        }
        Ok(derived)
    }

    async fn plan(
        &self,
        profile: &ChainProfile,
        payer: &Pubkey,
        kind: &IntentKind,
    ) -> SignerResult<InstructionPlan> {
        let network = profile.key.as_str();
        match kind {
            IntentKind::NativeTransfer { to, amount } => {
                let recipient = parse_pubkey(network, to)?;
                let lamports = parse_amount_u64(amount, profile.native_decimals)?;
                Ok(InstructionPlan {
                    instructions: vec![system_instruction::transfer(payer, &recipient, lamports)],
                    to: recipient.to_string(),
                    native_value: lamports,
                    reported_value: lamports,
                    rent: 0,
                })
            }
            IntentKind::FungibleTokenTransfer {
                token,
                to,
                amount,
                decimals,
                create_recipient_account,
            } => {
                let mint = parse_pubkey(network, token)?;
                let recipient = parse_pubkey(network, to)?;
                let decimals = self.token_decimals(profile, token, *decimals).await?;
                let units = parse_amount_u64(amount, decimals)?;

                let source = self.source_token_account(profile, payer, &mint).await?;
                let destination = associated_token_address(&recipient, &mint);
                let recipient_account = self
                    .chain_state
                    .get_token_account(network, &recipient.to_string(), &mint.to_string())
                    .await?;

                let mut instructions = Vec::with_capacity(2);
                let mut rent = 0;
                if !recipient_account.exists {
                    if !*create_recipient_account {
                        return Err(SignerError::RecipientTokenAccountMissing {
                            network: network.to_string(),
                            owner: recipient.to_string(),
                            mint: mint.to_string(),
                            token_account: destination.to_string(),
                        });
                    }
                    debug!(%destination, "recipient token account missing, creating it");
                    instructions.push(create_associated_token_account(payer, &recipient, &mint));
                    rent = TOKEN_ACCOUNT_RENT_LAMPORTS;
                }
                instructions.push(transfer_checked(&source, &mint, &destination, payer, units, decimals));

                Ok(InstructionPlan {
                    instructions,
                    to: recipient.to_string(),
                    native_value: 0,
                    reported_value: units,
                    rent,
                })
            }
            IntentKind::FungibleTokenApprove {
                token,
                spender,
                amount,
                decimals,
            } => {
                let mint = parse_pubkey(network, token)?;
                let delegate = parse_pubkey(network, spender)?;
                let decimals = self.token_decimals(profile, token, *decimals).await?;
                let units = parse_amount_u64(amount, decimals)?;
                let source = self.source_token_account(profile, payer, &mint).await?;

                Ok(InstructionPlan {
                    instructions: vec![approve_checked(&source, &mint, &delegate, payer, units, decimals)],
                    to: delegate.to_string(),
                    native_value: 0,
                    reported_value: units,
                    rent: 0,
                })
            }
            IntentKind::ContractCall { .. } => Err(SignerError::invalid_intent(
                "contract calls are only supported on EVM networks",
            )),
        }
    }

    async fn compute_unit_limit(
        &self,
        profile: &ChainProfile,
        payer: &Pubkey,
        instructions: &[Instruction],
        blockhash: &RecentBlockhash,
        native_value: u64,
        override_limit: Option<u64>,
    ) -> SignerResult<u32> {
        let limit = match override_limit {
            Some(limit) => limit,
            None if self.config.solana_compute_budget => {
                let draft = Message::new_with_blockhash(instructions, Some(payer), &blockhash.blockhash);
                let request = EstimateRequest {
                    from: payer.to_string(),
                    to: None,
                    value: U256::from(native_value),
                    payload: draft.serialize(),
                };
                self.resolver.resolve_gas_or_compute(profile, &request, None).await?
            }
            None => self.config.solana_compute_unit_limit as u64,
        };
        Ok(limit.min(MAX_COMPUTE_UNIT_LIMIT) as u32)
    }

    async fn check_balance(
        &self,
        profile: &ChainProfile,
        payer: &Pubkey,
        plan: &InstructionPlan,
        fee_lamports: u64,
    ) -> SignerResult<()> {
        let value = U256::from(plan.native_value);
        let required = value + U256::from(fee_lamports) + U256::from(plan.rent);
        let balance = self.chain_state.get_balance(&profile.key, &payer.to_string()).await?;

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
                address: payer.to_string(),
                shortfall,
                required: format!("{} lamports", required),
                available: format!("{} lamports", balance),
            }),
        }
    }
}

/// Total network fee: base fee per signature plus the priority fee for the
/// requested compute units (micro-lamports per CU, rounded up).
pub fn total_fee_lamports(fee: &FeeParams, num_signatures: usize, compute_units: u32) -> u64 {
    match fee {
        FeeParams::Solana {
            base_fee_lamports,
            priority_fee_micro_lamports,
        } => {
            let base = base_fee_lamports.saturating_mul(num_signatures as u64);
            let priority = priority_fee_micro_lamports
                .map(|price| {
                    let micro = price as u128 * compute_units as u128;
                    u64::try_from(micro.div_ceil(1_000_000)).unwrap_or(u64::MAX)
                })
                .unwrap_or_default();
            base.saturating_add(priority)
        }
        _ => 0,
    }
}

#[async_trait]
impl TransactionAssembler for SolanaAssembler {
    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
    }

    async fn craft(&self, intent: &UnsignedIntent, from: &str) -> SignerResult<PreparedTransaction> {
        let profile = self.registry.get(&intent.network)?;
        if profile.family != ChainFamily::Solana {
            return Err(SignerError::invalid_intent(format!(
                "{} is not a Solana network",
                profile.key
            )));
        }
        let payer = parse_pubkey(&profile.key, from)?;

        let plan = self.plan(profile, &payer, &intent.kind).await?;
        let primary_data = plan
            .instructions
            .last()
            .map(|ix| ix.data.clone())
            .unwrap_or_default();

        let mut body = plan.instructions.clone();
        if let Some(text) = &intent.memo {
            body.push(memo(&payer, text));
        }

        if intent.overrides.nonce.is_some() {
            warn!(network = %profile.key, "nonce override ignored, Solana uses a recent blockhash");
        }
        let blockhash = self.chain_state.get_latest_blockhash(&profile.key).await?;
        let resolved_fee = self.resolver.resolve_fee(profile, intent.overrides.fee).await?;
        let priority_price = match resolved_fee.fee {
            FeeParams::Solana {
                priority_fee_micro_lamports,
                ..
            } => priority_fee_micro_lamports,
            _ => {
                return Err(SignerError::invalid_intent(format!(
                    "EVM fee parameters on Solana network {}",
                    profile.key
                )))
            }
        };

        let compute_units = self
            .compute_unit_limit(
                profile,
                &payer,
                &body,
                &blockhash,
                plan.native_value,
                intent.overrides.gas_limit,
            )
            .await?;

        let mut instructions = Vec::with_capacity(body.len() + 2);
        if self.config.solana_compute_budget {
            instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(compute_units));
            if let Some(price) = priority_price {
                instructions.push(ComputeBudgetInstruction::set_compute_unit_price(price));
            }
        } else if priority_price.is_some() {
            warn!(network = %profile.key, "priority fee dropped, compute budget instructions are disabled");
        }
        instructions.extend(body);

        let message = Message::new_with_blockhash(&instructions, Some(&payer), &blockhash.blockhash);
        let message_bytes = message.serialize();
        let num_signatures = message.header.num_required_signatures as usize;
        check_message_size(profile, message_bytes.len(), num_signatures)?;

        let fee_lamports = if self.config.solana_compute_budget {
            total_fee_lamports(&resolved_fee.fee, num_signatures, compute_units)
        } else {
            total_fee_lamports(&resolved_fee.fee, num_signatures, 0)
        };
        self.check_balance(profile, &payer, &plan, fee_lamports).await?;

        let prepared = PreparedTransaction {
            network: profile.key.clone(),
            family: ChainFamily::Solana,
            kind: intent.kind.name(),
            from: payer.to_string(),
            to: plan.to,
            value: U256::from(plan.reported_value),
            payload: primary_data,
            nonce: None,
            fee: resolved_fee.fee,
            fee_estimated: resolved_fee.estimated,
            limit: ExecutionLimit::ComputeUnits(compute_units),
            recent_blockhash: Some(blockhash),
            message: message_bytes,
            body: TxBody::Solana(message),
        };
        debug!(
            network = %prepared.network,
            instructions = instructions.len(),
            compute_units,
            message_len = prepared.message.len(),
            digest = %prepared.message_digest(),
            "assembled Solana message"
        );
        info!(network = %prepared.network, kind = prepared.kind, from = %prepared.from, "✅ Solana transaction prepared");
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::mock::MockChainState;
    use pretty_assertions::assert_eq;

    struct Fixture {
        mock: Arc<MockChainState>,
        assembler: SolanaAssembler,
        payer: Pubkey,
        mint: Pubkey,
        recipient: Pubkey,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockChainState::new());
        mock.set_fee(
            "solana",
            FeeParams::Solana {
                base_fee_lamports: 5_000,
                priority_fee_micro_lamports: Some(10_000),
            },
        );
        let payer = Pubkey::new_unique();
        mock.set_balance("solana", &payer.to_string(), U256::from(10_000_000_000u64));
        let resolver = NonceFeeResolver::new(mock.clone(), 20);
        let assembler = SolanaAssembler::new(
            mock.clone(),
            resolver,
            Arc::new(NetworkRegistry::builtin()),
            AssemblyConfig::default(),
        );
        Fixture {
            mock,
            assembler,
            payer,
            mint: Pubkey::new_unique(),
            recipient: Pubkey::new_unique(),
        }
    }

    #[test]
    fn test_associated_token_address_is_deterministic_pda() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let first = associated_token_address(&owner, &mint);
        assert_eq!(first, associated_token_address(&owner, &mint));
        assert_ne!(first, associated_token_address(&mint, &owner));
        assert!(!first.is_on_curve());
    }

    #[test]
    fn test_parse_pubkey_rejects_bad_input() {
        assert!(matches!(
            parse_pubkey("solana", "0OIl").unwrap_err(),
            SignerError::InvalidAddress { .. }
        ));
        assert!(matches!(
            parse_pubkey("solana", "3yZe7d").unwrap_err(),
            SignerError::InvalidAddress { .. }
        ));
    }

    #[test]
    fn test_total_fee() {
        let fee = FeeParams::Solana {
            base_fee_lamports: 5_000,
            priority_fee_micro_lamports: Some(1),
        };
        // 5000 + ceil(1 * 200_000 / 1e6)
        assert_eq!(total_fee_lamports(&fee, 1, 200_000), 5_001);
        assert_eq!(total_fee_lamports(&fee, 2, 0), 10_000);
    }

    #[tokio::test]
    async fn test_native_transfer() {
        let f = fixture();
        let intent = UnsignedIntent::native_transfer("solana", f.recipient.to_string(), "1.5");
        let prepared = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap();

        assert_eq!(prepared.nonce, None);
        assert_eq!(prepared.value, U256::from(1_500_000_000u64));
        let message = prepared.solana_message().unwrap();
        assert_eq!(message.account_keys[0], f.payer);
        // limit + price + transfer
        assert_eq!(message.instructions.len(), 3);
        // 60_000 mock estimate + 20%
        assert_eq!(prepared.limit, ExecutionLimit::ComputeUnits(72_000));
        assert_eq!(prepared.message_bytes(), message.serialize().as_slice());
    }

    #[tokio::test]
    async fn test_token_transfer_missing_recipient_account() {
        let f = fixture();
        f.mock.add_token_account("solana", &f.payer, &f.mint);
        let intent = UnsignedIntent::token_transfer(
            "solana",
            f.mint.to_string(),
            f.recipient.to_string(),
            "1",
        )
        .with_decimals(6);
        let err = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap_err();
        match err {
            SignerError::RecipientTokenAccountMissing { token_account, .. } => {
                assert_eq!(token_account, associated_token_address(&f.recipient, &f.mint).to_string());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_transfer_creates_recipient_account() {
        let f = fixture();
        f.mock.add_token_account("solana", &f.payer, &f.mint);
        let intent = UnsignedIntent::token_transfer(
            "solana",
            f.mint.to_string(),
            f.recipient.to_string(),
            "1",
        )
        .with_decimals(6)
        .with_create_recipient_account();
        let prepared = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap();

        let message = prepared.solana_message().unwrap();
        let programs: Vec<Pubkey> = message
            .instructions
            .iter()
            .map(|ix| message.account_keys[ix.program_id_index as usize])
            .collect();
        assert_eq!(programs[programs.len() - 2], ASSOCIATED_TOKEN_PROGRAM_ID);
        assert_eq!(programs[programs.len() - 1], TOKEN_PROGRAM_ID);
        assert_eq!(prepared.payload[0], SPL_TRANSFER_CHECKED);
        assert_eq!(prepared.value, U256::from(1_000_000u64));
    }

    #[tokio::test]
    async fn test_token_transfer_missing_source_account() {
        let f = fixture();
        let intent = UnsignedIntent::token_transfer(
            "solana",
            f.mint.to_string(),
            f.recipient.to_string(),
            "1",
        )
        .with_decimals(6);
        let err = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap_err();
        assert!(matches!(err, SignerError::SourceTokenAccountMissing { .. }));
    }

    #[tokio::test]
    async fn test_approve_and_memo() {
        let f = fixture();
        f.mock.add_token_account("solana", &f.payer, &f.mint);
        let delegate = Pubkey::new_unique();
        let intent = UnsignedIntent::token_approve(
            "solana",
            f.mint.to_string(),
            delegate.to_string(),
            "5",
        )
        .with_decimals(6)
        .with_memo("allowance for payroll");
        let prepared = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap();

        assert_eq!(prepared.payload[0], SPL_APPROVE_CHECKED);
        let message = prepared.solana_message().unwrap();
        let last = message.instructions.last().unwrap();
        assert_eq!(message.account_keys[last.program_id_index as usize], MEMO_PROGRAM_ID);
        assert_eq!(last.data, b"allowance for payroll".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_memo_rejected() {
        let f = fixture();
        let intent = UnsignedIntent::native_transfer("solana", f.recipient.to_string(), "0.1")
            .with_memo("x".repeat(1300));
        let err = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap_err();
        assert!(matches!(err, SignerError::MessageTooLarge { .. }));
        assert_eq!(f.mock.calls("get_balance"), 0);
    }

    #[tokio::test]
    async fn test_balance_includes_fee_and_rent() {
        let f = fixture();
        f.mock.add_token_account("solana", &f.payer, &f.mint);
        f.mock.set_balance("solana", &f.payer.to_string(), U256::from(1_000_000u64));
        let intent = UnsignedIntent::token_transfer(
            "solana",
            f.mint.to_string(),
            f.recipient.to_string(),
            "1",
        )
        .with_decimals(6)
        .with_create_recipient_account();
        let err = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap_err();
        assert!(matches!(
            err,
            SignerError::InsufficientBalance { shortfall: BalanceShortfall::Gas, .. }
        ));
    }

    #[tokio::test]
    async fn test_contract_call_rejected() {
        let f = fixture();
        let intent = UnsignedIntent::contract_call("solana", f.mint.to_string(), "anything", vec![]);
        let err = f.assembler.craft(&intent, &f.payer.to_string()).await.unwrap_err();
        assert!(matches!(err, SignerError::InvalidIntent { .. }));
    }
}
