//! Nonce, fee and execution-limit resolution.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::blockchain::traits::{ChainStatePort, EstimateRequest, PendingTransactionCount};
use crate::core::chain::{ChainFamily, ChainProfile, FeeModel, FeeParams};
use crate::core::errors::{SignerError, SignerResult};

/// Next nonce for an account given its pending transaction count.
///
/// Takes nothing but the pending count: a block number cannot reach this
/// function because it is a different type.
pub fn select_nonce(pending: PendingTransactionCount) -> u64 {
    pending.0
}

/// Adds `margin_percent` on top of an estimate, rounding up.
pub fn apply_margin(estimate: u64, margin_percent: u64) -> u64 {
    let scaled = (estimate as u128) * (100 + margin_percent as u128);
    let with_margin = scaled.div_ceil(100);
    u64::try_from(with_margin).unwrap_or(u64::MAX)
}

/// Fee fields plus whether they came from the static fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFee {
    pub fee: FeeParams,
    pub estimated: bool,
}

/// Resolves nonce / fee / gas for one transaction from the chain-state port.
#[derive(Clone)]
pub struct NonceFeeResolver {
    chain_state: Arc<dyn ChainStatePort>,
    margin_percent: u64,
}

impl NonceFeeResolver {
    pub fn new(chain_state: Arc<dyn ChainStatePort>, margin_percent: u64) -> Self {
        Self {
            chain_state,
            margin_percent,
        }
    }

    /// Nonce for `address`; an override is used verbatim without querying.
    /// Solana has no account nonce and always yields `None`.
    pub async fn resolve_nonce(
        &self,
        address: &str,
        profile: &ChainProfile,
        override_nonce: Option<u64>,
    ) -> SignerResult<Option<u64>> {
        if profile.family == ChainFamily::Solana {
            if override_nonce.is_some() {
                warn!(network = %profile.key, "nonce override ignored, Solana uses a recent blockhash");
            }
            return Ok(None);
        }

        if let Some(nonce) = override_nonce {
            debug!(network = %profile.key, %address, nonce, "using caller nonce override");
            return Ok(Some(nonce));
        }

        let pending = self
            .chain_state
            .get_transaction_count(&profile.key, address)
            .await?;
        let nonce = select_nonce(pending);
        debug!(network = %profile.key, %address, nonce, "resolved nonce from pending count");
        Ok(Some(nonce))
    }

    /// Fee fields in the profile's fee model. A failed live query falls back
    /// to the profile default and marks the result as estimated.
    pub async fn resolve_fee(
        &self,
        profile: &ChainProfile,
        override_fee: Option<FeeParams>,
    ) -> SignerResult<ResolvedFee> {
        if let Some(fee) = override_fee {
            if fee.model() != profile.fee_model {
                return Err(SignerError::invalid_intent(format!(
                    "fee override uses the {:?} model, {} uses {:?}",
                    fee.model(),
                    profile.key,
                    profile.fee_model
                )));
            }
            return Ok(ResolvedFee { fee, estimated: false });
        }

        match self.chain_state.get_fee_estimate(&profile.key).await {
            Ok(live) => match conform(live, profile.fee_model) {
                Some(fee) => {
                    debug!(network = %profile.key, ?fee, "resolved live fee");
                    Ok(ResolvedFee { fee, estimated: false })
                }
                None => {
                    warn!(network = %profile.key, ?live, "live fee does not fit the network fee model, using static default");
                    Ok(ResolvedFee { fee: profile.default_fee, estimated: true })
                }
            },
            Err(err @ SignerError::ChainStateUnavailable { .. }) => {
                warn!(network = %profile.key, error = %err, "fee query failed, using static default");
                Ok(ResolvedFee { fee: profile.default_fee, estimated: true })
            }
            Err(err) => Err(err),
        }
    }

    /// Gas (EVM) or compute unit (Solana) limit: override verbatim, else the
    /// port estimate plus the configured margin. Estimate failures propagate.
    pub async fn resolve_gas_or_compute(
        &self,
        profile: &ChainProfile,
        request: &EstimateRequest,
        override_limit: Option<u64>,
    ) -> SignerResult<u64> {
        if let Some(limit) = override_limit {
            return Ok(limit);
        }
        let estimate = self
            .chain_state
            .estimate_gas_or_compute(&profile.key, request)
            .await?;
        let limit = apply_margin(estimate, self.margin_percent);
        debug!(network = %profile.key, estimate, limit, "resolved execution limit");
        Ok(limit)
    }
}

/// Maps a live fee onto `model`, converting between the two EVM shapes.
fn conform(fee: FeeParams, model: FeeModel) -> Option<FeeParams> {
    match (fee, model) {
        (fee, model) if fee.model() == model => Some(fee),
        (FeeParams::Legacy { gas_price }, FeeModel::Eip1559) => Some(FeeParams::Eip1559 {
            max_fee_per_gas: gas_price,
            max_priority_fee_per_gas: gas_price,
        }),
        (FeeParams::Eip1559 { max_fee_per_gas, .. }, FeeModel::Legacy) => Some(FeeParams::Legacy {
            gas_price: max_fee_per_gas,
        }),
        _ => None,
    }
}
