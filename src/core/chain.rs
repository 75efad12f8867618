//! Static per-network parameters.
//!
//! Every prepared transaction belongs to exactly one [`ChainProfile`]; the
//! profile decides the fee model, the size limit the device can sign and the
//! fallback fee used when the RPC cannot be reached.

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::errors::{SignerError, SignerResult};

/// SLIP-44 coin type for EVM chains.
pub const EVM_COIN_TYPE: u32 = 60;
/// SLIP-44 coin type for Solana.
pub const SOLANA_COIN_TYPE: u32 = 501;

/// Largest Solana transaction the network (and the device) accepts.
pub const SOLANA_MAX_MESSAGE_BYTES: usize = 1232;
/// Upper bound used for EVM payloads (geth txpool limit).
pub const EVM_MAX_MESSAGE_BYTES: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Evm,
    Solana,
}

impl ChainFamily {
    pub fn coin_type(self) -> u32 {
        match self {
            ChainFamily::Evm => EVM_COIN_TYPE,
            ChainFamily::Solana => SOLANA_COIN_TYPE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModel {
    Legacy,
    Eip1559,
    SolanaPriorityFee,
}

/// Resolved fee fields. One variant per fee model so legacy and EIP-1559
/// fields can never be mixed on one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum FeeParams {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
    Solana {
        base_fee_lamports: u64,
        priority_fee_micro_lamports: Option<u64>,
    },
}

impl FeeParams {
    pub fn model(&self) -> FeeModel {
        match self {
            FeeParams::Legacy { .. } => FeeModel::Legacy,
            FeeParams::Eip1559 { .. } => FeeModel::Eip1559,
            FeeParams::Solana { .. } => FeeModel::SolanaPriorityFee,
        }
    }

    /// Highest price per gas unit the sender may pay (EVM only).
    pub fn gas_price_ceiling(&self) -> Option<U256> {
        match self {
            FeeParams::Legacy { gas_price } => Some(*gas_price),
            FeeParams::Eip1559 { max_fee_per_gas, .. } => Some(*max_fee_per_gas),
            FeeParams::Solana { .. } => None,
        }
    }
}

/// Chain identifier: numeric chain id for EVM, cluster name for Solana.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkId {
    EvmChain(u64),
    SolanaCluster(String),
}

/// Immutable per-network record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainProfile {
    /// Key callers use to reference the network (e.g. "ethereum", "solana-devnet").
    pub key: String,
    pub name: String,
    pub family: ChainFamily,
    pub network_id: NetworkId,
    pub max_message_bytes: usize,
    pub native_decimals: u8,
    pub native_symbol: String,
    pub fee_model: FeeModel,
    /// Static fallback used when the live fee query fails.
    pub default_fee: FeeParams,
}

impl ChainProfile {
    pub fn chain_id(&self) -> Option<u64> {
        match self.network_id {
            NetworkId::EvmChain(id) => Some(id),
            NetworkId::SolanaCluster(_) => None,
        }
    }

    fn evm(key: &str, name: &str, chain_id: u64, symbol: &str, fee_model: FeeModel) -> Self {
        let gwei = U256::exp10(9);
        let default_fee = match fee_model {
            FeeModel::Legacy => FeeParams::Legacy { gas_price: gwei * U256::from(5u64) },
            _ => FeeParams::Eip1559 {
                max_fee_per_gas: gwei * U256::from(50u64),
                max_priority_fee_per_gas: gwei * U256::from(2u64),
            },
        };
        Self {
            key: key.to_string(),
            name: name.to_string(),
            family: ChainFamily::Evm,
            network_id: NetworkId::EvmChain(chain_id),
            max_message_bytes: EVM_MAX_MESSAGE_BYTES,
            native_decimals: 18,
            native_symbol: symbol.to_string(),
            fee_model,
            default_fee,
        }
    }

    fn solana(key: &str, name: &str, cluster: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            family: ChainFamily::Solana,
            network_id: NetworkId::SolanaCluster(cluster.to_string()),
            max_message_bytes: SOLANA_MAX_MESSAGE_BYTES,
            native_decimals: 9,
            native_symbol: "SOL".to_string(),
            fee_model: FeeModel::SolanaPriorityFee,
            default_fee: FeeParams::Solana {
                base_fee_lamports: 5_000,
                priority_fee_micro_lamports: None,
            },
        }
    }
}

/// Lookup table of the networks this signer can assemble for.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    profiles: HashMap<String, ChainProfile>,
}

impl NetworkRegistry {
    pub fn empty() -> Self {
        Self { profiles: HashMap::new() }
    }

    /// Built-in mainnet/testnet profiles.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for profile in [
            ChainProfile::evm("ethereum", "Ethereum Mainnet", 1, "ETH", FeeModel::Eip1559),
            ChainProfile::evm("sepolia", "Sepolia Testnet", 11155111, "ETH", FeeModel::Eip1559),
            ChainProfile::evm("polygon", "Polygon PoS", 137, "POL", FeeModel::Eip1559),
            ChainProfile::evm("bsc", "BNB Smart Chain", 56, "BNB", FeeModel::Legacy),
            ChainProfile::solana("solana", "Solana Mainnet Beta", "mainnet-beta"),
            ChainProfile::solana("solana-devnet", "Solana Devnet", "devnet"),
        ] {
            registry.insert(profile);
        }
        registry
    }

    /// Adds or replaces a profile.
    pub fn insert(&mut self, profile: ChainProfile) {
        self.profiles.insert(profile.key.clone(), profile);
    }

    pub fn get(&self, network: &str) -> SignerResult<&ChainProfile> {
        self.profiles
            .get(network)
            .ok_or_else(|| SignerError::UnsupportedNetwork { network: network.to_string() })
    }

    pub fn networks(&self) -> impl Iterator<Item = &ChainProfile> {
        self.profiles.values()
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let registry = NetworkRegistry::builtin();
        let eth = registry.get("ethereum").unwrap();
        assert_eq!(eth.chain_id(), Some(1));
        assert_eq!(eth.fee_model, FeeModel::Eip1559);
        assert_eq!(eth.default_fee.model(), FeeModel::Eip1559);

        let bsc = registry.get("bsc").unwrap();
        assert_eq!(bsc.default_fee.model(), FeeModel::Legacy);

        let sol = registry.get("solana").unwrap();
        assert_eq!(sol.max_message_bytes, 1232);
        assert_eq!(sol.chain_id(), None);
    }

    #[test]
    fn test_unknown_network() {
        let registry = NetworkRegistry::builtin();
        let err = registry.get("dogechain").unwrap_err();
        assert!(matches!(err, SignerError::UnsupportedNetwork { .. }));
    }

    #[test]
    fn test_gas_price_ceiling() {
        let fee = FeeParams::Eip1559 {
            max_fee_per_gas: U256::from(30u64),
            max_priority_fee_per_gas: U256::from(2u64),
        };
        assert_eq!(fee.gas_price_ceiling(), Some(U256::from(30u64)));
        let sol = FeeParams::Solana { base_fee_lamports: 5000, priority_fee_micro_lamports: None };
        assert_eq!(sol.gas_price_ceiling(), None);
    }
}
