//! BIP32/BIP44 derivation paths
//!
//! Path format: m/44'/coin_type'/account'/change/address_index
//!
//! Supported families:
//! - EVM: coin_type = 60, m/44'/60'/account'/0/index
//! - Solana: coin_type = 501, fully hardened (SLIP-10 ed25519), m/44'/501'/account'[/change']

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::chain::ChainFamily;
use crate::core::errors::{SignerError, SignerResult};

const HARDENED_BIT: u32 = 0x8000_0000;
const BIP44_PURPOSE: u32 = 44;

/// One path component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildIndex {
    pub index: u32,
    pub hardened: bool,
}

impl ChildIndex {
    pub fn hardened(index: u32) -> Self {
        Self { index, hardened: true }
    }

    pub fn normal(index: u32) -> Self {
        Self { index, hardened: false }
    }

    /// Raw BIP32 index with the hardened bit applied.
    pub fn to_u32(self) -> u32 {
        if self.hardened {
            HARDENED_BIT | self.index
        } else {
            self.index
        }
    }
}

impl fmt::Display for ChildIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hardened {
            write!(f, "{}'", self.index)
        } else {
            write!(f, "{}", self.index)
        }
    }
}

/// Parsed, immutable derivation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    components: Vec<ChildIndex>,
}

impl DerivationPath {
    /// Default EVM path: m/44'/60'/account'/0/index
    pub fn evm(account: u32, index: u32) -> Self {
        Self {
            components: vec![
                ChildIndex::hardened(BIP44_PURPOSE),
                ChildIndex::hardened(ChainFamily::Evm.coin_type()),
                ChildIndex::hardened(account),
                ChildIndex::normal(0),
                ChildIndex::normal(index),
            ],
        }
    }

    /// Default Solana path: m/44'/501'/account'/0'
    pub fn solana(account: u32) -> Self {
        Self {
            components: vec![
                ChildIndex::hardened(BIP44_PURPOSE),
                ChildIndex::hardened(ChainFamily::Solana.coin_type()),
                ChildIndex::hardened(account),
                ChildIndex::hardened(0),
            ],
        }
    }

    /// Parses a path and checks it against the prefix expected by `family`.
    pub fn parse_for(path: &str, family: ChainFamily) -> SignerResult<Self> {
        let parsed: Self = path.parse()?;
        parsed.validate_for(family)?;
        Ok(parsed)
    }

    pub fn components(&self) -> &[ChildIndex] {
        &self.components
    }

    /// Raw indices with hardened bits applied.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        self.components.iter().map(|c| c.to_u32()).collect()
    }

    /// Family implied by the coin-type component, if any.
    pub fn family(&self) -> Option<ChainFamily> {
        match self.components.get(1) {
            Some(c) if c.hardened && c.index == ChainFamily::Evm.coin_type() => Some(ChainFamily::Evm),
            Some(c) if c.hardened && c.index == ChainFamily::Solana.coin_type() => {
                Some(ChainFamily::Solana)
            }
            _ => None,
        }
    }

    /// Checks purpose, coin type, depth and hardening rules for `family`.
    pub fn validate_for(&self, family: ChainFamily) -> SignerResult<()> {
        let invalid = |reason: String| SignerError::InvalidDerivationPath {
            path: self.to_string(),
            reason,
        };

        if self.components.first() != Some(&ChildIndex::hardened(BIP44_PURPOSE)) {
            return Err(invalid("purpose must be 44'".to_string()));
        }
        let coin_type = family.coin_type();
        if self.components.get(1) != Some(&ChildIndex::hardened(coin_type)) {
            return Err(invalid(format!("coin type must be {}' for {:?}", coin_type, family)));
        }
        match self.components.get(2) {
            Some(account) if account.hardened => {}
            _ => return Err(invalid("account level must be hardened".to_string())),
        }

        match family {
            ChainFamily::Evm => {
                if self.components.len() > 5 {
                    return Err(invalid("EVM paths have at most 5 levels".to_string()));
                }
            }
            ChainFamily::Solana => {
                // ed25519 (SLIP-10) only supports hardened derivation
                if self.components.len() > 4 {
                    return Err(invalid("Solana paths have at most 4 levels".to_string()));
                }
                if self.components.iter().any(|c| !c.hardened) {
                    return Err(invalid("every Solana path level must be hardened".to_string()));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = SignerError;

    /// Parses strings like "m/44'/60'/0'/0/0" (`h` is accepted as hardened marker).
    fn from_str(path_str: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SignerError::InvalidDerivationPath {
            path: path_str.to_string(),
            reason: reason.to_string(),
        };

        let rest = path_str
            .trim()
            .strip_prefix("m/")
            .ok_or_else(|| invalid("path must start with m/"))?;
        if rest.is_empty() {
            return Err(invalid("path must contain at least one component"));
        }

        let mut components = Vec::new();
        for part in rest.split('/') {
            if part.is_empty() {
                return Err(invalid("path contains an empty component"));
            }
            let (num_str, hardened) = match part.strip_suffix(['\'', 'h']) {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            let index: u32 = num_str.parse().map_err(|_| invalid("component is not a number"))?;
            if index >= HARDENED_BIT {
                return Err(invalid("component index out of range"));
            }
            components.push(ChildIndex { index, hardened });
        }

        Ok(Self { components })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}
