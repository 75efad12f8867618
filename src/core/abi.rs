use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{Abi, Address, Function, Token};
use ethers::types::U256;
use sha3::{Digest, Keccak256};

use crate::core::errors::{SignerError, SignerResult};

pub const ERC20_TRANSFER: &str = "transfer(address,uint256)";
pub const ERC20_APPROVE: &str = "approve(address,uint256)";

/// Compute the first 4 bytes (function selector) from a signature string, e.g. "transfer(address,uint256)".
pub fn selector_from_signature(signature: &str) -> [u8; 4] {
    let mut keccak = Keccak256::new();
    keccak.update(signature.as_bytes());
    let out = keccak.finalize();
    [out[0], out[1], out[2], out[3]]
}

/// Calldata for an ERC-20 style `(address, uint256)` method.
pub fn encode_address_amount_call(signature: &str, target: Address, amount: U256) -> Vec<u8> {
    let selector = selector_from_signature(signature);
    let words = ethers::abi::encode(&[Token::Address(target), Token::Uint(amount)]);
    let mut out = Vec::with_capacity(4 + words.len());
    out.extend_from_slice(&selector);
    out.extend_from_slice(&words);
    out
}

/// Parses a JSON ABI document.
pub fn parse_abi(contract: &str, abi_json: &str) -> SignerResult<Abi> {
    serde_json::from_str(abi_json).map_err(|e| {
        SignerError::invalid_intent(format!("ABI for {} is not valid JSON ABI: {}", contract, e))
    })
}

/// Picks the overload of `method` taking `arg_count` inputs.
pub fn find_function<'a>(
    abi: &'a Abi,
    contract: &str,
    method: &str,
    arg_count: usize,
) -> SignerResult<&'a Function> {
    let not_found = || SignerError::MethodNotFound {
        contract: contract.to_string(),
        method: method.to_string(),
    };
    let overloads = abi.functions_by_name(method).map_err(|_| not_found())?;
    overloads
        .iter()
        .find(|f| f.inputs.len() == arg_count)
        .ok_or_else(|| {
            SignerError::invalid_intent(format!(
                "{} takes {} argument(s) in the ABI of {}, got {}",
                method,
                overloads.first().map(|f| f.inputs.len()).unwrap_or_default(),
                contract,
                arg_count
            ))
        })
}

/// Encodes calldata for `method` with string arguments tokenized per the ABI types.
pub fn encode_contract_call(
    abi: &Abi,
    contract: &str,
    method: &str,
    args: &[String],
) -> SignerResult<Vec<u8>> {
    let function = find_function(abi, contract, method, args.len())?;
    let tokens = function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            LenientTokenizer::tokenize(&param.kind, arg).map_err(|e| {
                SignerError::invalid_intent(format!(
                    "argument '{}' for {} is not a valid {}: {}",
                    param.name, method, param.kind, e
                ))
            })
        })
        .collect::<SignerResult<Vec<Token>>>()?;
    function
        .encode_input(&tokens)
        .map_err(|e| SignerError::invalid_intent(format!("failed to encode {}: {}", method, e)))
}
