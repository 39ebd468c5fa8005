//! Escrow contract call encoding
//!
//! Only the two withdraw entry points matter to the coordinator: their first
//! argument is the secret, which lets a counter-party recover it from a
//! transaction's input when the contract storage is not readable.

use crate::error::{SwapError, SwapResult};
use crate::swap::Secret;

use ethers::abi::{self, ParamType, Token};
use ethers::types::Address;
use sha3::{Digest, Keccak256};

pub const WITHDRAW_SIGNATURE: &str = "withdraw(bytes32,address)";
pub const WITHDRAW_OTHER_SIGNATURE: &str = "withdrawOther(bytes32,address,address)";

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

fn parse_address(value: &str) -> SwapResult<Address> {
    value
        .parse::<Address>()
        .map_err(|e| SwapError::Precondition(format!("invalid address {}: {}", value, e)))
}

/// `withdraw(secret, owner)` input
pub fn encode_withdraw_call(secret: &Secret, funder: &str) -> SwapResult<Vec<u8>> {
    let mut data = selector(WITHDRAW_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::FixedBytes(secret.as_bytes().to_vec()),
        Token::Address(parse_address(funder)?),
    ]));
    Ok(data)
}

/// `withdrawOther(secret, owner, participant)` input
pub fn encode_withdraw_other_call(
    secret: &Secret,
    funder: &str,
    recipient: &str,
) -> SwapResult<Vec<u8>> {
    let mut data = selector(WITHDRAW_OTHER_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::FixedBytes(secret.as_bytes().to_vec()),
        Token::Address(parse_address(funder)?),
        Token::Address(parse_address(recipient)?),
    ]));
    Ok(data)
}

/// Extract the secret from a withdraw or withdrawOther input.
/// Returns `None` for any other call.
pub fn decode_withdraw_input(input: &[u8]) -> SwapResult<Option<Secret>> {
    if input.len() < 4 {
        return Ok(None);
    }
    let (head, body) = input.split_at(4);

    let params: &[ParamType] = if head == selector(WITHDRAW_SIGNATURE) {
        &[ParamType::FixedBytes(32), ParamType::Address]
    } else if head == selector(WITHDRAW_OTHER_SIGNATURE) {
        &[
            ParamType::FixedBytes(32),
            ParamType::Address,
            ParamType::Address,
        ]
    } else {
        return Ok(None);
    };

    let tokens = abi::decode(params, body)
        .map_err(|e| SwapError::Precondition(format!("malformed withdraw input: {}", e)))?;

    match tokens.into_iter().next() {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(&bytes);
            Ok(Some(Secret::from_bytes(secret)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0x1111111111111111111111111111111111111111";
    const PARTICIPANT: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_secret_recovered_from_both_entry_points() {
        let secret = Secret::random();

        let input = encode_withdraw_call(&secret, OWNER).unwrap();
        assert_eq!(input.len(), 4 + 64);
        assert_eq!(decode_withdraw_input(&input).unwrap(), Some(secret));

        let input = encode_withdraw_other_call(&secret, OWNER, PARTICIPANT).unwrap();
        assert_eq!(input.len(), 4 + 96);
        assert_eq!(decode_withdraw_input(&input).unwrap(), Some(secret));
    }

    #[test]
    fn test_foreign_calls_ignored() {
        let mut input = selector("transfer(address,uint256)").to_vec();
        input.extend([0u8; 64]);
        assert_eq!(decode_withdraw_input(&input).unwrap(), None);
        assert_eq!(decode_withdraw_input(&[1, 2]).unwrap(), None);
        assert!(encode_withdraw_call(&Secret::random(), "not-an-address").is_err());
    }
}
