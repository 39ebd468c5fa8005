//! Swap records and HTLC commitment types

use crate::error::{SwapError, SwapResult};

use bitcoin::hashes::{ripemd160, Hash};
use ethers::types::U256;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which side of the swap this process drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the secret, funds the script leg first
    Owner,
    /// Funds the contract leg after verifying the owner's script
    Participant,
}

/// Assets the coordinator knows how to move
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Asset {
    Btc,
    Bch,
    Eth,
    Token(String),
}

impl Asset {
    /// Assets settled through a redeemable output script
    pub fn is_script_asset(&self) -> bool {
        matches!(self, Asset::Btc | Asset::Bch)
    }

    /// Assets settled through the escrow contract
    pub fn is_contract_asset(&self) -> bool {
        matches!(self, Asset::Eth | Asset::Token(_))
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Asset::Token(_))
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => write!(f, "BTC"),
            Asset::Bch => write!(f, "BCH"),
            Asset::Eth => write!(f, "ETH"),
            Asset::Token(symbol) => write!(f, "{}", symbol),
        }
    }
}

impl FromStr for Asset {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let symbol = s.trim().to_uppercase();
        match symbol.as_str() {
            "" => Err(SwapError::Config("empty asset symbol".to_string())),
            "BTC" => Ok(Asset::Btc),
            "BCH" => Ok(Asset::Bch),
            "ETH" => Ok(Asset::Eth),
            _ if symbol.chars().all(|c| c.is_ascii_alphanumeric()) => Ok(Asset::Token(symbol)),
            _ => Err(SwapError::Config(format!("invalid asset symbol: {}", s))),
        }
    }
}

impl TryFrom<String> for Asset {
    type Error = SwapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Asset> for String {
    fn from(asset: Asset) -> Self {
        asset.to_string()
    }
}

/// Addresses and keys of one party on both chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub peer_id: String,
    pub script_address: String,
    pub script_public_key: String,
    pub eth_address: String,
}

impl Identity {
    /// Reject identities with missing fields
    pub fn validate(&self) -> SwapResult<()> {
        let missing = [
            ("peer_id", &self.peer_id),
            ("script_address", &self.script_address),
            ("script_public_key", &self.script_public_key),
            ("eth_address", &self.eth_address),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        match missing {
            Some((field, _)) => Err(SwapError::Config(format!("identity field {} is empty", field))),
            None => Ok(()),
        }
    }
}

/// Two-party exchange record, owned by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swap {
    pub id: String,
    pub role: Role,
    pub sell_asset: Asset,
    pub sell_amount: U256,
    pub buy_asset: Asset,
    pub buy_amount: U256,
    pub counterparty: Identity,
    /// Where I want to receive the bought asset, if not my own address
    #[serde(default)]
    pub destination_buy_address: Option<String>,
    /// Where the counter-party wants to receive what I sell
    #[serde(default)]
    pub destination_sell_address: Option<String>,
}

impl Swap {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// 32-byte pre-image
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Secret(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Secret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One-way commitment published in place of the secret
    pub fn hash(&self) -> SecretHash {
        SecretHash::of(self)
    }
}

// Keep the pre-image out of logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}

/// RIPEMD-160 digest of a secret
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretHash([u8; 20]);

impl SecretHash {
    pub fn of(secret: &Secret) -> Self {
        SecretHash(ripemd160::Hash::hash(secret.as_bytes()).to_byte_array())
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        SecretHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", hex::encode(self.0))
    }
}

macro_rules! hex_bytes_impl {
    ($ty:ident, $len:expr) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $ty {
            type Err = SwapError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes).map_err(|e| {
                    SwapError::Precondition(format!(
                        "invalid {} hex: {}",
                        stringify!($ty),
                        e
                    ))
                })?;
                Ok($ty(bytes))
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

hex_bytes_impl!(Secret, 32);
hex_bytes_impl!(SecretHash, 20);

/// HTLC commitment governing the script leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptValues {
    pub secret_hash: SecretHash,
    pub owner_public_key: String,
    pub recipient_public_key: String,
    /// Absolute unix time after which the owner may refund
    pub lock_time: i64,
}

impl ScriptValues {
    pub fn is_refundable_at(&self, now: i64) -> bool {
        now >= self.lock_time
    }
}

/// Current wall-clock time in unix seconds
pub fn utc_now() -> i64 {
    chrono::Utc::now().timestamp()
}
