//! Supported chains and EVM primitives shared across the crate

use ethabi::ethereum_types::U256;
use ethabi::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Blockchains a delegation approval can be submitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Arbitrum,
    ArbitrumGoerli,
    ArbitrumNova,
    Avalanche,
    AvalancheFuji,
    Binance,
    BinanceTestnet,
    Ethereum,
    Fantom,
    FantomTestnet,
    Goerli,
    Matic,
    MaticMumbai,
    Moonbeam,
    MoonbeamTestnet,
    Thundercore,
    ThundercoreTestnet,
}

/// Chain name and EIP-155 chain id for every supported chain
const CHAIN_TABLE: &[(Chain, &str, u64)] = &[
    (Chain::Arbitrum, "ARBITRUM", 42161),
    (Chain::ArbitrumGoerli, "ARBITRUMGOERLI", 421613),
    (Chain::ArbitrumNova, "ARBITRUMNOVA", 42170),
    (Chain::Avalanche, "AVALANCHE", 43114),
    (Chain::AvalancheFuji, "AVALANCHEFUJI", 43113),
    (Chain::Binance, "BINANCE", 56),
    (Chain::BinanceTestnet, "BINANCETESTNET", 97),
    (Chain::Ethereum, "ETHEREUM", 1),
    (Chain::Fantom, "FANTOM", 250),
    (Chain::FantomTestnet, "FANTOMTESTNET", 4002),
    (Chain::Goerli, "GOERLI", 5),
    (Chain::Matic, "MATIC", 137),
    (Chain::MaticMumbai, "MATICMUMBAI", 80001),
    (Chain::Moonbeam, "MOONBEAM", 1284),
    (Chain::MoonbeamTestnet, "MOONBEAMTESTNET", 1287),
    (Chain::Thundercore, "THUNDERCORE", 108),
    (Chain::ThundercoreTestnet, "THUNDERCORETESTNET", 18),
];

impl Chain {
    /// All supported chains, in table order
    pub fn all() -> impl Iterator<Item = Chain> {
        CHAIN_TABLE.iter().map(|(chain, _, _)| *chain)
    }

    /// Canonical upper-case name ("MATIC")
    pub fn name(&self) -> &'static str {
        self.entry().1
    }

    /// EIP-155 chain id
    pub fn chain_id(&self) -> u64 {
        self.entry().2
    }

    fn entry(&self) -> &'static (Chain, &'static str, u64) {
        CHAIN_TABLE
            .iter()
            .find(|(chain, _, _)| chain == self)
            .unwrap_or(&CHAIN_TABLE[0])
    }
}

impl FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        CHAIN_TABLE
            .iter()
            .find(|(_, name, _)| *name == wanted)
            .map(|(chain, _, _)| *chain)
            .ok_or_else(|| Error::UnsupportedChain(s.to_string()))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Chain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

// Case-insensitive: the config crate lower-cases table keys.
impl<'de> Deserialize<'de> for Chain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0_u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Parse a 20-byte address from `0x`-prefixed or bare hex
pub fn parse_address(input: &str) -> Result<Address> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex_part.len() != 40 {
        return Err(Error::InvalidRequest(format!(
            "address must be 20 bytes of hex, got '{}'",
            input
        )));
    }

    let bytes = hex::decode(hex_part)
        .map_err(|e| Error::InvalidRequest(format!("invalid address '{}': {}", input, e)))?;
    Ok(Address::from_slice(&bytes))
}

/// Lower-case `0x` hex rendering of an address
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

/// Whether a stored address string names `address`, in any hex casing
pub fn same_address(stored: &str, address: &Address) -> bool {
    parse_address(stored).map_or(false, |parsed| parsed == *address)
}

/// EIP-55 mixed-case checksum rendering of an address
pub fn checksum_address(address: &Address) -> String {
    let lower = hex::encode(address.as_bytes());
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a `0x` hex quantity returned by JSON-RPC
pub fn parse_hex_u256(input: &str) -> Result<U256> {
    let hex_part = input.trim().trim_start_matches("0x");
    if hex_part.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(hex_part, 16)
        .map_err(|e| Error::Rpc(format!("invalid hex quantity '{}': {}", input, e)))
}

/// Parse a `0x` hex quantity that must fit in u64
pub fn parse_hex_u64(input: &str) -> Result<u64> {
    let hex_part = input.trim().trim_start_matches("0x");
    if hex_part.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(hex_part, 16)
        .map_err(|e| Error::Rpc(format!("invalid hex quantity '{}': {}", input, e)))
}
